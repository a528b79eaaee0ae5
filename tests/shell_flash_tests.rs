use std::collections::BTreeMap;
use std::path::Path;

use ecutool::flash::{FlashLoader, ShellProgrammer, StepKind, TargetConfig, TransportVariant};
use ecutool::image::Image;
use ecutool::shell::ShellTransport;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// Target shell acknowledging every line with `OK`, or `ERR` for `erase` when `locked`. Returns the received lines.
fn spawn_target(stream: DuplexStream, locked: bool) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut received = vec![];

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_owned();
            let reply: &[u8] = if locked && line.starts_with("erase") {
                b"ERR flash locked\r\n"
            } else {
                b"OK\r\n"
            };
            received.push(line);
            if write.write_all(reply).await.is_err() {
                break;
            }
        }
        received
    })
}

fn write_images(dir: &Path) -> TargetConfig {
    let mut app = Image::new();
    app.append(0x0800_0000, &(0..300).map(|i| (i * 5) as u8).collect::<Vec<u8>>());
    app.append(0x0800_0400, &[0x3c; 20]);
    app.dump(dir.join("app.s19")).unwrap();

    let mut driver = Image::new();
    driver.append(0x2000_0000, &[0x11; 64]);
    driver.dump(dir.join("flsdrv.s19")).unwrap();

    let mut config = TargetConfig::new(TransportVariant::CmdOnCom, dir.join("app.s19"));
    config.flash_driver = Some(dir.join("flsdrv.s19"));
    config.dump_dir = dir.to_path_buf();
    config
}

fn loader(config: &TargetConfig, host: DuplexStream) -> FlashLoader {
    let programmer = ShellProgrammer::new(ShellTransport::new(host), config.write_granularity);
    FlashLoader::new(config.clone(), Box::new(programmer))
}

fn parse_address(word: &str) -> u32 {
    u32::from_str_radix(word.trim_start_matches("0x"), 16).unwrap()
}

#[tokio::test]
async fn shell_flash_order() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());

    let (host, target) = tokio::io::duplex(8192);
    let target = spawn_target(target, false);

    let mut loader = loader(&config, host);
    let summary = loader.run().await.unwrap();
    assert_eq!(summary.total, 320 + 64);
    drop(loader);

    let received = target.await.unwrap();
    let verbs: Vec<&str> = received.iter().map(|line| line.split(' ').next().unwrap()).collect();
    assert_eq!(verbs, vec!["load", "erase", "write", "write", "write"]);
    assert_eq!(received[1], "erase 0x8000000 0x600");

    let mut flash = BTreeMap::new();
    let mut addresses = vec![];
    for line in received.iter().filter(|line| line.starts_with("write")) {
        let words: Vec<&str> = line.split(' ').collect();
        let address = parse_address(words[1]);
        let data = hex::decode(words[2]).unwrap();
        // whole write units
        assert_eq!(data.len() % 8, 0);
        addresses.push(address);
        for (i, byte) in data.iter().enumerate() {
            flash.insert(address + i as u32, *byte);
        }
    }
    // the signature goes last
    assert_eq!(addresses, vec![0x0800_0008, 0x0800_0400, 0x0800_0000]);

    let app = Image::load(dir.path().join("app.s19")).unwrap();
    for section in app.sections() {
        let written: Vec<u8> = (0..section.size() as u32).map(|i| flash[&(section.address + i)]).collect();
        assert_eq!(written, section.data);
    }
    // padding of the short second section
    assert_eq!(flash.get(&0x0800_0414), Some(&0xff));
}

#[tokio::test]
async fn shell_err_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());

    let (host, target) = tokio::io::duplex(8192);
    let target = spawn_target(target, true);

    let mut loader = loader(&config, host);
    match loader.run().await {
        Err(ecutool::Error::FlashError(ecutool::flash::Error::StepFailed { step, reason })) => {
            assert_eq!(step, StepKind::RoutineEraseFlash);
            assert!(reason.contains("flash locked"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }
    drop(loader);

    let received = target.await.unwrap();
    assert_eq!(received.len(), 2);
    assert!(received[0].starts_with("load 0x20000000 "));
    assert!(received[1].starts_with("erase"));
}

#[tokio::test]
async fn shell_has_no_verify_or_launch() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());
    let (host, _target) = tokio::io::duplex(64);

    let mut loader = loader(&config, host);
    let steps: Vec<StepKind> = loader.steps().iter().map(|(step, _)| *step).collect();
    assert_eq!(
        steps,
        vec![
            StepKind::ResetTransmitProtocol,
            StepKind::DownloadFlashDriver,
            StepKind::RoutineEraseFlash,
            StepKind::DownloadApplication,
        ]
    );
    assert!(loader.set_enabled("check application", true).is_err());
    assert!(loader.set_enabled("launch application", true).is_err());
}
