use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ecutool::can::{AsyncCanAdapter, BusHandle, Frame, Identifier, VirtualBus};
use ecutool::flash::{connect, FlashLoader, StepKind, TargetConfig, TransportVariant};
use ecutool::image::Image;
use tokio_stream::StreamExt;

const SEED: [u8; 4] = [0x5e, 0xed, 0x12, 0x34];
const RAM: u8 = 0x00;
const FLASH: u8 = 0x01;

/// XCP slave with a programming resource. Memory is keyed by address extension and address.
#[derive(Default)]
struct Slave {
    memory: BTreeMap<(u8, u32), u8>,
    mta: (u8, u32),
    /// Command code of every request, in arrival order
    log: Vec<u8>,
    /// Every SET_MTA in arrival order
    mtas: Vec<(u8, u32)>,
    cleared: Vec<(u32, u32)>,
    launched: bool,
    corrupt_flash_upload: bool,
    fail_clear: bool,
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn handle(slave: &mut Slave, request: &[u8]) -> Vec<u8> {
    if let Some(code) = request.first() {
        slave.log.push(*code);
    }
    match request {
        [0xff, _] => vec![0xff, 0x15, 0x00, 0x08, 0x00, 0x08, 0x01, 0x01],
        [0xf8, 0x00, _] => {
            let mut response = vec![0xff, SEED.len() as u8];
            response.extend(SEED);
            response
        }
        [0xf7, 4, key @ ..] if key == SEED => vec![0xff, 0x00],
        [0xf7, ..] => vec![0xfe, 0x25],
        [0xd2] => vec![0xff, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00],
        [0xf6, _, _, extension, address @ ..] if address.len() == 4 => {
            slave.mta = (*extension, be32(address));
            slave.mtas.push(slave.mta);
            vec![0xff]
        }
        [0xf0, n, data @ ..] if data.len() == *n as usize => {
            let (extension, address) = slave.mta;
            for (i, byte) in data.iter().enumerate() {
                slave.memory.insert((extension, address + i as u32), *byte);
            }
            slave.mta.1 += data.len() as u32;
            vec![0xff]
        }
        [0xf5, n] => {
            let (extension, address) = slave.mta;
            let mut response = vec![0xff];
            for i in 0..*n as u32 {
                response.push(slave.memory.get(&(extension, address + i)).copied().unwrap_or(0xff));
            }
            if slave.corrupt_flash_upload && extension == FLASH && *n > 0 {
                response[1] ^= 0xff;
            }
            slave.mta.1 += *n as u32;
            response
        }
        [0xd1, _, _, _, length @ ..] if length.len() == 4 => {
            if slave.fail_clear {
                return vec![0xfe, 0x23];
            }
            let (extension, start) = slave.mta;
            let end = start + be32(length);
            slave
                .memory
                .retain(|&(e, address), _| e != extension || address < start || address >= end);
            slave.cleared.push((start, be32(length)));
            vec![0xff]
        }
        [0xcf] => {
            slave.launched = true;
            vec![0xff]
        }
        _ => vec![0xfe, 0x20],
    }
}

/// Slave answering on 0x555 to commands on 0x554.
async fn spawn_slave(medium: &VirtualBus, slave: Arc<Mutex<Slave>>) {
    let adapter = AsyncCanAdapter::new(BusHandle::new(0, medium.endpoint(0)));
    let mut requests =
        Box::pin(adapter.recv_filter(|frame| frame.id == Identifier::Standard(0x554) && !frame.loopback));

    tokio::spawn(async move {
        while let Some(request) = requests.next().await {
            let response = {
                let mut slave = slave.lock().unwrap();
                handle(&mut slave, &request.data)
            };
            let frame = Frame::new(0, Identifier::Standard(0x555), &response).unwrap();
            if adapter.send(&frame).await.is_err() {
                break;
            }
        }
    });
    tokio::task::yield_now().await;
}

fn write_images(dir: &Path) -> TargetConfig {
    let mut app = Image::new();
    app.append(0x0800_0000, &(0..300).map(|i| (i * 3) as u8).collect::<Vec<u8>>());
    app.append(0x0800_0400, &[0xc3; 20]);
    app.dump(dir.join("app.s19")).unwrap();

    let mut driver = Image::new();
    driver.append(0x2000_0000, &(0..64).collect::<Vec<u8>>());
    driver.dump(dir.join("flsdrv.s19")).unwrap();

    let mut config = TargetConfig::new(TransportVariant::XcpOnCan, dir.join("app.s19"));
    config.flash_driver = Some(dir.join("flsdrv.s19"));
    config.dump_dir = dir.to_path_buf();
    config
}

fn collapse(log: &[u8]) -> Vec<u8> {
    let mut codes = log.to_vec();
    codes.dedup();
    codes
}

#[tokio::test]
async fn xcp_flash_and_verify() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());

    let medium = VirtualBus::new();
    let slave = Arc::new(Mutex::new(Slave::default()));
    spawn_slave(&medium, slave.clone()).await;

    let bus = BusHandle::new(0, medium.endpoint(0));
    let mut loader = FlashLoader::new(config.clone(), connect(&config, Some(&bus)).unwrap());
    loader.set_step_enabled(StepKind::CheckFlashDriver, true).unwrap();
    loader.set_step_enabled(StepKind::CheckApplication, true).unwrap();

    let summary = loader.run().await.unwrap();
    assert_eq!(summary.total, 2 * (320 + 64));

    let slave = slave.lock().unwrap();
    #[rustfmt::skip]
    let expected = vec![
        0xff,                                     // connect
        0xf8, 0xf7, 0xf8, 0xf7, 0xd2,             // unlock PGM and CAL/PAG, program start
        0xf6, 0xf0, 0xf6, 0xf5,                   // flash driver download and check
        0xf6, 0xd1,                               // erase
        0xf6, 0xf0, 0xf6, 0xf0, 0xf6, 0xf0,       // both sections, then the signature
        0xf6, 0xf5, 0xf6, 0xf5,                   // application check
        0xcf,                                     // launch
    ];
    assert_eq!(collapse(&slave.log), expected);

    let flash_mtas: Vec<u32> = slave
        .mtas
        .iter()
        .filter(|(extension, _)| *extension == FLASH)
        .map(|(_, address)| *address)
        .collect();
    assert_eq!(
        flash_mtas,
        vec![0x0800_0000, 0x0800_0008, 0x0800_0400, 0x0800_0000, 0x0800_0000, 0x0800_0400]
    );
    assert_eq!(slave.cleared, vec![(0x0800_0000, 0x600)]);
    assert!(slave.launched);

    // absolute flash driver addresses
    assert_eq!(slave.memory.get(&(RAM, 0x2000_0000)), Some(&0));
    assert_eq!(slave.memory.get(&(RAM, 0x2000_003f)), Some(&63));

    let app = Image::load(dir.path().join("app.s19")).unwrap();
    for section in app.sections() {
        let written: Vec<u8> = (0..section.size() as u32)
            .map(|i| slave.memory[&(FLASH, section.address + i)])
            .collect();
        assert_eq!(written, section.data);
    }

    let readback = Image::load(dir.path().join("read_app.s19")).unwrap();
    assert_eq!(readback.sections(), app.sections());
    assert!(dir.path().join("read_flsdrv.s19").exists());
}

#[tokio::test]
async fn xcp_verify_mismatch_dumps_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());

    let medium = VirtualBus::new();
    let slave = Arc::new(Mutex::new(Slave {
        corrupt_flash_upload: true,
        ..Slave::default()
    }));
    spawn_slave(&medium, slave.clone()).await;

    let bus = BusHandle::new(0, medium.endpoint(0));
    let mut loader = FlashLoader::new(config.clone(), connect(&config, Some(&bus)).unwrap());
    loader.set_step_enabled(StepKind::CheckApplication, true).unwrap();

    match loader.run().await {
        Err(ecutool::Error::FlashError(ecutool::flash::Error::StepFailed { step, reason })) => {
            assert_eq!(step, StepKind::CheckApplication);
            assert!(reason.contains("0x08000000"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }

    let app = Image::load(dir.path().join("app.s19")).unwrap();
    let readback = Image::load(dir.path().join("read_app.s19")).unwrap();
    let first = &readback.sections()[0];
    assert_eq!(first.address, 0x0800_0000);
    assert_eq!(first.size(), app.sections()[0].size());
    assert_eq!(first.data[0], app.sections()[0].data[0] ^ 0xff);

    let slave = slave.lock().unwrap();
    assert!(!slave.launched);
    assert_eq!(slave.log.last(), Some(&0xf5));
}

#[tokio::test]
async fn xcp_failed_erase_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_images(dir.path());

    let medium = VirtualBus::new();
    let slave = Arc::new(Mutex::new(Slave {
        fail_clear: true,
        ..Slave::default()
    }));
    spawn_slave(&medium, slave.clone()).await;

    let bus = BusHandle::new(0, medium.endpoint(0));
    let mut loader = FlashLoader::new(config.clone(), connect(&config, Some(&bus)).unwrap());
    let result = loader.run().await;

    assert!(matches!(
        result,
        Err(ecutool::Error::FlashError(ecutool::flash::Error::StepFailed {
            step: StepKind::RoutineEraseFlash,
            ..
        }))
    ));

    let slave = slave.lock().unwrap();
    assert_eq!(slave.log.last(), Some(&0xd1));
    assert!(slave.memory.keys().all(|(extension, _)| *extension == RAM));
    assert!(!slave.launched);
    assert!(!dir.path().join("read_app.s19").exists());
}
