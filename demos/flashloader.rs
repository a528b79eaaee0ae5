//! Flash an application image.
//!
//! `flashloader --transport "UDS on DOIP" --misc 192.168.1.10:13400 --flash-driver flsdrv.s19 app.s19`
//! or `flashloader -t "CMD on COM" --misc /dev/ttyUSB0 --baud-rate 115200 app.s19`.
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use ecutool::can::{BusHandle, VirtualBus};
use ecutool::flash::{connect, EraseGranularity, FlashEvent, FlashLoader, TargetConfig, TransportVariant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Application S-record file
    application: PathBuf,

    /// Transport variant, e.g. "UDS on CAN", "UDS on CANFD", "UDS on DOIP", "XCP on CAN" or "CMD on COM"
    #[arg(short, long, default_value = "UDS on CAN")]
    transport: TransportVariant,

    /// Flash driver S-record file. Without it the flash driver download is skipped
    #[arg(short, long)]
    flash_driver: Option<PathBuf>,

    /// `host:port` for DoIP, serial device for the command shell
    #[arg(short, long, default_value = "")]
    misc: String,

    /// Erase sector size, or a list of sector start addresses such as `[0x0,0x800,0x1000]`
    #[arg(short, long, default_value = "512")]
    erase_granularity: EraseGranularity,

    /// Flash programming unit in bytes
    #[arg(short, long, default_value_t = 8)]
    write_granularity: usize,

    /// Bytes at the start of the application written last
    #[arg(short, long, default_value_t = 8)]
    signature_size: usize,

    /// Serial line speed of the command shell
    #[arg(short, long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Per request timeout in milliseconds, transport default when omitted
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Read back and compare the application after writing it
    #[arg(long)]
    verify: bool,

    /// Directory for the `read_<image>` dumps of the verification
    #[arg(long, default_value = ".")]
    dump_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ecutool::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = TargetConfig::new(args.transport, &args.application);
    config.flash_driver = args.flash_driver;
    config.misc = args.misc;
    config.erase_granularity = args.erase_granularity;
    config.write_granularity = args.write_granularity;
    config.signature_size = args.signature_size;
    config.baud_rate = args.baud_rate;
    config.timeout = args.timeout_ms.map(Duration::from_millis);
    config.dump_dir = args.dump_dir;

    // Hardware adapters implement ecutool::can::CanAdapter and are wrapped the same way
    let medium = VirtualBus::new();
    let bus = BusHandle::new(0, medium.endpoint(0));

    let mut loader = FlashLoader::new(config.clone(), connect(&config, Some(&bus))?);
    if config.flash_driver.is_none() {
        loader.set_enabled("download flash driver", false)?;
    }
    if args.verify {
        loader.set_enabled("check application", true)?;
    }
    loader.check()?;

    let mut events = loader.subscribe();
    let handle = loader.spawn();
    while let Some(event) = events.recv().await {
        match event {
            FlashEvent::Info(line) => println!("{}", line),
            FlashEvent::Progress(percent) => eprint!("\r{:3}%", percent),
        }
    }
    eprintln!();

    match handle.join() {
        Ok(result) => {
            let summary = result?;
            println!("flashed {} bytes at {} B/s", summary.total, summary.speed());
        }
        Err(_) => eprintln!("flash thread panicked"),
    }
    Ok(())
}
