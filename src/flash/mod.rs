//! ECU flashloader. Drives a bootloader through session entry, security unlock, erase, download, verification and launch.
//!
//! The step list is fixed per protocol family, see [`ProtocolFamily::steps`]. Steps can be toggled by name before a run,
//! and the first failing step aborts the run.
//!
//! ## Example
//! ```rust
//! use ecutool::flash::{connect, FlashLoader, TargetConfig, TransportVariant};
//!
//! async fn flash_example(bus: ecutool::can::BusHandle) -> ecutool::Result<()> {
//!     let mut config = TargetConfig::new(TransportVariant::UdsOnCan, "app.s19");
//!     config.flash_driver = Some("flsdrv.s19".into());
//!
//!     let programmer = connect(&config, Some(&bus))?;
//!     let mut loader = FlashLoader::new(config, programmer);
//!     loader.set_enabled("check application", true)?;
//!
//!     let summary = loader.run().await?;
//!     println!("{} bytes in {:?}", summary.total, summary.elapsed);
//!     Ok(())
//! }
//! ```

mod cmd;
pub mod error;
mod programmer;
mod types;
mod uds;
mod xcp;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::error;

use crate::can::{BusHandle, Identifier};
use crate::doip::{DoIpConfig, DoIpTransport};
use crate::image::Image;
use crate::isotp::{IsoTPAdapter, IsoTPConfig};
use crate::shell::ShellTransport;
use crate::xcp::{XcpConfig, XcpOnCan};
use crate::Result;

pub use cmd::ShellProgrammer;
pub use error::Error;
pub use programmer::{FlashEvent, Memory, Programmer, Reporter, Session};
pub use types::*;
pub use uds::UdsProgrammer;
pub use xcp::XcpProgrammer;

const UDS_TX_ID: u32 = 0x732;
const UDS_RX_ID: u32 = 0x731;
const CANFD_TX_DL: usize = 64;

/// Create the programmer for the configured transport variant. No I/O happens until the run opens it.
pub fn connect(config: &TargetConfig, bus: Option<&BusHandle>) -> Result<Box<dyn Programmer>> {
    let variant = config.variant;
    let programmer: Box<dyn Programmer> = match (variant, bus) {
        (TransportVariant::UdsOnCan | TransportVariant::UdsOnUsbCan | TransportVariant::UdsOnCanFd, Some(bus)) => {
            let mut isotp = IsoTPConfig::with_ids(bus.bus(), Identifier::Standard(UDS_TX_ID), Identifier::Standard(UDS_RX_ID));
            if variant == TransportVariant::UdsOnCanFd {
                isotp.tx_dl = CANFD_TX_DL;
            }
            isotp.timeout = config.timeout.unwrap_or(isotp.timeout);
            let transport = IsoTPAdapter::from_bus(bus, isotp);
            Box::new(UdsProgrammer::new(transport, config.capacity, config.write_granularity))
        }
        (TransportVariant::XcpOnCan, Some(bus)) => {
            let mut xcp = XcpConfig {
                bus: bus.bus(),
                ..XcpConfig::default()
            };
            xcp.timeout = config.timeout.unwrap_or(xcp.timeout);
            Box::new(XcpProgrammer::new(XcpOnCan::from_bus(bus, xcp)))
        }
        (TransportVariant::UdsOnDoIp, _) => {
            let mut doip = DoIpConfig::from_address(&config.misc)?;
            doip.timeout = config.timeout.unwrap_or(doip.timeout);
            let transport = DoIpTransport::new(doip);
            Box::new(UdsProgrammer::new(transport, config.capacity, config.write_granularity))
        }
        (TransportVariant::CmdOnCom, _) => {
            let mut transport = ShellTransport::open_serial(&config.misc, config.baud_rate)?;
            if let Some(timeout) = config.timeout {
                transport = transport.with_timeout(timeout);
            }
            Box::new(ShellProgrammer::new(transport, config.write_granularity))
        }
        (variant, None) => return Err(crate::Error::Config(format!("{} requires a CAN bus", variant))),
    };
    Ok(programmer)
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Bytes planned for transfer across all enabled phases
    pub total: usize,
    pub elapsed: Duration,
}

impl Summary {
    /// Transfer rate in bytes per second.
    pub fn speed(&self) -> u64 {
        let millis = self.elapsed.as_millis().max(1) as u64;
        self.total as u64 * 1000 / millis
    }
}

/// Images loaded for one run.
struct Job {
    application: Image,
    application_path: PathBuf,
    flash_driver: Option<(Image, PathBuf)>,
}

/// The flash state machine. Owns one programmer and one target configuration.
pub struct FlashLoader {
    config: TargetConfig,
    programmer: Box<dyn Programmer>,
    steps: Vec<(StepKind, bool)>,
    reporter: Reporter,
}

impl FlashLoader {
    pub fn new(config: TargetConfig, programmer: Box<dyn Programmer>) -> Self {
        let steps = programmer.family().steps().to_vec();
        Self {
            config,
            programmer,
            steps,
            reporter: Reporter::default(),
        }
    }

    /// Stream of status and progress events. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<FlashEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reporter = Reporter::new(Some(tx));
        rx
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Steps of this run in execution order, with their enable state.
    pub fn steps(&self) -> &[(StepKind, bool)] {
        &self.steps
    }

    pub fn is_enabled(&self, step: StepKind) -> bool {
        self.steps.iter().any(|(s, enabled)| *s == step && *enabled)
    }

    pub fn set_step_enabled(&mut self, step: StepKind, enabled: bool) -> Result<()> {
        let entry = self
            .steps
            .iter_mut()
            .find(|(s, _)| *s == step)
            .ok_or_else(|| Error::UnknownStep(step.to_string()))?;
        entry.1 = enabled;
        Ok(())
    }

    /// Toggle a step by its display name, e.g. `"check application"`.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let step: StepKind = name.parse().map_err(|_| Error::UnknownStep(name.to_owned()))?;
        self.set_step_enabled(step, enabled)
    }

    fn needs_flash_driver(&self) -> bool {
        self.is_enabled(StepKind::DownloadFlashDriver) || self.is_enabled(StepKind::CheckFlashDriver)
    }

    /// Validate the configuration without touching the target.
    pub fn check(&self) -> Result<()> {
        let precondition = |message: String| -> Result<()> { Err(Error::Precondition(message).into()) };

        if self.config.write_granularity == 0 {
            return precondition("write granularity must not be 0".to_owned());
        }
        if let Err(message) = self.config.erase_granularity.validate() {
            return precondition(message);
        }
        if self.programmer.family() == ProtocolFamily::Uds && self.config.capacity < 5 + self.config.write_granularity {
            return precondition(format!(
                "capacity {} cannot carry a block of {} bytes",
                self.config.capacity, self.config.write_granularity
            ));
        }
        if !self.config.application.is_file() {
            return precondition(format!("application {} not found", self.config.application.display()));
        }
        if self.needs_flash_driver() {
            match &self.config.flash_driver {
                Some(path) if path.is_file() => {}
                Some(path) => return precondition(format!("flash driver {} not found", path.display())),
                None => return precondition("flash driver steps enabled without a flash driver".to_owned()),
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Job> {
        self.check()?;

        let load = |path: &Path| -> Result<Image> {
            let image = Image::load(path).map_err(|e| Error::Precondition(format!("{}: {}", path.display(), e)))?;
            if image.is_empty() {
                return Err(Error::Precondition(format!("{} contains no data", path.display())).into());
            }
            Ok(image)
        };

        let application = load(&self.config.application)?;
        let flash_driver = match (&self.config.flash_driver, self.needs_flash_driver()) {
            (Some(path), true) => Some((load(path)?, path.clone())),
            _ => None,
        };

        Ok(Job {
            application,
            application_path: self.config.application.clone(),
            flash_driver,
        })
    }

    /// Bytes moved by the enabled transfer phases.
    fn total_size(&self, job: &Job) -> usize {
        let app = job.application.size();
        let driver = job.flash_driver.as_ref().map(|(image, _)| image.size()).unwrap_or(0);

        let mut total = app;
        if self.is_enabled(StepKind::DownloadFlashDriver) {
            total += driver;
        }
        if self.is_enabled(StepKind::CheckApplication) {
            total += app;
        }
        if self.is_enabled(StepKind::CheckFlashDriver) {
            total += driver;
        }
        total
    }

    /// Run every enabled step in order. Configuration errors are returned before the target is touched,
    /// a failing or panicking step ends the run with [`Error::StepFailed`].
    pub async fn run(&mut self) -> Result<Summary> {
        let job = self.load()?;
        let total = self.total_size(&job);
        self.reporter.start(total);
        self.reporter.info(format!(
            "summary transfer size is {} bytes (app {}, flsdrv {})",
            total,
            job.application.size(),
            job.flash_driver.as_ref().map(|(image, _)| image.size()).unwrap_or(0)
        ));

        let start = Instant::now();
        if let Err(e) = self.programmer.open().await {
            self.reporter.info(format!("  {}", e));
            self.reporter.info(">> boot failed <<");
            error!("Opening {} failed: {}", self.config.variant, e);
            return Err(e);
        }

        let steps: Vec<StepKind> = self.steps.iter().filter(|(_, enabled)| *enabled).map(|(s, _)| *s).collect();

        for step in steps {
            self.reporter.info(format!(">> {}", step));
            let outcome = std::panic::AssertUnwindSafe(self.run_step(step, &job))
                .catch_unwind()
                .await;

            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panicked".to_owned()),
            };

            self.reporter.info(format!("  {}", reason));
            self.reporter.info(">> boot failed <<");
            error!("Flashing aborted in '{}': {}", step, reason);
            return Err(Error::StepFailed { step, reason }.into());
        }

        let summary = Summary {
            total,
            elapsed: start.elapsed(),
        };
        self.reporter.info(format!(
            "cost {:.3}s, speed is {}bps",
            summary.elapsed.as_secs_f64(),
            summary.speed()
        ));
        self.reporter.finish();
        Ok(summary)
    }

    /// Run on a dedicated thread with its own runtime, so a front-end thread is never blocked.
    pub fn spawn(mut self) -> std::thread::JoinHandle<Result<Summary>> {
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            runtime.block_on(self.run())
        })
    }

    async fn run_step(&mut self, step: StepKind, job: &Job) -> Result<()> {
        let programmer = &mut self.programmer;
        let reporter = &mut self.reporter;

        match step {
            StepKind::EnterExtendSession => programmer.enter_session(Session::Extended).await?,
            StepKind::SecurityExtdsAccess => programmer.unlock(Session::Extended, reporter).await?,
            StepKind::EnterProgramSession => programmer.enter_session(Session::Programming).await?,
            StepKind::ResetTransmitProtocol => {
                reporter.info("reset protocol...");
                programmer.reset().await?
            }
            StepKind::SecurityPrgsAccess => programmer.unlock(Session::Programming, reporter).await?,
            StepKind::DownloadFlashDriver => {
                let (driver, _) = job.flash_driver.as_ref().ok_or(Error::Precondition("no flash driver loaded".to_owned()))?;
                let base = driver_base(&**programmer, driver);
                for section in driver.sections() {
                    let address = section.address.wrapping_sub(base);
                    programmer.download(Memory::FlashDriver, address, &section.data, reporter).await?;
                }
            }
            StepKind::CheckFlashDriver => {
                let (driver, path) = job.flash_driver.as_ref().ok_or(Error::Precondition("no flash driver loaded".to_owned()))?;
                let base = driver_base(&**programmer, driver);
                verify(&mut **programmer, reporter, Memory::FlashDriver, driver, base, &dump_path(&self.config.dump_dir, path)).await?;
            }
            StepKind::RoutineEraseFlash => {
                for (start, end) in erase_ranges(&job.application, &self.config.erase_granularity) {
                    let out_of_range = |_| Error::AddressOutOfRange { start, end };
                    let address = u32::try_from(start).map_err(out_of_range)?;
                    let length = u32::try_from(end - start).map_err(out_of_range)?;
                    reporter.info(format!(" erase @ address {:#x}, length {:#x}", address, length));
                    programmer.erase(address, length).await?;
                }
            }
            StepKind::DownloadApplication => {
                download_application(&mut **programmer, reporter, &job.application, self.config.signature_size).await?
            }
            StepKind::CheckApplication => {
                let dump = dump_path(&self.config.dump_dir, &job.application_path);
                verify(&mut **programmer, reporter, Memory::Application, &job.application, 0, &dump).await?;
            }
            StepKind::LaunchApplication => programmer.launch().await?,
        }

        reporter.info("  success");
        Ok(())
    }
}

fn driver_base(programmer: &dyn Programmer, driver: &Image) -> u32 {
    match (programmer.relative_driver_addresses(), driver.sections().first()) {
        (true, Some(first)) => first.address,
        _ => 0,
    }
}

fn dump_path(dir: &Path, source: &Path) -> PathBuf {
    let name = source.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    dir.join(format!("read_{}", name))
}

/// Address ranges to erase for `image`. One range over the whole image when it carries a terminator record,
/// otherwise one range per section for targets whose flash is not contiguous.
pub fn erase_ranges(image: &Image, granularity: &EraseGranularity) -> Vec<(u64, u64)> {
    if image.has_terminator() {
        image
            .extent()
            .map(|(start, end)| vec![granularity.align(start as u64, end)])
            .unwrap_or_default()
    } else {
        image
            .sections()
            .iter()
            .map(|section| granularity.align(section.address as u64, section.end()))
            .collect()
    }
}

/// Write every section, holding back the first `signature_size` bytes of the first section until everything else is written.
async fn download_application(
    programmer: &mut dyn Programmer,
    reporter: &mut Reporter,
    image: &Image,
    signature_size: usize,
) -> Result<()> {
    let sections = image.sections();
    let signature = sections.first().map(|s| signature_size.min(s.size())).unwrap_or(0);

    for (i, section) in sections.iter().enumerate() {
        let skip = if i == 0 { signature } else { 0 };
        if skip == section.size() {
            continue;
        }
        let address = section.address.wrapping_add(skip as u32);
        programmer.download(Memory::Application, address, &section.data[skip..], reporter).await?;
    }

    if let Some(first) = sections.first().filter(|_| signature > 0) {
        reporter.info(format!(" write signature @ {:#x}", first.address));
        programmer
            .download(Memory::Application, first.address, &first.data[..signature], reporter)
            .await?;
    }
    Ok(())
}

/// Read every section back and compare. The read back data is dumped to `dump` on success and on failure.
async fn verify(
    programmer: &mut dyn Programmer,
    reporter: &mut Reporter,
    memory: Memory,
    image: &Image,
    base: u32,
    dump: &Path,
) -> Result<()> {
    let mut readback = Image::new();

    for section in image.sections() {
        let data = match programmer
            .upload(memory, section.address.wrapping_sub(base), section.size(), reporter)
            .await
        {
            Ok(data) => data,
            Err(e) => {
                readback.dump(dump)?;
                return Err(e);
            }
        };
        readback.append(section.address, &data);

        if data != section.data {
            let offset = data
                .iter()
                .zip(&section.data)
                .position(|(a, b)| a != b)
                .unwrap_or(data.len().min(section.size()));
            readback.dump(dump)?;
            reporter.info(format!("  check failed, read back dumped to {}", dump.display()));
            return Err(Error::VerifyMismatch {
                address: section.address as u64 + offset as u64,
            }
            .into());
        }
    }

    readback.dump(dump)?;
    reporter.info("  check pass");
    Ok(())
}
