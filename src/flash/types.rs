//! Target configuration and the fixed step tables of each protocol family.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use strum_macros::{Display, EnumIter, EnumString};

use crate::error::Error;

pub const DEFAULT_ERASE_GRANULARITY: u32 = 512;
pub const DEFAULT_WRITE_GRANULARITY: usize = 8;
pub const DEFAULT_SIGNATURE_SIZE: usize = 8;
/// Largest diagnostic request accepted by the bootloader
pub const DEFAULT_CAPACITY: usize = 4096;
pub const DOIP_CAPACITY: usize = 1400;

/// Transport a flash run talks through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportVariant {
    #[strum(serialize = "UDS on CAN")]
    #[cfg_attr(feature = "serde", serde(rename = "UDS on CAN"))]
    UdsOnCan,
    #[strum(serialize = "UDS on CANFD")]
    #[cfg_attr(feature = "serde", serde(rename = "UDS on CANFD"))]
    UdsOnCanFd,
    #[strum(serialize = "UDS on USBCAN")]
    #[cfg_attr(feature = "serde", serde(rename = "UDS on USBCAN"))]
    UdsOnUsbCan,
    #[strum(serialize = "UDS on DOIP")]
    #[cfg_attr(feature = "serde", serde(rename = "UDS on DOIP"))]
    UdsOnDoIp,
    #[strum(serialize = "XCP on CAN")]
    #[cfg_attr(feature = "serde", serde(rename = "XCP on CAN"))]
    XcpOnCan,
    /// Shell commands on a serial device, the device path is taken from the misc parameter
    #[strum(serialize = "CMD on COM")]
    #[cfg_attr(feature = "serde", serde(rename = "CMD on COM"))]
    CmdOnCom,
}

impl TransportVariant {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            TransportVariant::XcpOnCan => ProtocolFamily::Xcp,
            TransportVariant::CmdOnCom => ProtocolFamily::Cmd,
            _ => ProtocolFamily::Uds,
        }
    }

    pub fn default_capacity(&self) -> usize {
        match self {
            TransportVariant::UdsOnDoIp => DOIP_CAPACITY,
            _ => DEFAULT_CAPACITY,
        }
    }

    /// True for variants that need a CAN bus handle.
    pub fn uses_can(&self) -> bool {
        !matches!(self, TransportVariant::UdsOnDoIp | TransportVariant::CmdOnCom)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtocolFamily {
    Uds,
    Xcp,
    Cmd,
}

impl ProtocolFamily {
    /// Supported steps in execution order, with their default enable state.
    pub fn steps(&self) -> &'static [(StepKind, bool)] {
        match self {
            ProtocolFamily::Uds => UDS_STEPS,
            ProtocolFamily::Xcp => XCP_STEPS,
            ProtocolFamily::Cmd => CMD_STEPS,
        }
    }
}

/// One named phase of a flash run. The display name is what callers toggle steps by.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StepKind {
    #[strum(serialize = "enter extend session")]
    EnterExtendSession,
    #[strum(serialize = "security extds access")]
    SecurityExtdsAccess,
    #[strum(serialize = "enter program session")]
    EnterProgramSession,
    #[strum(serialize = "reset transmit protocol")]
    ResetTransmitProtocol,
    #[strum(serialize = "security prgs access")]
    SecurityPrgsAccess,
    #[strum(serialize = "download flash driver")]
    DownloadFlashDriver,
    #[strum(serialize = "check flash driver")]
    CheckFlashDriver,
    #[strum(serialize = "routine erase flash")]
    RoutineEraseFlash,
    #[strum(serialize = "download application")]
    DownloadApplication,
    #[strum(serialize = "check application")]
    CheckApplication,
    #[strum(serialize = "launch application")]
    LaunchApplication,
}

static UDS_STEPS: &[(StepKind, bool)] = &[
    (StepKind::EnterExtendSession, true),
    (StepKind::SecurityExtdsAccess, true),
    (StepKind::EnterProgramSession, true),
    (StepKind::ResetTransmitProtocol, false),
    (StepKind::SecurityPrgsAccess, true),
    (StepKind::DownloadFlashDriver, true),
    (StepKind::CheckFlashDriver, false),
    (StepKind::RoutineEraseFlash, true),
    (StepKind::DownloadApplication, true),
    (StepKind::CheckApplication, false),
    (StepKind::LaunchApplication, true),
];

static XCP_STEPS: &[(StepKind, bool)] = &[
    (StepKind::EnterProgramSession, true),
    (StepKind::ResetTransmitProtocol, false),
    (StepKind::SecurityPrgsAccess, true),
    (StepKind::DownloadFlashDriver, true),
    (StepKind::CheckFlashDriver, false),
    (StepKind::RoutineEraseFlash, true),
    (StepKind::DownloadApplication, true),
    (StepKind::CheckApplication, false),
    (StepKind::LaunchApplication, true),
];

static CMD_STEPS: &[(StepKind, bool)] = &[
    (StepKind::ResetTransmitProtocol, false),
    (StepKind::DownloadFlashDriver, true),
    (StepKind::RoutineEraseFlash, true),
    (StepKind::DownloadApplication, true),
];

/// Smallest erasable unit: a fixed sector size, or the ascending start addresses of the sectors.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum EraseGranularity {
    Size(u32),
    Boundaries(Vec<u32>),
}

impl Default for EraseGranularity {
    fn default() -> Self {
        EraseGranularity::Size(DEFAULT_ERASE_GRANULARITY)
    }
}

fn parse_int(s: &str) -> Result<u32, Error> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| Error::Config(format!("invalid number '{}'", s)))
}

/// Accepts `512`, `0x200`, or a list such as `[0x0, 0x800, 0x1000]`.
impl FromStr for EraseGranularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        let list = s
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .or_else(|| s.contains(',').then_some(s));

        match list {
            Some(list) => {
                let boundaries = list
                    .split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(parse_int)
                    .collect::<Result<Vec<u32>, Error>>()?;
                Ok(EraseGranularity::Boundaries(boundaries))
            }
            None => Ok(EraseGranularity::Size(parse_int(s)?)),
        }
    }
}

impl EraseGranularity {
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            EraseGranularity::Size(0) => Err("erase granularity must not be 0".to_owned()),
            EraseGranularity::Size(_) => Ok(()),
            EraseGranularity::Boundaries(b) if b.is_empty() => Err("erase boundary list is empty".to_owned()),
            EraseGranularity::Boundaries(b) if b.windows(2).any(|w| w[0] >= w[1]) => {
                Err("erase boundaries must be strictly ascending".to_owned())
            }
            EraseGranularity::Boundaries(_) => Ok(()),
        }
    }

    /// Align `[start, end)` outward. A boundary list only moves the end, to the first boundary at or after it.
    pub fn align(&self, start: u64, end: u64) -> (u64, u64) {
        match self {
            EraseGranularity::Size(size) => {
                let size = (*size).max(1) as u64;
                (start / size * size, end.div_ceil(size) * size)
            }
            EraseGranularity::Boundaries(boundaries) => {
                let end = boundaries
                    .iter()
                    .map(|b| *b as u64)
                    .find(|b| end <= *b)
                    .unwrap_or(end);
                (start, end)
            }
        }
    }
}

/// Everything a flash run needs to know about the target.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetConfig {
    pub variant: TransportVariant,
    /// S-record file of the application
    pub application: PathBuf,
    /// S-record file of the flash driver, required when a flash driver step is enabled
    pub flash_driver: Option<PathBuf>,
    pub erase_granularity: EraseGranularity,
    /// Flash programming unit, downloads are padded with 0xFF to a multiple of it
    pub write_granularity: usize,
    /// Bytes at the start of the application written last
    pub signature_size: usize,
    /// Largest request the transport carries
    pub capacity: usize,
    /// Variant specific parameter: `host:port` for DoIP, the device path for the command shell
    pub misc: String,
    /// Line speed of the command shell serial port
    pub baud_rate: u32,
    /// Per request timeout of the transport, its own default when unset
    pub timeout: Option<Duration>,
    /// Directory the `read_<image>` verification dumps are written to
    pub dump_dir: PathBuf,
}

impl TargetConfig {
    pub fn new(variant: TransportVariant, application: impl Into<PathBuf>) -> Self {
        Self {
            variant,
            application: application.into(),
            flash_driver: None,
            erase_granularity: EraseGranularity::default(),
            write_granularity: DEFAULT_WRITE_GRANULARITY,
            signature_size: DEFAULT_SIGNATURE_SIZE,
            capacity: variant.default_capacity(),
            misc: String::new(),
            baud_rate: crate::shell::DEFAULT_BAUD_RATE,
            timeout: None,
            dump_dir: PathBuf::from("."),
        }
    }
}

/// Block sequence counter of TransferData. Starts at 1 and wraps from 255 back to 1, never 0.
#[derive(Debug, Clone)]
pub struct BlockSequenceCounter(u8);

impl Default for BlockSequenceCounter {
    fn default() -> Self {
        Self(1)
    }
}

impl BlockSequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Iterator for BlockSequenceCounter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let current = self.0;
        self.0 = if current == u8::MAX { 1 } else { current + 1 };
        Some(current)
    }
}

pub(crate) fn round_up(size: usize, granularity: usize) -> usize {
    size.div_ceil(granularity.max(1)) * granularity.max(1)
}
