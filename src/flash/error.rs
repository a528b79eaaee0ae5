//! Error types for the flashloader.
use thiserror::Error;

use crate::flash::StepKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Unknown step: {0}")]
    UnknownStep(String),
    #[error("Step not supported by this protocol: {0}")]
    Unsupported(StepKind),
    #[error("Erase range {start:#x}..{end:#x} exceeds the 32 bit address space")]
    AddressOutOfRange { start: u64, end: u64 },
    #[error("Read back differs from image at {address:#010x}")]
    VerifyMismatch { address: u64 },
    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: StepKind, reason: String },
}
