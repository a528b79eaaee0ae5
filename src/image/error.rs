//! Error types for firmware images.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Line {line}: Invalid Record")]
    InvalidRecord { line: usize },
    #[error("Line {line}: Unsupported Record Type S{kind}")]
    UnsupportedRecord { line: usize, kind: char },
    /// Stored checksum differs from the ones' complement of the record sum
    #[error("Line {line}: Checksum Mismatch")]
    Checksum { line: usize },
    #[error("Empty Image")]
    Empty,
}
