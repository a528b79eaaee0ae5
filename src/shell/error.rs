//! Error types for the command shell transport.
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The target answered a command with an `ERR` status line
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("Line Too Long: {0} bytes")]
    LineTooLong(usize),
    #[error("Connection Closed")]
    Eof,
}
