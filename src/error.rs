use thiserror::Error;

/// Crate error. Protocol modules keep their own error types, wrapped transparently here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not Found")]
    NotFound,
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Timeout")]
    Timeout,
    #[error("Bus Closed")]
    Closed,
    #[error("Invalid Configuration: {0}")]
    Config(String),
    #[error(transparent)]
    IsoTPError(#[from] crate::isotp::error::Error),
    #[error(transparent)]
    UDSError(#[from] crate::uds::Error),
    #[error(transparent)]
    XcpError(#[from] crate::xcp::Error),
    #[error(transparent)]
    DoIpError(#[from] crate::doip::Error),
    #[error(transparent)]
    ShellError(#[from] crate::shell::Error),
    #[error(transparent)]
    SignalError(#[from] crate::signal::Error),
    #[error(transparent)]
    ImageError(#[from] crate::image::Error),
    #[error(transparent)]
    FlashError(#[from] crate::flash::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tokio_stream::Elapsed> for Error {
    fn from(_: tokio_stream::Elapsed) -> Error {
        Error::Timeout
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::Timeout
    }
}
