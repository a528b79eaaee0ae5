use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Payload exceeds the 4095 bytes a first frame can announce")]
    DataTooLarge,
    /// Expected a flow control frame, or the receiver reported an overflow
    #[error("Flow control refused the transfer")]
    FlowControl,
    #[error("Consecutive frame out of order")]
    OutOfOrder,
    #[error("Unknown frame type")]
    UnknownFrameType,
    #[error("Malformed frame")]
    MalformedFrame,
}
