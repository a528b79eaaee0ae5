//! Error types for the DoIP transport.
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// Version byte and its inverse do not match, or the payload length is implausible
    #[error("Invalid Header")]
    InvalidHeader,
    #[error("Invalid Address: {0}")]
    InvalidAddress(String),
    #[error("Routing Activation Denied: {0:#04x}")]
    RoutingActivationDenied(u8),
    #[error("Generic Nack: {0:#04x}")]
    GenericNack(u8),
    #[error("Diagnostic Message Nack: {0:#04x}")]
    DiagnosticNack(u8),
    #[error("Unexpected Payload Type: {0:#06x}")]
    UnexpectedPayload(u16),
}
