//! Constants for Diagnostics over IP, as defined in ISO 13400-2.

pub static PROTOCOL_VERSION: u8 = 0x02;
pub static HEADER_LEN: usize = 8;
pub static DEFAULT_PORT: u16 = 13400;

/// Generic header payload types
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u16)]
pub enum PayloadType {
    GenericNack = 0x0000,
    RoutingActivationRequest = 0x0005,
    RoutingActivationResponse = 0x0006,
    AliveCheckRequest = 0x0007,
    AliveCheckResponse = 0x0008,
    DiagnosticMessage = 0x8001,
    DiagnosticMessageAck = 0x8002,
    DiagnosticMessageNack = 0x8003,
    Unknown = 0xffff,
}

impl From<u16> for PayloadType {
    fn from(val: u16) -> PayloadType {
        match val {
            0x0000 => PayloadType::GenericNack,
            0x0005 => PayloadType::RoutingActivationRequest,
            0x0006 => PayloadType::RoutingActivationResponse,
            0x0007 => PayloadType::AliveCheckRequest,
            0x0008 => PayloadType::AliveCheckResponse,
            0x8001 => PayloadType::DiagnosticMessage,
            0x8002 => PayloadType::DiagnosticMessageAck,
            0x8003 => PayloadType::DiagnosticMessageNack,
            _ => PayloadType::Unknown,
        }
    }
}

pub static ACTIVATION_TYPE_DEFAULT: u8 = 0x00;
pub static ACTIVATION_SUCCESS: u8 = 0x10;
pub static ACTIVATION_CONFIRMATION_REQUIRED: u8 = 0x11;
