use strum_macros::FromRepr;

/// Protocol control information in the high nibble of the first byte
pub(crate) const FRAME_TYPE_MASK: u8 = 0xf0;

#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum FrameType {
    Single = 0x00,
    First = 0x10,
    Consecutive = 0x20,
    FlowControl = 0x30,
    Unknown = 0xff,
}

impl From<u8> for FrameType {
    fn from(pci: u8) -> FrameType {
        FrameType::from_repr(pci & FRAME_TYPE_MASK).unwrap_or(FrameType::Unknown)
    }
}

/// Flow status carried in the low nibble of a flow control frame
#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum FlowStatus {
    ContinueToSend = 0x0,
    Wait = 0x1,
    Overflow = 0x2,
    Unknown = 0xff,
}

impl From<u8> for FlowStatus {
    fn from(pci: u8) -> FlowStatus {
        FlowStatus::from_repr(pci & 0x0f).unwrap_or(FlowStatus::Unknown)
    }
}
