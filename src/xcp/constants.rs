//! Constants for the XCP client, as defined in ASAM MCD-1 XCP.
use strum_macros::FromRepr;

/// Packet identifier of a positive command response
pub static PID_RES: u8 = 0xff;
/// Packet identifier of an error packet
pub static PID_ERR: u8 = 0xfe;

/// Command codes of the standard, calibration and programming commands
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum CommandCode {
    Connect = 0xff,
    Disconnect = 0xfe,
    GetStatus = 0xfd,
    Synch = 0xfc,
    GetSeed = 0xf8,
    Unlock = 0xf7,
    SetMta = 0xf6,
    Upload = 0xf5,
    ShortUpload = 0xf4,
    Download = 0xf0,
    ProgramStart = 0xd2,
    ProgramClear = 0xd1,
    Program = 0xd0,
    ProgramReset = 0xcf,
}

/// Resource bits used by GET_SEED and UNLOCK
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum Resource {
    CalPag = 0x01,
    Daq = 0x04,
    Stim = 0x08,
    Pgm = 0x10,
}

/// Memory transfer address extension selecting the target memory
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum AddressExtension {
    Ram = 0x00,
    Flash = 0x01,
}

/// Error codes carried by an error packet
#[derive(Debug, PartialEq, Eq, Copy, Clone, FromRepr)]
#[repr(u8)]
pub enum ErrorCode {
    CmdSynch = 0x00,
    CmdPending = 0x01,
    CmdIgnored = 0x02,
    CmdBusy = 0x10,
    DaqActive = 0x11,
    PgmActive = 0x12,
    CmdUnknown = 0x20,
    CmdSyntax = 0x21,
    OutOfRange = 0x22,
    WriteProtected = 0x23,
    AccessDenied = 0x24,
    AccessLocked = 0x25,
    PageNotValid = 0x26,
    ModeNotValid = 0x27,
    SegmentNotValid = 0x28,
    Sequence = 0x29,
    DaqConfig = 0x2a,
    MemoryOverflow = 0x30,
    Generic = 0x31,
    Verify = 0x32,
    ResourceTemporaryNotAccessible = 0x33,
}
