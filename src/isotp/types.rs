use std::time::Duration;

use crate::can::Frame;
use crate::isotp::error::Error;

/// Parameters announced by the receiver in a flow control frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControlConfig {
    /// Consecutive frames allowed before the next flow control, 0 means unlimited
    pub block_size: u8,
    pub separation_time_min: Duration,
}

/// STmin encoding: 0x00-0x7F milliseconds, 0xF1-0xF9 hundreds of microseconds, the rest reserved.
fn separation_time(raw: u8) -> Option<Duration> {
    match raw {
        0x00..=0x7f => Some(Duration::from_millis(raw.into())),
        0xf1..=0xf9 => Some(Duration::from_micros(u64::from(raw - 0xf0) * 100)),
        _ => None,
    }
}

impl TryFrom<&Frame> for FlowControlConfig {
    type Error = crate::error::Error;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        match frame.data[..] {
            [_, block_size, st_min, ..] => Ok(Self {
                block_size,
                separation_time_min: separation_time(st_min).ok_or(Error::MalformedFrame)?,
            }),
            _ => Err(Error::MalformedFrame.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separation_time_units() {
        let frame = Frame::new(0, 0x7e8.into(), &[0x30, 0x08, 0xf3]).unwrap();
        let fc = FlowControlConfig::try_from(&frame).unwrap();
        assert_eq!(fc.block_size, 8);
        assert_eq!(fc.separation_time_min, Duration::from_micros(300));

        let frame = Frame::new(0, 0x7e8.into(), &[0x30, 0x00, 0x80]).unwrap();
        assert!(FlowControlConfig::try_from(&frame).is_err());
        let frame = Frame::new(0, 0x7e8.into(), &[0x30, 0x00]).unwrap();
        assert!(FlowControlConfig::try_from(&frame).is_err());
    }
}
