//! Client side of the vpcd virtual reader protocol
//!
//! Every message is prefixed by its length as a 16-bit big-endian integer. A one
//! byte message is a control command, anything else is a raw APDU. Replies use
//! the same framing.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix
pub const LENGTH_SIZE: usize = 2;

/// Length of a control message
pub const CONTROL_LENGTH: u16 = 1;

/// Control commands sent by the virtual reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Control {
    /// Power the card off
    #[display("power off")]
    PowerOff,
    /// Power the card on
    #[display("power on")]
    PowerOn,
    /// Reset the card
    #[display("reset")]
    Reset,
    /// Request the ATR
    #[display("get ATR")]
    GetAtr,
}

impl Control {
    /// Decode a control byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::PowerOff),
            0x01 => Some(Self::PowerOn),
            0x02 => Some(Self::Reset),
            0x04 => Some(Self::GetAtr),
            _ => None,
        }
    }

    /// Wire byte
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::PowerOff => 0x00,
            Self::PowerOn => 0x01,
            Self::Reset => 0x02,
            Self::GetAtr => 0x04,
        }
    }
}

/// Length prefix a payload; payloads never exceed the firmware buffers, far
/// below the 16-bit limit
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame() {
        assert_eq!(frame(&[]).as_ref(), &[0x00, 0x00]);
        assert_eq!(frame(&[0x90, 0x00]).as_ref(), &[0x00, 0x02, 0x90, 0x00]);
    }

    #[test]
    fn test_control_bytes() {
        for control in [
            Control::PowerOff,
            Control::PowerOn,
            Control::Reset,
            Control::GetAtr,
        ] {
            assert_eq!(Control::from_byte(control.as_byte()), Some(control));
        }
        assert_eq!(Control::from_byte(0x03), None);
    }
}
