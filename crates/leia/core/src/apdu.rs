//! APDU command definitions
//!
//! [`Apdu`] mirrors the command structure understood by the LEIA firmware. Besides
//! the firmware layout ([`Apdu::encode`] / [`Apdu::decode`]) it offers the
//! canonical form used for display ([`Apdu::normalized`]) and the reconstruction
//! of a structured command from raw ISO7816 bytes ([`Apdu::from_raw`]).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Error, Result};
use crate::layout::LayoutReader;

/// Maximum APDU payload size supported by the firmware (SRAM bound)
pub const MAX_APDU_PAYLOAD_SIZE: usize = 16384;

/// Size of the firmware APDU header: CLA INS P1 P2, Lc (u16), Le (u32), send_le
pub const APDU_HEADER_SIZE: usize = 11;

/// How the expected length (Le) is carried, if at all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LeForm {
    /// No Le field
    #[default]
    Absent = 0,
    /// Short (one byte) Le
    Short = 1,
    /// Extended Le
    Extended = 2,
}

impl LeForm {
    /// Wire value of this form
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether an Le field is sent at all
    pub const fn is_present(self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl TryFrom<u8> for LeForm {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Absent),
            1 => Ok(Self::Short),
            2 => Ok(Self::Extended),
            other => Err(Error::decoding(format!("invalid send_le value {other}"))),
        }
    }
}

/// APDU command as exchanged with the LEIA firmware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Apdu {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Expected response length
    pub le: u32,
    /// Form of the Le field
    pub send_le: LeForm,
    /// Command data, never longer than [`MAX_APDU_PAYLOAD_SIZE`]
    data: Bytes,
}

impl Apdu {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            le: 0,
            send_le: LeForm::Absent,
            data: Bytes::new(),
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Result<Self> {
        self.set_data(data)?;
        Ok(self)
    }

    /// Set the expected length, choosing the short form when it fits
    pub const fn with_le(mut self, le: u32) -> Self {
        self.le = le;
        self.send_le = if le > 0xFF {
            LeForm::Extended
        } else {
            LeForm::Short
        };
        self
    }

    /// Set the expected length with an explicit form
    pub const fn with_le_form(mut self, le: u32, form: LeForm) -> Self {
        self.le = le;
        self.send_le = form;
        self
    }

    /// Replace the data field, enforcing the payload capacity
    pub fn set_data<T: Into<Bytes>>(&mut self, data: T) -> Result<()> {
        let data = data.into();
        if data.len() > MAX_APDU_PAYLOAD_SIZE {
            return Err(Error::construction(format!(
                "APDU data of {} bytes exceeds the maximum payload of {MAX_APDU_PAYLOAD_SIZE}",
                data.len()
            )));
        }
        self.data = data;
        Ok(())
    }

    /// Command data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Data length (Lc)
    pub fn lc(&self) -> u16 {
        // bounded by MAX_APDU_PAYLOAD_SIZE
        self.data.len() as u16
    }

    /// Serialize into the firmware layout, without unused data capacity
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(APDU_HEADER_SIZE + self.data.len());
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);
        buf.put_u16_le(self.lc());
        buf.put_u32_le(self.le);
        buf.put_u8(self.send_le.as_u8());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse the firmware layout; missing trailing bytes read as zero
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = LayoutReader::new(bytes);
        let mut apdu = Self::new(reader.u8(), reader.u8(), reader.u8(), reader.u8());
        let lc = reader.u16_le() as usize;
        apdu.le = reader.u32_le();
        apdu.send_le = LeForm::try_from(reader.u8())?;
        if lc > MAX_APDU_PAYLOAD_SIZE {
            return Err(Error::decoding(format!(
                "APDU Lc {lc} exceeds the maximum payload of {MAX_APDU_PAYLOAD_SIZE}"
            )));
        }
        apdu.data = reader.bytes(lc).into();
        Ok(apdu)
    }

    /// Canonical minimal form: header, then Lc and data when present, then Le
    /// when sent. A command with neither still carries its (zero) Lc.
    pub fn normalized(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(APDU_HEADER_SIZE + self.data.len());
        buf.put_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            buf.put_u16_le(self.lc());
            buf.put_slice(&self.data);
        }
        if self.send_le.is_present() {
            buf.put_u32_le(self.le);
        }
        if self.data.is_empty() && !self.send_le.is_present() {
            buf.put_u16_le(0);
        }
        buf.freeze()
    }

    /// Build a command from raw ISO7816 bytes whose form is not signalled
    ///
    /// The short/extended form is inferred from the total length and from
    /// whether the fifth byte is zero:
    ///
    /// - 5 bytes: header and a one byte Le.
    /// - fifth byte zero and at least 8 bytes: extended form. Bytes 5..7 give Lc
    ///   when that much data follows, optionally followed by `00 Le_hi Le_lo`.
    ///   Otherwise the same two bytes are an extended Le with no data.
    /// - fifth byte zero and 6 or 7 bytes: short form without data, the sixth
    ///   byte being Le when the buffer is exactly 6 bytes long.
    /// - fifth byte nonzero: short Lc, data, and Le if exactly one byte remains.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        if raw.len() < 5 {
            return Err(Error::decoding(format!(
                "APDU buffer of size {} is too small",
                raw.len()
            )));
        }

        let mut apdu = Self::new(raw[0], raw[1], raw[2], raw[3]);

        if raw.len() == 5 {
            apdu.le = u32::from(raw[4]);
            apdu.send_le = LeForm::Short;
        } else if raw[4] == 0 && raw.len() >= 8 {
            apdu.send_le = LeForm::Extended;
            let lc = usize::from(u16::from_be_bytes([raw[5], raw[6]]));
            if raw.len() >= lc + 7 {
                if lc > MAX_APDU_PAYLOAD_SIZE {
                    return Err(Error::decoding(format!(
                        "extended APDU Lc {lc} exceeds the maximum payload of {MAX_APDU_PAYLOAD_SIZE}"
                    )));
                }
                apdu.data = Bytes::copy_from_slice(&raw[7..7 + lc]);
                if raw.len() >= lc + 10 {
                    if raw[lc + 7] != 0x00 {
                        return Err(Error::decoding("extended APDU Le must start with 00"));
                    }
                    apdu.le = u32::from(u16::from_be_bytes([raw[lc + 8], raw[lc + 9]]));
                }
            } else {
                // not enough bytes for that Lc: it is an extended Le without data
                apdu.le = lc as u32;
            }
        } else if raw[4] == 0 {
            apdu.send_le = LeForm::Short;
            if raw.len() == 6 {
                apdu.le = u32::from(raw[5]);
            }
        } else {
            let lc = usize::from(raw[4]);
            let data = raw.get(5..5 + lc).ok_or_else(|| {
                Error::decoding(format!(
                    "short APDU announces {lc} data bytes but only {} follow",
                    raw.len() - 5
                ))
            })?;
            apdu.data = Bytes::copy_from_slice(data);
            if raw.len() == 5 + lc + 1 {
                apdu.le = u32::from(raw[5 + lc]);
                apdu.send_le = LeForm::Short;
            }
        }

        trace!(raw = %hex::encode(raw), apdu = %apdu, "Reconstructed APDU");
        Ok(apdu)
    }
}

impl fmt::Display for Apdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "APDU(cla={:#x}, ins={:#x}, p1={:#x}, p2={:#x}, lc={}, le={}, send_le={}",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.lc(),
            self.le,
            self.send_le.as_u8()
        )?;
        if !self.data.is_empty() {
            write!(f, ", data={}", hex::encode(&self.data))?;
        }
        write!(f, ")")
    }
}
