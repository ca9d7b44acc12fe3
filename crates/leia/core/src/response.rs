//! APDU response definitions
//!
//! [`Resp`] is the response structure returned by the firmware for every
//! forwarded APDU, including the timing telemetry of the exchange.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::Level;

use crate::apdu::MAX_APDU_PAYLOAD_SIZE;
use crate::error::{Error, Result};
use crate::layout::LayoutReader;

/// Size of the firmware response header: Le (u32), SW1, SW2, two u32 timers
pub const RESP_HEADER_SIZE: usize = 14;

/// Status Word (SW1-SW2) from an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// First status byte (SW1)
    pub sw1: u8,
    /// Second status byte (SW2)
    pub sw2: u8,
}

impl StatusWord {
    /// Create a new status word
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Convert to a u16 value (SW1 | SW2)
    pub const fn to_u16(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Check if this status word indicates success (90 00)
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Get the number of bytes waiting for a GET RESPONSE when SW1 = 61
    pub const fn remaining_bytes(&self) -> Option<u8> {
        if self.sw1 == 0x61 {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// Get the exact length the card wants when SW1 = 6C
    pub const fn corrected_length(&self) -> Option<u8> {
        if self.sw1 == 0x6C {
            Some(self.sw2)
        } else {
            None
        }
    }

    /// Check if this status word indicates wrong length (67 XX)
    pub const fn is_wrong_length(&self) -> bool {
        self.sw1 == 0x67
    }

    /// Get the appropriate tracing level for this status word
    pub const fn tracing_level(&self) -> Level {
        if self.is_success() || self.sw1 == 0x61 {
            Level::DEBUG
        } else if self.sw1 == 0x62 || self.sw1 == 0x63 {
            Level::INFO
        } else {
            Level::WARN
        }
    }

    /// Get a description of this status word
    pub const fn description(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            (0x62, _) => "Warning, non-volatile memory unchanged",
            (0x63, _) => "Warning, non-volatile memory changed",
            (0x67, 0x00) => "Wrong length",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x6A, 0x82) => "File not found",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => "Unknown status word",
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {:02X}", self.sw1, self.sw2)
    }
}

/// Response to an APDU, as reported by the firmware
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resp {
    /// First status byte
    pub sw1: u8,
    /// Second status byte
    pub sw2: u8,
    /// Total time of the exchange, in microseconds
    pub delta_t: u32,
    /// Time until the card answered, in microseconds
    pub delta_t_answer: u32,
    /// Response data, never longer than [`MAX_APDU_PAYLOAD_SIZE`]
    data: Bytes,
}

impl Resp {
    /// Create a response with data and status word
    pub fn new<T: Into<Bytes>>(sw1: u8, sw2: u8, data: T) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_APDU_PAYLOAD_SIZE {
            return Err(Error::construction(format!(
                "RESP data of {} bytes exceeds the maximum payload of {MAX_APDU_PAYLOAD_SIZE}",
                data.len()
            )));
        }
        Ok(Self {
            sw1,
            sw2,
            delta_t: 0,
            delta_t_answer: 0,
            data,
        })
    }

    /// Create a response carrying only a status word
    pub const fn status_only(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
            delta_t: 0,
            delta_t_answer: 0,
            data: Bytes::new(),
        }
    }

    /// Attach timing telemetry
    pub const fn with_timers(mut self, delta_t: u32, delta_t_answer: u32) -> Self {
        self.delta_t = delta_t;
        self.delta_t_answer = delta_t_answer;
        self
    }

    /// Response data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Length of the response data
    pub fn le(&self) -> u32 {
        self.data.len() as u32
    }

    /// Status word of the response
    pub const fn status(&self) -> StatusWord {
        StatusWord::new(self.sw1, self.sw2)
    }

    /// Serialize into the firmware layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RESP_HEADER_SIZE + self.data.len());
        buf.put_u32_le(self.le());
        buf.put_u8(self.sw1);
        buf.put_u8(self.sw2);
        buf.put_u32_le(self.delta_t);
        buf.put_u32_le(self.delta_t_answer);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse the firmware layout; data missing from a short input reads as zero
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = LayoutReader::new(bytes);
        let le = reader.u32_le() as usize;
        if le > MAX_APDU_PAYLOAD_SIZE {
            return Err(Error::decoding(format!(
                "RESP length {le} exceeds the maximum payload of {MAX_APDU_PAYLOAD_SIZE}"
            )));
        }
        let sw1 = reader.u8();
        let sw2 = reader.u8();
        let delta_t = reader.u32_le();
        let delta_t_answer = reader.u32_le();
        Ok(Self {
            sw1,
            sw2,
            delta_t,
            delta_t_answer,
            data: reader.bytes(le).into(),
        })
    }

    /// Canonical form: data followed by SW1 SW2
    pub fn normalized(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 2);
        buf.put_slice(&self.data);
        buf.put_u8(self.sw1);
        buf.put_u8(self.sw2);
        buf.freeze()
    }
}

impl fmt::Display for Resp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RESP(sw1=0x{:02X}, sw2=0x{:02X}, le={:#x}",
            self.sw1,
            self.sw2,
            self.le()
        )?;
        if !self.data.is_empty() {
            write!(f, ", data={}", hex::encode(&self.data))?;
        }
        write!(
            f,
            ")\ndelta_t={} microseconds, delta_t_answer={} microseconds",
            self.delta_t, self.delta_t_answer
        )
    }
}
