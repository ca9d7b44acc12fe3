//! Timing telemetry of the last APDU exchange

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::layout::LayoutReader;

/// Size of the firmware timers layout
pub const TIMERS_LAYOUT_SIZE: usize = 8;

/// Microsecond timers measured by the firmware for the most recent exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timers {
    /// Total time of the exchange
    pub delta_t: u32,
    /// Time until the card answered
    pub delta_t_answer: u32,
}

impl Timers {
    /// Serialize into the firmware layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TIMERS_LAYOUT_SIZE);
        buf.put_u32_le(self.delta_t);
        buf.put_u32_le(self.delta_t_answer);
        buf.freeze()
    }

    /// Parse the firmware layout
    pub fn decode(bytes: &[u8]) -> Self {
        let mut reader = LayoutReader::new(bytes);
        Self {
            delta_t: reader.u32_le(),
            delta_t_answer: reader.u32_le(),
        }
    }
}

impl fmt::Display for Timers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timers(delta_t={} microseconds, delta_t_answer={} microseconds)",
            self.delta_t, self.delta_t_answer
        )
    }
}
