//! Hardware trigger strategies
//!
//! A strategy is an ordered list of trigger points. Once every point of the list
//! has been matched in order, the board raises its trigger GPIO after `delay`
//! milliseconds. Reading a strategy back returns what actually fired.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::layout::LayoutReader;

/// Number of trigger points a strategy can hold
pub const TRIGGER_DEPTH: usize = 10;

/// Number of strategy banks on the board
pub const STRATEGY_MAX: u8 = 4;

/// Size of the firmware strategy layout
pub const TRIGGER_STRATEGY_LAYOUT_SIZE: usize = 1 + 4 + 1 + 5 * 4 * TRIGGER_DEPTH;

/// Bit flags identifying the events the firmware can trigger on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerPoint(u32);

impl TriggerPoint {
    /// Before getting the ATR
    pub const GET_ATR_PRE: Self = Self(1 << 0);
    /// Just after the ATR has been received
    pub const GET_ATR_POST: Self = Self(1 << 1);
    /// Before sending a short APDU in T=0
    pub const PRE_SEND_APDU_SHORT_T0: Self = Self(1 << 2);
    /// Before sending a fragmented APDU in T=0
    pub const PRE_SEND_APDU_FRAGMENTED_T0: Self = Self(1 << 3);
    /// Before sending an APDU in T=1
    pub const PRE_SEND_APDU_T1: Self = Self(1 << 4);
    /// Before sending any APDU
    pub const PRE_SEND_APDU: Self = Self(
        Self::PRE_SEND_APDU_SHORT_T0.0 | Self::PRE_SEND_APDU_FRAGMENTED_T0.0 | Self::PRE_SEND_APDU_T1.0,
    );
    /// Before receiving a response in T=0
    pub const POST_RESP_T0: Self = Self(1 << 6);
    /// Before receiving a response in T=1
    pub const POST_RESP_T1: Self = Self(1 << 7);
    /// Before receiving any response
    pub const POST_RESP: Self = Self(Self::POST_RESP_T0.0 | Self::POST_RESP_T1.0);
    /// After a byte was sent on the ISO7816 line
    pub const IRQ_PUTC: Self = Self(1 << 8);
    /// After a byte was received on the ISO7816 line
    pub const IRQ_GETC: Self = Self(1 << 9);

    const NAMED: [(Self, &'static str); 12] = [
        (Self::GET_ATR_PRE, "GET_ATR_PRE"),
        (Self::GET_ATR_POST, "GET_ATR_POST"),
        (Self::PRE_SEND_APDU, "PRE_SEND_APDU"),
        (Self::PRE_SEND_APDU_SHORT_T0, "PRE_SEND_APDU_SHORT_T0"),
        (Self::PRE_SEND_APDU_FRAGMENTED_T0, "PRE_SEND_APDU_FRAGMENTED_T0"),
        (Self::PRE_SEND_APDU_T1, "PRE_SEND_APDU_T1"),
        (Self::POST_RESP, "POST_RESP"),
        (Self::POST_RESP_T0, "POST_RESP_T0"),
        (Self::POST_RESP_T1, "POST_RESP_T1"),
        (Self::IRQ_PUTC, "IRQ_PUTC"),
        (Self::IRQ_GETC, "IRQ_GETC"),
        (Self(0), "NONE"),
    ];

    /// Wrap raw flag bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw flag bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Look a point up by its name, with or without the `TRIG_` prefix
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        let name = match name.get(..5) {
            Some(prefix) if prefix.eq_ignore_ascii_case("TRIG_") => &name[5..],
            _ => name,
        };
        Self::NAMED
            .iter()
            .find(|(_, known)| known.eq_ignore_ascii_case(name))
            .map(|(point, _)| *point)
    }
}

impl fmt::Display for TriggerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::NAMED.iter().find(|(point, _)| point == self) {
            Some((_, name)) => write!(f, "TRIG_{name}"),
            None => write!(f, "TRIG({:#x})", self.0),
        }
    }
}

/// ATR begin and end
pub const MULTI_TRIG_ATR: [TriggerPoint; 2] = [TriggerPoint::GET_ATR_PRE, TriggerPoint::GET_ATR_POST];

/// First byte of an APDU sent to the card
pub const MULTI_TRIG_AFTER_1ST_BYTE_SEND_APDU: [TriggerPoint; 2] =
    [TriggerPoint::PRE_SEND_APDU, TriggerPoint::IRQ_PUTC];

/// Trigger strategy as configured by the host and echoed back by the board
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerStrategy {
    size: u8,
    /// Delay between the match and the GPIO going high, in milliseconds
    pub delay: u32,
    /// Whether the strategy fires only once
    pub single: bool,
    list: [u32; TRIGGER_DEPTH],
    list_trigged: [u32; TRIGGER_DEPTH],
    cnt_trigged: [u32; TRIGGER_DEPTH],
    event_time: [u32; TRIGGER_DEPTH],
    apply_delay: [u32; TRIGGER_DEPTH],
}

impl TriggerStrategy {
    /// Create a strategy matching `points` in order
    pub fn new(points: &[TriggerPoint]) -> Result<Self> {
        let mut strategy = Self::default();
        strategy.set_points(points)?;
        Ok(strategy)
    }

    /// Set the delay in milliseconds
    pub const fn with_delay(mut self, delay: u32) -> Self {
        self.delay = delay;
        self
    }

    /// Fire only once
    pub const fn with_single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    /// Replace the list of points to match
    pub fn set_points(&mut self, points: &[TriggerPoint]) -> Result<()> {
        if points.len() > TRIGGER_DEPTH {
            return Err(Error::construction(format!(
                "trigger strategy holds at most {TRIGGER_DEPTH} points, got {}",
                points.len()
            )));
        }
        self.list = [0; TRIGGER_DEPTH];
        for (slot, point) in self.list.iter_mut().zip(points) {
            *slot = point.bits();
        }
        self.size = points.len() as u8;
        Ok(())
    }

    /// Number of points in use; a device reporting more than the capacity is clamped
    pub fn len(&self) -> usize {
        usize::from(self.size).min(TRIGGER_DEPTH)
    }

    /// Whether the strategy has no point
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Points to match
    pub fn points(&self) -> Vec<TriggerPoint> {
        self.list[..self.len()]
            .iter()
            .copied()
            .map(TriggerPoint::from_bits)
            .collect()
    }

    /// Points that fired, as reported by the board
    pub fn points_trigged(&self) -> Vec<TriggerPoint> {
        self.list_trigged[..self.len()]
            .iter()
            .copied()
            .map(TriggerPoint::from_bits)
            .collect()
    }

    /// How many times each point fired
    pub fn counts_trigged(&self) -> &[u32] {
        &self.cnt_trigged[..self.len()]
    }

    /// Relative time of each event
    pub fn event_times(&self) -> &[u32] {
        &self.event_time[..self.len()]
    }

    /// Serialize into the firmware layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(TRIGGER_STRATEGY_LAYOUT_SIZE);
        self.put(&mut buf);
        buf.freeze()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.size);
        buf.put_u32_le(self.delay);
        buf.put_u8(u8::from(self.single));
        for values in [
            &self.list,
            &self.list_trigged,
            &self.cnt_trigged,
            &self.event_time,
            &self.apply_delay,
        ] {
            for value in values {
                buf.put_u32_le(*value);
            }
        }
    }

    /// Parse the firmware layout
    pub fn decode(bytes: &[u8]) -> Self {
        let mut reader = LayoutReader::new(bytes);
        Self {
            size: reader.u8(),
            delay: reader.u32_le(),
            single: reader.u8() != 0,
            list: reader.u32_array(),
            list_trigged: reader.u32_array(),
            cnt_trigged: reader.u32_array(),
            event_time: reader.u32_array(),
            apply_delay: reader.u32_array(),
        }
    }
}

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for TriggerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriggerStrategy(single={}, delay={}, point_list=[{}], point_list_trigged=[{}], cnt_list_trigged=[{}], event_time=[{}])",
            u8::from(self.single),
            self.delay,
            join(self.points()),
            join(self.points_trigged()),
            join(self.counts_trigged()),
            join(self.event_times()),
        )
    }
}

/// Validate a strategy bank index
pub fn check_strategy_index(index: u8) -> Result<()> {
    if index >= STRATEGY_MAX {
        return Err(Error::construction(format!(
            "strategy index {index} exceeds STRATEGY_MAX={STRATEGY_MAX}"
        )));
    }
    Ok(())
}

/// Payload of the set trigger strategy command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetTriggerStrategy {
    /// Strategy bank
    pub index: u8,
    /// Strategy to install
    pub strategy: TriggerStrategy,
}

impl SetTriggerStrategy {
    /// Create the payload, checking the bank index
    pub fn new(index: u8, strategy: TriggerStrategy) -> Result<Self> {
        check_strategy_index(index)?;
        Ok(Self { index, strategy })
    }

    /// Serialize into the firmware layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + TRIGGER_STRATEGY_LAYOUT_SIZE);
        buf.put_u8(self.index);
        self.strategy.put(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_size() {
        let strategy = TriggerStrategy::new(&MULTI_TRIG_ATR).unwrap();
        assert_eq!(strategy.encode().len(), TRIGGER_STRATEGY_LAYOUT_SIZE);
        assert_eq!(TRIGGER_STRATEGY_LAYOUT_SIZE, 206);
    }

    #[test]
    fn test_encode_header_and_points() {
        let strategy = TriggerStrategy::new(&MULTI_TRIG_AFTER_1ST_BYTE_SEND_APDU)
            .unwrap()
            .with_delay(0x0102)
            .with_single(true);
        let encoded = strategy.encode();
        assert_eq!(&encoded[..6], &[0x02, 0x02, 0x01, 0x00, 0x00, 0x01]);
        // PRE_SEND_APDU = 0x1C, IRQ_PUTC = 0x100
        assert_eq!(&encoded[6..14], &[0x1C, 0, 0, 0, 0x00, 0x01, 0, 0]);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let points = [TriggerPoint::IRQ_GETC; TRIGGER_DEPTH + 1];
        assert!(matches!(TriggerStrategy::new(&points), Err(Error::Construction(_))));
        assert!(TriggerStrategy::new(&points[..TRIGGER_DEPTH]).is_ok());
    }

    #[test]
    fn test_decode_read_back() {
        let mut raw = TriggerStrategy::new(&MULTI_TRIG_ATR).unwrap().encode().to_vec();
        // list_trigged[0], cnt_trigged[0], event_time[1]
        raw[6 + 40] = 0x01;
        raw[6 + 80] = 0x03;
        raw[6 + 120 + 4] = 0x10;
        let strategy = TriggerStrategy::decode(&raw);
        assert_eq!(strategy.points(), MULTI_TRIG_ATR.to_vec());
        assert_eq!(strategy.points_trigged()[0], TriggerPoint::GET_ATR_PRE);
        assert_eq!(strategy.counts_trigged(), &[3, 0]);
        assert_eq!(strategy.event_times(), &[0, 0x10]);
    }

    #[test]
    fn test_decode_clamps_reported_size() {
        let strategy = TriggerStrategy::decode(&[0xFF]);
        assert_eq!(strategy.len(), TRIGGER_DEPTH);
    }

    #[test]
    fn test_strategy_index_bound() {
        let strategy = TriggerStrategy::default();
        assert!(SetTriggerStrategy::new(STRATEGY_MAX - 1, strategy.clone()).is_ok());
        assert!(matches!(
            SetTriggerStrategy::new(STRATEGY_MAX, strategy),
            Err(Error::Construction(_))
        ));
    }

    #[test]
    fn test_set_payload_prefixes_index() {
        let set = SetTriggerStrategy::new(2, TriggerStrategy::default()).unwrap();
        let encoded = set.encode();
        assert_eq!(encoded.len(), 1 + TRIGGER_STRATEGY_LAYOUT_SIZE);
        assert_eq!(encoded[0], 2);
    }

    #[test]
    fn test_point_names() {
        assert_eq!(
            TriggerPoint::from_name("TRIG_IRQ_PUTC"),
            Some(TriggerPoint::IRQ_PUTC)
        );
        assert_eq!(
            TriggerPoint::from_name("get_atr_post"),
            Some(TriggerPoint::GET_ATR_POST)
        );
        assert_eq!(TriggerPoint::from_name("bogus"), None);
        assert_eq!(TriggerPoint::PRE_SEND_APDU.to_string(), "TRIG_PRE_SEND_APDU");
        assert_eq!(TriggerPoint::from_bits(0x400).to_string(), "TRIG(0x400)");
    }
}
