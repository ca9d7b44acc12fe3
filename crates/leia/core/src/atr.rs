//! ISO7816-3 Answer-To-Reset as captured by the firmware
//!
//! The firmware parses the ATR while acquiring it and reports which interface
//! bytes were present in `t_mask`. Presence is never inferred from byte values
//! here, since a legitimate interface byte can be `0x00`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::layout::LayoutReader;

/// Maximum number of historical bytes
pub const MAX_HISTORICAL_BYTES: usize = 16;

/// Number of interface byte rounds the firmware records
pub const ATR_ROUNDS: usize = 4;

/// Size of the firmware ATR layout
pub const ATR_LAYOUT_SIZE: usize = 55;

/// Interface byte groups, in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum InterfaceByte {
    /// TAi
    #[display("TA")]
    Ta = 0,
    /// TBi
    #[display("TB")]
    Tb = 1,
    /// TCi
    #[display("TC")]
    Tc = 2,
    /// TDi
    #[display("TD")]
    Td = 3,
}

impl InterfaceByte {
    /// All groups in the order they appear within a round
    pub const ALL: [Self; 4] = [Self::Ta, Self::Tb, Self::Tc, Self::Td];
}

/// Answer-To-Reset with presence information and negotiated parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Atr {
    /// Initial character
    pub ts: u8,
    /// Format byte
    pub t0: u8,
    /// TA1..TA4
    pub ta: [u8; ATR_ROUNDS],
    /// TB1..TB4
    pub tb: [u8; ATR_ROUNDS],
    /// TC1..TC4
    pub tc: [u8; ATR_ROUNDS],
    /// TD1..TD4
    pub td: [u8; ATR_ROUNDS],
    /// Historical bytes buffer, only the first `h_num` are meaningful
    pub h: [u8; MAX_HISTORICAL_BYTES],
    /// Presence bits, one byte per group (TA, TB, TC, TD), bit i for round i
    pub t_mask: [u8; 4],
    /// Number of historical bytes
    pub h_num: u8,
    /// Check byte
    pub tck: u8,
    /// Whether the check byte was present
    pub tck_present: bool,
    /// Negotiated baud rate adjustment factor
    pub d_i_curr: u32,
    /// Negotiated clock rate conversion factor
    pub f_i_curr: u32,
    /// Negotiated maximum clock frequency
    pub f_max_curr: u32,
    /// Negotiated transmission protocol
    pub t_protocol_curr: u8,
    /// Negotiated information field size for the card
    pub ifsc: u8,
}

impl Atr {
    /// An ATR is empty when the card was never activated (TS not captured)
    pub const fn is_empty(&self) -> bool {
        self.ts == 0
    }

    const fn group(&self, group: InterfaceByte) -> &[u8; ATR_ROUNDS] {
        match group {
            InterfaceByte::Ta => &self.ta,
            InterfaceByte::Tb => &self.tb,
            InterfaceByte::Tc => &self.tc,
            InterfaceByte::Td => &self.td,
        }
    }

    /// Whether the interface byte of `group` in `round` (0 based) was present
    pub const fn is_present(&self, group: InterfaceByte, round: usize) -> bool {
        round < ATR_ROUNDS && self.t_mask[group as usize] & (1 << round) != 0
    }

    /// The interface byte of `group` in `round`, if present
    pub const fn interface_byte(&self, group: InterfaceByte, round: usize) -> Option<u8> {
        if self.is_present(group, round) {
            Some(self.group(group)[round])
        } else {
            None
        }
    }

    /// Present interface bytes in emission order: per round, TA, TB, TC, TD
    pub fn interface_bytes(&self) -> impl Iterator<Item = (InterfaceByte, usize, u8)> + '_ {
        (0..ATR_ROUNDS).flat_map(move |round| {
            InterfaceByte::ALL.into_iter().filter_map(move |group| {
                self.interface_byte(group, round)
                    .map(|value| (group, round, value))
            })
        })
    }

    /// The meaningful historical bytes
    pub fn historical_bytes(&self) -> &[u8] {
        &self.h[..usize::from(self.h_num).min(MAX_HISTORICAL_BYTES)]
    }

    /// The check byte, if present
    pub const fn check_byte(&self) -> Option<u8> {
        if self.tck_present {
            Some(self.tck)
        } else {
            None
        }
    }

    /// Minimal ATR byte string: TS, T0, present interface bytes, historical
    /// bytes and TCK when present
    pub fn normalized(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + 4 * ATR_ROUNDS + MAX_HISTORICAL_BYTES + 1);
        buf.put_u8(self.ts);
        buf.put_u8(self.t0);
        for (_, _, value) in self.interface_bytes() {
            buf.put_u8(value);
        }
        buf.put_slice(self.historical_bytes());
        if let Some(tck) = self.check_byte() {
            buf.put_u8(tck);
        }
        buf.freeze()
    }

    /// Serialize into the firmware layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ATR_LAYOUT_SIZE);
        buf.put_u8(self.ts);
        buf.put_u8(self.t0);
        buf.put_slice(&self.ta);
        buf.put_slice(&self.tb);
        buf.put_slice(&self.tc);
        buf.put_slice(&self.td);
        buf.put_slice(&self.h);
        buf.put_slice(&self.t_mask);
        buf.put_u8(self.h_num);
        buf.put_u8(self.tck);
        buf.put_u8(u8::from(self.tck_present));
        buf.put_u32_le(self.d_i_curr);
        buf.put_u32_le(self.f_i_curr);
        buf.put_u32_le(self.f_max_curr);
        buf.put_u8(self.t_protocol_curr);
        buf.put_u8(self.ifsc);
        buf.freeze()
    }

    /// Parse the firmware layout; a short input leaves the tail at zero
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = LayoutReader::new(bytes);
        let atr = Self {
            ts: reader.u8(),
            t0: reader.u8(),
            ta: reader.array(),
            tb: reader.array(),
            tc: reader.array(),
            td: reader.array(),
            h: reader.array(),
            t_mask: reader.array(),
            h_num: reader.u8(),
            tck: reader.u8(),
            tck_present: reader.u8() == 1,
            d_i_curr: reader.u32_le(),
            f_i_curr: reader.u32_le(),
            f_max_curr: reader.u32_le(),
            t_protocol_curr: reader.u8(),
            ifsc: reader.u8(),
        };
        if usize::from(atr.h_num) > MAX_HISTORICAL_BYTES {
            return Err(Error::decoding(format!(
                "ATR announces {} historical bytes, at most {MAX_HISTORICAL_BYTES} are supported",
                atr.h_num
            )));
        }
        Ok(atr)
    }

    /// Field by field listing of the ATR and of the negotiated parameters
    pub const fn pretty(&self) -> PrettyAtr<'_> {
        PrettyAtr(self)
    }
}

impl fmt::Display for Atr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ATR({})", hex::encode_upper(self.normalized()))
    }
}

/// Display adapter returned by [`Atr::pretty`]
#[derive(Debug, Clone, Copy)]
pub struct PrettyAtr<'a>(&'a Atr);

impl fmt::Display for PrettyAtr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let atr = self.0;
        writeln!(f, "TS = 0x{:02x}", atr.ts)?;
        writeln!(f, "T0 = 0x{:02x}", atr.t0)?;
        for group in InterfaceByte::ALL {
            for round in 0..ATR_ROUNDS {
                if let Some(value) = atr.interface_byte(group, round) {
                    writeln!(f, "{group}[{round}] = 0x{value:02x}")?;
                }
            }
        }
        for (i, value) in atr.historical_bytes().iter().enumerate() {
            writeln!(f, "H[{i}] = 0x{value:02x}")?;
        }
        if let Some(tck) = atr.check_byte() {
            writeln!(f, "TCK = 0x{tck:02x}")?;
        }
        writeln!(f, "------ Protocol information")?;
        writeln!(f, "  Current protocol T = {}", atr.t_protocol_curr)?;
        writeln!(
            f,
            "  Di = {}, Fi = {}, f_max_curr = {} MHz",
            atr.d_i_curr, atr.f_i_curr, atr.f_max_curr
        )?;
        write!(f, "  IFSC = {}", atr.ifsc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sample() -> Atr {
        // 3B 9F 95 81 31 FE 9F 00 66 46 53 05 01 00 11 71 DF 00 00 00 00 00 00 00 25
        let mut atr = Atr {
            ts: 0x3B,
            t0: 0x9F,
            ..Default::default()
        };
        atr.ta[0] = 0x95;
        atr.td[0] = 0x81;
        atr.td[1] = 0x31;
        atr.ta[2] = 0xFE;
        atr.tb[2] = 0x9F;
        atr.t_mask = [0b0101, 0b0100, 0b0000, 0b0011];
        atr.h[..4].copy_from_slice(&hex!("80 31 E0 73"));
        atr.h_num = 4;
        atr.tck = 0x25;
        atr.tck_present = true;
        atr.t_protocol_curr = 1;
        atr.ifsc = 0xFE;
        atr
    }

    #[test]
    fn test_normalized_follows_presence_bits() {
        let atr = sample();
        assert_eq!(
            atr.normalized().as_ref(),
            &hex!("3B 9F 95 81 31 FE 9F 80 31 E0 73 25")
        );
    }

    #[test]
    fn test_normalized_ignores_absent_nonzero_bytes() {
        let mut atr = sample();
        atr.tc = [0xAA; 4];
        atr.h[4..].fill(0xBB);
        assert_eq!(
            atr.normalized().as_ref(),
            &hex!("3B 9F 95 81 31 FE 9F 80 31 E0 73 25")
        );
    }

    #[test]
    fn test_normalized_keeps_present_zero_bytes() {
        let mut atr = Atr {
            ts: 0x3B,
            t0: 0x10,
            ..Default::default()
        };
        atr.t_mask[0] = 0b0001;
        assert_eq!(atr.normalized().as_ref(), &hex!("3B 10 00"));
    }

    #[test]
    fn test_normalized_empty_masks() {
        let mut atr = Atr {
            ts: 0x3B,
            t0: 0x00,
            ..Default::default()
        };
        atr.ta = [1, 2, 3, 4];
        atr.tck = 0x77;
        assert_eq!(atr.normalized().as_ref(), &hex!("3B 00"));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut atr = sample();
        atr.d_i_curr = 1;
        atr.f_i_curr = 372;
        atr.f_max_curr = 5;
        let encoded = atr.encode();
        assert_eq!(encoded.len(), ATR_LAYOUT_SIZE);
        assert_eq!(Atr::decode(&encoded).unwrap(), atr);
    }

    #[test]
    fn test_decode_short_input() {
        let atr = Atr::decode(&hex!("3B 00")).unwrap();
        assert_eq!(atr.ts, 0x3B);
        assert_eq!(atr.normalized().as_ref(), &hex!("3B 00"));
        assert!(Atr::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_too_many_historical_bytes() {
        let mut raw = Atr::default().encode().to_vec();
        // h_num sits right after the presence mask
        raw[2 + 16 + 16 + 4] = 17;
        assert!(matches!(Atr::decode(&raw), Err(Error::Decoding(_))));
    }

    #[test]
    fn test_pretty_lists_present_bytes() {
        let text = sample().pretty().to_string();
        assert!(text.contains("TA[0] = 0x95"));
        assert!(text.contains("TB[2] = 0x9f"));
        assert!(text.contains("TD[1] = 0x31"));
        assert!(!text.contains("TC["));
        assert!(text.contains("H[3] = 0x73"));
        assert!(text.contains("TCK = 0x25"));
        assert!(text.contains("IFSC = 254"));
    }
}
