//! Configuration options for the link and the smartcard connection

use std::str::FromStr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// ISO7816 transmission protocol selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, derive_more::Display)]
pub enum Protocol {
    /// Negotiated with the card, T=1 preferred
    #[default]
    #[display("auto")]
    Auto,
    /// Byte oriented T=0
    #[display("T=0")]
    T0,
    /// Block oriented T=1
    #[display("T=1")]
    T1,
}

impl Protocol {
    /// Selector as understood by the firmware: the protocol value plus one
    pub const fn wire_value(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::T0 => 1,
            Self::T1 => 2,
        }
    }
}

impl TryFrom<i8> for Protocol {
    type Error = Error;

    /// `-1` is auto, `0` is T=0 and `1` is T=1
    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Auto),
            0 => Ok(Self::T0),
            1 => Ok(Self::T1),
            other => Err(Error::configuration(format!(
                "unknown protocol value {other}"
            ))),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "-1" => Ok(Self::Auto),
            "t0" | "t=0" | "0" => Ok(Self::T0),
            "t1" | "t=1" | "1" => Ok(Self::T1),
            other => Err(Error::configuration(format!("unknown protocol {other:?}"))),
        }
    }
}

/// Smartcard connection parameters sent with the configure command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartcardConfig {
    /// Protocol to use
    pub protocol: Protocol,
    /// ETU to force, negotiated when `None`
    pub etu: Option<u32>,
    /// ISO7816 clock frequency to force, negotiated when `None`
    pub frequency: Option<u32>,
    /// Allow the board to negotiate the PTS
    pub negotiate_pts: bool,
    /// Allow the board to negotiate the baud rate
    pub negotiate_baudrate: bool,
}

impl Default for SmartcardConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Auto,
            etu: None,
            frequency: None,
            negotiate_pts: true,
            negotiate_baudrate: true,
        }
    }
}

impl SmartcardConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protocol
    pub const fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Force an ETU
    pub const fn with_etu(mut self, etu: u32) -> Self {
        self.etu = Some(etu);
        self
    }

    /// Force a clock frequency
    pub const fn with_frequency(mut self, frequency: u32) -> Self {
        self.frequency = Some(frequency);
        self
    }

    /// Set whether the PTS may be negotiated
    pub const fn with_negotiate_pts(mut self, negotiate_pts: bool) -> Self {
        self.negotiate_pts = negotiate_pts;
        self
    }

    /// Set whether the baud rate may be negotiated
    pub const fn with_negotiate_baudrate(mut self, negotiate_baudrate: bool) -> Self {
        self.negotiate_baudrate = negotiate_baudrate;
        self
    }

    /// Firmware payload for `protocol`, which may differ from the configured one
    /// during auto negotiation
    pub(crate) fn encode_for(&self, protocol: Protocol) -> Bytes {
        let mut buf = BytesMut::with_capacity(11);
        buf.put_u8(protocol.wire_value());
        buf.put_u32_le(self.etu.unwrap_or(0));
        buf.put_u32_le(self.frequency.unwrap_or(0));
        buf.put_u8(u8::from(self.negotiate_pts));
        buf.put_u8(u8::from(self.negotiate_baudrate));
        buf.freeze()
    }

    /// Firmware payload of the configure command
    pub fn encode(&self) -> Bytes {
        self.encode_for(self.protocol)
    }
}

/// Timing parameters of the framing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Pause between the probe byte and reading the waiting flag back
    pub probe_delay: Duration,
    /// Read timeout while opening the device
    pub initial_timeout: Duration,
    /// Read timeout once the device answered the probe
    pub operating_timeout: Duration,
    /// Maximum number of consecutive wait extensions tolerated per command
    pub max_wait_extensions: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            probe_delay: Duration::from_millis(100),
            initial_timeout: Duration::from_secs(1),
            operating_timeout: Duration::from_secs(10),
            max_wait_extensions: 1024,
        }
    }
}

impl LinkConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probe delay
    pub const fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    /// Set the timeout used while opening
    pub const fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    /// Set the timeout used once connected
    pub const fn with_operating_timeout(mut self, timeout: Duration) -> Self {
        self.operating_timeout = timeout;
        self
    }

    /// Set the bound on wait extensions
    pub const fn with_max_wait_extensions(mut self, max: usize) -> Self {
        self.max_wait_extensions = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_protocol_selector() {
        assert_eq!(Protocol::try_from(-1).unwrap(), Protocol::Auto);
        assert_eq!(Protocol::try_from(1).unwrap().wire_value(), 2);
        assert!(matches!(Protocol::try_from(2), Err(Error::Configuration(_))));
        assert_eq!("T=0".parse::<Protocol>().unwrap(), Protocol::T0);
        assert!("t2".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_smartcard_payload() {
        let config = SmartcardConfig::new()
            .with_protocol(Protocol::T0)
            .with_etu(372)
            .with_negotiate_baudrate(false);
        assert_eq!(
            config.encode().as_ref(),
            &hex!("01 74 01 00 00 00 00 00 00 01 00")
        );
        assert_eq!(
            SmartcardConfig::default().encode_for(Protocol::T1).as_ref(),
            &hex!("02 00 00 00 00 00 00 00 00 01 01")
        );
    }
}
