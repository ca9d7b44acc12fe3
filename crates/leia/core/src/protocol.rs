//! Command framing between the host and the LEIA firmware
//!
//! Every exchange follows the same half-duplex sequence:
//!
//! 1. liveness probe: the host writes `' '` and expects the waiting flag `'W'`
//! 2. dispatch: command id, 4-byte big-endian payload length, payload
//! 3. status: `'S'` plus a status code, possibly preceded by `'w'` wait extensions
//! 4. acknowledgement: `'R'`
//! 5. for commands that answer, a 4-byte big-endian length and the payload
//!
//! The firmware keeps no state between commands, so the probe runs before
//! every command.

use std::thread;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::apdu::MAX_APDU_PAYLOAD_SIZE;
use crate::config::LinkConfig;
use crate::error::{Error, PlatformError, Result, StatusError};
use crate::response::RESP_HEADER_SIZE;
use crate::transport::Transport;

/// Size of the command payload length field
pub const COMMAND_LEN_SIZE: usize = 4;

/// Size of the response length field
pub const RESPONSE_LEN_SIZE: usize = 4;

/// Largest response payload the firmware can produce
pub const MAX_RESPONSE_SIZE: usize = RESP_HEADER_SIZE + MAX_APDU_PAYLOAD_SIZE;

/// Answer to the liveness probe
pub const WAITING_FLAG: u8 = b'W';

/// Byte written to probe the firmware
pub const PROBE_BYTE: u8 = b' ';

/// Status phase flags
pub mod flag {
    /// Status follows
    pub const STATUS: u8 = b'S';
    /// The firmware needs more time
    pub const WAIT_EXTENSION: u8 = b'w';
    /// Command not supported
    pub const UNSUPPORTED: u8 = b'U';
    /// Unspecified firmware error
    pub const ERROR: u8 = b'E';
    /// Command acknowledged
    pub const ACK: u8 = b'R';
}

/// One byte command identifiers understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[repr(u8)]
pub enum CommandId {
    /// Reset the board
    #[display("reset")]
    Reset = b'r',
    /// Configure the smartcard connection
    #[display("configure smartcard")]
    ConfigureSmartcard = b'c',
    /// Read back a trigger strategy
    #[display("get trigger strategy")]
    GetTriggerStrategy = b'o',
    /// Install a trigger strategy
    #[display("set trigger strategy")]
    SetTriggerStrategy = b'O',
    /// Timers of the last exchange
    #[display("get timers")]
    GetTimers = b'm',
    /// Answer-To-Reset of the card
    #[display("get ATR")]
    GetAtr = b't',
    /// Card presence
    #[display("is card inserted")]
    IsCardInserted = b'?',
    /// Reboot into firmware update mode
    #[display("DFU")]
    Dfu = b'u',
    /// Forward an APDU to the card
    #[display("send APDU")]
    SendApdu = b'a',
}

impl CommandId {
    /// Byte sent on the wire
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Look up a command from its wire byte
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'r' => Self::Reset,
            b'c' => Self::ConfigureSmartcard,
            b'o' => Self::GetTriggerStrategy,
            b'O' => Self::SetTriggerStrategy,
            b'm' => Self::GetTimers,
            b't' => Self::GetAtr,
            b'?' => Self::IsCardInserted,
            b'u' => Self::Dfu,
            b'a' => Self::SendApdu,
            _ => return None,
        })
    }
}

/// Framing protocol over a [`Transport`]
///
/// A `Link` is not synchronized; callers sharing one must serialize complete
/// round trips themselves (see [`Leia`](crate::Leia)).
#[derive(Debug)]
pub struct Link<T: Transport> {
    transport: T,
    config: LinkConfig,
}

impl<T: Transport> Link<T> {
    /// Wrap an already opened transport
    pub const fn new(transport: T, config: LinkConfig) -> Self {
        Self { transport, config }
    }

    /// The link configuration
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The underlying transport
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Unwrap the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Open the transport and synchronize with the firmware
    ///
    /// The transport is opened with the short initial timeout, stale bytes are
    /// drained, the probe must succeed and the timeout is then widened.
    pub fn open(&mut self) -> Result<()> {
        self.transport.open()?;
        self.transport.set_timeout(self.config.initial_timeout)?;
        loop {
            let stale = self.transport.read_available()?;
            if stale.is_empty() {
                break;
            }
            trace!(stale = ?hex::encode(&stale), "Drained stale bytes");
        }
        self.probe()?;
        self.transport.set_timeout(self.config.operating_timeout)?;
        Ok(())
    }

    /// Close the transport
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        Ok(())
    }

    /// Resynchronize with the firmware by checking the waiting flag
    pub fn probe(&mut self) -> Result<()> {
        self.transport.read_available()?;
        self.transport.write(&[PROBE_BYTE])?;
        thread::sleep(self.config.probe_delay);

        let mut answer = BytesMut::from(self.transport.read(1)?.as_ref());
        answer.extend_from_slice(&self.transport.read_available()?);

        match answer.last() {
            Some(&WAITING_FLAG) => Ok(()),
            last => {
                debug!(answer = ?hex::encode(&answer), last = ?last, "Liveness probe failed");
                Err(Error::Connection)
            }
        }
    }

    /// Send a command and check its status and acknowledgement
    ///
    /// Nothing past the acknowledgement is read; commands that answer need a
    /// subsequent [`Self::read_response`].
    pub fn send_command(&mut self, command: CommandId, payload: &[u8]) -> Result<()> {
        self.probe()?;

        let length = u32::try_from(payload.len())
            .map_err(|_| Error::construction("command payload does not fit the length field"))?;
        let mut frame = BytesMut::with_capacity(1 + COMMAND_LEN_SIZE + payload.len());
        frame.put_u8(command.as_byte());
        frame.put_u32(length);
        frame.put_slice(payload);

        trace!(%command, frame = ?hex::encode(&frame), "Sending command");
        self.transport.write(&frame)?;

        self.check_status().inspect_err(|err| {
            debug!(%command, error = ?err, "Status phase failed");
        })?;
        self.check_ack()
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.transport.read(1)?.first().copied())
    }

    fn check_status(&mut self) -> Result<()> {
        let mut extensions = 0;
        let flag = loop {
            match self.read_byte()? {
                Some(flag::WAIT_EXTENSION) => {
                    extensions += 1;
                    if extensions > self.config.max_wait_extensions {
                        return Err(Error::WaitTimeout { extensions });
                    }
                    trace!(extensions, "Wait extension");
                }
                other => break other,
            }
        };

        match flag {
            Some(flag::STATUS) => match self.read_byte()? {
                Some(0x00) => Ok(()),
                Some(code) => Err(StatusError::Platform(PlatformError::from_code(code)).into()),
                None => Err(StatusError::Missing.into()),
            },
            Some(flag::UNSUPPORTED) => Err(StatusError::Unsupported.into()),
            Some(flag::ERROR) => Err(StatusError::Firmware.into()),
            Some(other) => Err(StatusError::Invalid(other).into()),
            None => Err(StatusError::Missing.into()),
        }
    }

    fn check_ack(&mut self) -> Result<()> {
        match self.read_byte()? {
            Some(flag::ACK) => Ok(()),
            other => {
                debug!(received = ?other, "Missing acknowledgement");
                Err(Error::Ack(other))
            }
        }
    }

    /// Read the length prefixed response of the last command
    pub fn read_response(&mut self) -> Result<Bytes> {
        let header = self.transport.read(RESPONSE_LEN_SIZE)?;
        let header: [u8; RESPONSE_LEN_SIZE] = header
            .as_ref()
            .try_into()
            .map_err(|_| Error::Framing("truncated response length"))?;
        let length = u32::from_be_bytes(header) as usize;
        if length > MAX_RESPONSE_SIZE {
            return Err(Error::Framing("response length exceeds the largest firmware structure"));
        }

        let response = self.transport.read(length)?;
        if response.len() != length {
            debug!(expected = length, received = response.len(), "Short response");
            return Err(Error::Framing("truncated response payload"));
        }
        trace!(response = ?hex::encode(&response), "Received response");
        Ok(response)
    }

    /// Send a command and read its response
    pub fn transceive(&mut self, command: CommandId, payload: &[u8]) -> Result<Bytes> {
        self.send_command(command, payload)?;
        self.read_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{MockLeia, MockReply};

    fn link(mock: &MockLeia) -> Link<MockLeia> {
        Link::new(
            mock.clone(),
            LinkConfig::default()
                .with_probe_delay(Duration::ZERO)
                .with_max_wait_extensions(3),
        )
    }

    #[test]
    fn test_frame_layout() {
        let mock = MockLeia::with_handler(|_, _| MockReply::data([0xAB]));
        let mut link = link(&mock);
        let response = link.transceive(CommandId::GetTriggerStrategy, &[0x02]).unwrap();
        assert_eq!(response.as_ref(), &[0xAB]);
        assert_eq!(mock.written(), b" o\x00\x00\x00\x01\x02".to_vec());
    }

    #[test]
    fn test_empty_payload_still_sends_length() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok());
        let mut link = link(&mock);
        link.send_command(CommandId::Reset, &[]).unwrap();
        assert_eq!(mock.written(), b" r\x00\x00\x00\x00".to_vec());
    }

    #[test]
    fn test_failed_probe_writes_nothing_else() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok());
        mock.set_responsive(false);
        let mut link = link(&mock);
        let err = link.send_command(CommandId::SendApdu, &[]).unwrap_err();
        assert!(matches!(err, Error::Connection));
        assert_eq!(mock.written(), b" ".to_vec());
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_status_flags() {
        let cases = [
            (MockReply::status(b"U"), StatusError::Unsupported),
            (MockReply::status(b"E"), StatusError::Firmware),
            (
                MockReply::status(b"S\x01"),
                StatusError::Platform(PlatformError::CardNotInserted),
            ),
            (
                MockReply::status(b"S\xFF"),
                StatusError::Platform(PlatformError::Unknown),
            ),
            (
                MockReply::status(b"S\x42"),
                StatusError::Platform(PlatformError::Unlisted(0x42)),
            ),
            (MockReply::status(b"S"), StatusError::Missing),
            (MockReply::status(b"X"), StatusError::Invalid(b'X')),
            (MockReply::status(b""), StatusError::Missing),
        ];
        for (reply, expected) in cases {
            let mock = MockLeia::with_handler(move |_, _| reply.clone());
            let err = link(&mock).send_command(CommandId::Reset, &[]).unwrap_err();
            match err {
                Error::Status(status) => assert_eq!(status, expected),
                other => panic!("unexpected error {other:?}"),
            }
        }
    }

    #[test]
    fn test_wait_extensions_are_bounded() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok().with_wait_extensions(3));
        link(&mock).send_command(CommandId::Reset, &[]).unwrap();

        let mock = MockLeia::with_handler(|_, _| MockReply::ok().with_wait_extensions(4));
        let err = link(&mock).send_command(CommandId::Reset, &[]).unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { extensions: 4 }));
    }

    #[test]
    fn test_missing_ack() {
        let mock = MockLeia::with_handler(|_, _| MockReply::status(b"S\x00"));
        let err = link(&mock).send_command(CommandId::Reset, &[]).unwrap_err();
        assert!(matches!(err, Error::Ack(None)));

        let mock = MockLeia::with_handler(|_, _| MockReply::status(b"S\x00Q"));
        let err = link(&mock).send_command(CommandId::Reset, &[]).unwrap_err();
        assert!(matches!(err, Error::Ack(Some(b'Q'))));
    }

    #[test]
    fn test_truncated_response() {
        let mock = MockLeia::with_handler(|_, _| MockReply::raw(b"S\x00R\x00\x00\x00\x04\x01\x02"));
        let err = link(&mock).transceive(CommandId::GetTimers, &[]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));

        let mock = MockLeia::with_handler(|_, _| MockReply::raw(b"S\x00R\x00\x00"));
        let err = link(&mock).transceive(CommandId::GetTimers, &[]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn test_open_drains_and_probes() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok());
        mock.push_unsolicited(b"garbage");
        let mut link = link(&mock);
        link.open().unwrap();
        assert!(mock.is_open());
        assert_eq!(
            mock.timeouts(),
            vec![Duration::from_secs(1), Duration::from_secs(10)]
        );
    }

    #[test]
    fn test_command_ids() {
        for byte in *b"rcoOmt?ua" {
            let command = CommandId::from_byte(byte).unwrap();
            assert_eq!(command.as_byte(), byte);
        }
        assert_eq!(CommandId::from_byte(b'x'), None);
    }
}
