//! Transport capability for talking to the LEIA board
//!
//! The framing protocol only needs an ordered, reliable byte channel with a
//! bounded read timeout. Concrete implementations (serial port, emulator) live
//! outside of the protocol code and expose exactly this narrow interface.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

/// Transport error type
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O failure on the underlying channel
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel is not open
    #[error("Transport is closed")]
    Closed,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}

/// Byte oriented duplex channel to a LEIA board
///
/// Reads never block longer than the configured timeout: a read that times out
/// returns whatever arrived so far, possibly nothing.
pub trait Transport: Send + fmt::Debug {
    /// Open (or reopen) the channel
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the channel
    fn close(&mut self) -> Result<(), TransportError>;

    /// Read up to `len` bytes, stopping early when the timeout elapses
    fn read(&mut self, len: usize) -> Result<Bytes, TransportError>;

    /// Read every byte that is already buffered, without waiting
    fn read_available(&mut self) -> Result<Bytes, TransportError>;

    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Change the read timeout
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn read(&mut self, len: usize) -> Result<Bytes, TransportError> {
        (**self).read(len)
    }

    fn read_available(&mut self) -> Result<Bytes, TransportError> {
        (**self).read_available()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        (**self).set_timeout(timeout)
    }
}
