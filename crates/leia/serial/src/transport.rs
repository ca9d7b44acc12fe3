//! Serial port transport implementation

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use bytes::Bytes;
use serialport::SerialPort;
use smartleia_core::{Transport, TransportError};
use tracing::trace;

use crate::config::SerialConfig;

/// Transport implementation over a serial port
pub struct SerialTransport {
    /// Device path, like `/dev/ttyACM0`
    path: String,
    /// Configuration
    config: SerialConfig,
    /// Open port, if any
    port: Option<Box<dyn SerialPort>>,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Create a closed transport for the device at `path`
    pub fn new(path: impl Into<String>, config: SerialConfig) -> Self {
        Self {
            path: path.into(),
            config,
            port: None,
        }
    }

    /// Device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the port is open
    pub const fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port(&mut self) -> Result<&mut (dyn SerialPort + 'static), TransportError> {
        self.port.as_deref_mut().ok_or(TransportError::Closed)
    }

    /// Read into `buf` until it is full or the port times out
    fn fill(port: &mut dyn SerialPort, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.config.baud_rate)
            .timeout(self.config.timeout)
            .open()
            .map_err(io::Error::from)?;
        trace!(path = %self.path, baud_rate = self.config.baud_rate, "Opened serial port");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            trace!(path = %self.path, "Closed serial port");
        }
        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let port = self.port()?;
        let mut buf = vec![0u8; len];
        let filled = Self::fill(port, &mut buf)?;
        buf.truncate(filled);
        Ok(buf.into())
    }

    fn read_available(&mut self) -> Result<Bytes, TransportError> {
        let port = self.port()?;
        let available = port.bytes_to_read().map_err(io::Error::from)? as usize;
        if available == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; available];
        let filled = Self::fill(port, &mut buf)?;
        buf.truncate(filled);
        Ok(buf.into())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.config.timeout = timeout;
        if let Some(port) = self.port.as_mut() {
            port.set_timeout(timeout).map_err(io::Error::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_transport() {
        let mut transport = SerialTransport::new("/dev/null-leia", SerialConfig::default());
        assert!(!transport.is_open());
        assert!(matches!(transport.read(1), Err(TransportError::Closed)));
        assert!(matches!(transport.write(b" "), Err(TransportError::Closed)));
        transport.close().unwrap();
    }

    #[test]
    fn test_timeout_is_kept_while_closed() {
        let mut transport = SerialTransport::new("/dev/null-leia", SerialConfig::default());
        transport.set_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(transport.config.timeout, Duration::from_secs(10));
    }
}
