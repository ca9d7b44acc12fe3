//! Discovery of LEIA boards among the serial ports

use serialport::{SerialPortInfo, SerialPortType};
use smartleia_core::{Error, Leia, LinkConfig};
use tracing::{debug, info};

use crate::config::SerialConfig;
use crate::error::SerialError;
use crate::transport::SerialTransport;

/// USB vendor id of the LEIA board
pub const USB_VID: u16 = 0x3483;

/// USB product id of the LEIA board
pub const USB_PID: u16 = 0x0BB9;

/// More candidates than this and discovery refuses to guess
pub const MAX_CANDIDATES: usize = 2;

/// A serial port exposed by a LEIA board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDevice {
    path: String,
    serial_number: Option<String>,
    product: Option<String>,
}

impl SerialDevice {
    /// Create a new device description
    pub const fn new(path: String, serial_number: Option<String>, product: Option<String>) -> Self {
        Self {
            path,
            serial_number,
            product,
        }
    }

    /// Device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// USB serial number, if reported
    pub fn serial_number(&self) -> Option<&str> {
        self.serial_number.as_deref()
    }

    /// USB product string, if reported
    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }
}

/// Keep the ports whose USB ids match a LEIA board
fn leia_ports(ports: Vec<SerialPortInfo>) -> Vec<SerialDevice> {
    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) if usb.vid == USB_VID && usb.pid == USB_PID => Some(
                SerialDevice::new(port.port_name, usb.serial_number, usb.product),
            ),
            _ => None,
        })
        .collect()
}

/// Apply the discovery rules to the candidate list
fn check_candidates(candidates: &[SerialDevice]) -> Result<(), SerialError> {
    match candidates.len() {
        0 => Err(SerialError::NoDevice {
            vid: USB_VID,
            pid: USB_PID,
        }),
        count if count > MAX_CANDIDATES => Err(SerialError::TooManyDevices {
            vid: USB_VID,
            pid: USB_PID,
            count,
        }),
        _ => Ok(()),
    }
}

/// Manager for LEIA boards attached over USB serial
#[derive(Debug, Clone, Default)]
pub struct SerialDeviceManager {
    serial: SerialConfig,
    link: LinkConfig,
}

impl SerialDeviceManager {
    /// Create a manager with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom serial configuration
    pub const fn with_serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }

    /// Use a custom link configuration
    pub const fn with_link_config(mut self, config: LinkConfig) -> Self {
        self.link = config;
        self
    }

    /// List the serial ports that look like LEIA boards
    pub fn list_devices(&self) -> Result<Vec<SerialDevice>, SerialError> {
        Ok(leia_ports(serialport::available_ports()?))
    }

    /// Open the board at `path`
    pub fn open_device(&self, path: &str) -> Result<Leia<SerialTransport>, SerialError> {
        let transport = SerialTransport::new(path, self.serial);
        let leia = Leia::open(transport, self.link)?;
        info!(path, "Connected to LEIA");
        Ok(leia)
    }

    /// Find a board and open it
    ///
    /// Every candidate is tried in turn and the first one answering the liveness
    /// probe is kept.
    pub fn connect(&self) -> Result<Leia<SerialTransport>, SerialError> {
        let candidates = self.list_devices()?;
        check_candidates(&candidates)?;

        let mut last_error = None;
        for candidate in &candidates {
            match self.open_device(candidate.path()) {
                Ok(leia) => return Ok(leia),
                Err(SerialError::Leia(err))
                    if matches!(err.root(), Error::Connection | Error::Transport(_)) =>
                {
                    debug!(path = candidate.path(), error = %err, "Candidate did not answer");
                    last_error = Some(SerialError::Leia(err));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or(SerialError::NoDevice {
            vid: USB_VID,
            pid: USB_PID,
        }))
    }

    /// Open `path` when given, discover a board otherwise
    pub fn open(&self, path: Option<&str>) -> Result<Leia<SerialTransport>, SerialError> {
        match path {
            Some(path) => self.open_device(path),
            None => self.connect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serialport::UsbPortInfo;

    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid,
                pid,
                serial_number: Some("0001".to_string()),
                manufacturer: None,
                product: Some("LEIA".to_string()),
            }),
        }
    }

    #[test]
    fn test_filter_by_usb_ids() {
        let ports = vec![
            usb("/dev/ttyACM0", USB_VID, USB_PID),
            usb("/dev/ttyACM1", 0x1234, USB_PID),
            SerialPortInfo {
                port_name: "/dev/ttyS0".to_string(),
                port_type: SerialPortType::Unknown,
            },
            usb("/dev/ttyACM2", USB_VID, USB_PID),
        ];
        let devices = leia_ports(ports);
        let paths: Vec<&str> = devices.iter().map(SerialDevice::path).collect();
        assert_eq!(paths, vec!["/dev/ttyACM0", "/dev/ttyACM2"]);
        assert_eq!(devices[0].serial_number(), Some("0001"));
        assert_eq!(devices[0].product(), Some("LEIA"));
    }

    #[test]
    fn test_candidate_rules() {
        let device = |path: &str| SerialDevice::new(path.to_string(), None, None);
        assert!(matches!(
            check_candidates(&[]),
            Err(SerialError::NoDevice { .. })
        ));
        assert!(check_candidates(&[device("a")]).is_ok());
        assert!(check_candidates(&[device("a"), device("b")]).is_ok());
        assert!(matches!(
            check_candidates(&[device("a"), device("b"), device("c")]),
            Err(SerialError::TooManyDevices { count: 3, .. })
        ));
    }
}
