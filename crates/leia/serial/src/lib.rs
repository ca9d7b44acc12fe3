//! Serial transport for the LEIA smartcard reader
//!
//! This crate provides an implementation of the `Transport` trait from
//! `smartleia-core` over a USB serial port, and discovery of LEIA boards by
//! their USB vendor and product ids.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use smartleia_transport_serial::SerialDeviceManager;
//!
//! let manager = SerialDeviceManager::new();
//! for device in manager.list_devices()? {
//!     println!("Found LEIA on {}", device.path());
//! }
//!
//! let leia = manager.connect()?;
//! println!("Card inserted: {}", leia.is_card_inserted()?);
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
mod manager;
mod transport;

pub use config::{DEFAULT_BAUD_RATE, SerialConfig};
pub use error::SerialError;
pub use manager::{MAX_CANDIDATES, SerialDevice, SerialDeviceManager, USB_PID, USB_VID};
pub use transport::SerialTransport;
