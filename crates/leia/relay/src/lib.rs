//! PCSC relay for the LEIA smartcard reader
//!
//! The relay connects to a vpcd virtual reader service (as shipped with
//! vsmartcard) and forwards its requests to the card inserted in a LEIA board,
//! so that any PC/SC application sees the board as a regular reader.
//!
//! Status words asking for a continuation (`61 xx`, `6C xx`, `67 xx`) are
//! handled by the relay itself, see [`transmit`].
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod error;
mod relay;
pub mod vpcd;

pub use config::{DEFAULT_HOST, DEFAULT_PORT, RelayConfig};
pub use error::RelayError;
pub use relay::{Relay, RelayHandle, transmit};
