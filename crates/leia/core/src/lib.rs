//! Host side driver for the LEIA smartcard reader
//!
//! This crate speaks the private framing protocol of the LEIA firmware over any
//! byte oriented [`Transport`] and provides the ISO7816 structures exchanged
//! with the card through it.
//!
//! ## Overview
//!
//! - [`Link`] implements the probe, dispatch, status and acknowledgement phases
//!   of every command
//! - [`Apdu`], [`Resp`], [`Atr`], [`Timers`] and [`TriggerStrategy`] encode and
//!   decode the firmware structures
//! - [`Apdu::from_raw`] rebuilds an APDU from a raw ISO7816 byte string
//! - [`Leia`] is the device API, safe to share between a foreground caller and
//!   a relay worker
//!
//! Enable the `mock` feature for a scripted firmware emulator usable in tests.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

// Re-export bytes for convenience
pub use bytes::{Bytes, BytesMut};

pub mod apdu;
pub mod atr;
pub mod config;
pub mod protocol;
pub mod response;
pub mod timers;
pub mod transport;
pub mod trigger;

mod device;
mod error;
mod layout;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use apdu::{Apdu, LeForm, MAX_APDU_PAYLOAD_SIZE};
pub use atr::Atr;
pub use config::{LinkConfig, Protocol, SmartcardConfig};
pub use device::Leia;
pub use error::{Error, PlatformError, Result, ResultExt, StatusError};
pub use protocol::{CommandId, Link};
pub use response::{Resp, StatusWord};
pub use timers::Timers;
pub use transport::{Transport, TransportError};
pub use trigger::{STRATEGY_MAX, TriggerPoint, TriggerStrategy};

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Apdu, Atr, Bytes, BytesMut, Error, LeForm, Leia, LinkConfig, Protocol, Resp, Result,
        ResultExt, SmartcardConfig, StatusWord, Timers, Transport, TransportError, TriggerPoint,
        TriggerStrategy,
    };
}
