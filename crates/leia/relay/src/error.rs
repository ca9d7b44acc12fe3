//! Error types for the relay

use std::io;

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The virtual reader service is not reachable
    #[error("Cannot connect to {addr}, is pcscd running with virtual smartcard readers?")]
    Connect {
        /// Address of the service
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// Socket failure on an established connection
    #[error("Relay I/O error: {0}")]
    Io(#[from] io::Error),

    /// The LEIA board failed
    #[error(transparent)]
    Leia(#[from] smartleia_core::Error),

    /// The worker thread panicked
    #[error("Relay worker panicked")]
    Panicked,
}
