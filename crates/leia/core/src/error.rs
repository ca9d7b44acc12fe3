//! Core error type for all LEIA operations
//!
//! Every public operation of this crate either returns a decoded value or one of
//! the variants below; there is no partial success. Context can be layered on top
//! of any error with [`ResultExt::context`].

use crate::transport::TransportError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Wire framing errors
    //
    /// The liveness probe did not read back the waiting flag
    #[error("Connection error: LEIA did not answer the liveness probe")]
    Connection,

    /// The acknowledgement byte was missing or wrong
    #[error("Acknowledgement error: expected 'R', received {0:02x?}")]
    Ack(Option<u8>),

    /// The status phase reported a failure
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Malformed length field or premature end of stream
    #[error("Framing error: {0}")]
    Framing(&'static str),

    /// The device kept asking for more time past the configured bound
    #[error("Timed out after {extensions} wait extensions")]
    WaitTimeout {
        /// Number of 'w' bytes received before giving up
        extensions: usize,
    },

    //
    // Structure errors
    //
    /// Caller supplied structure violates a size or shape invariant
    #[error("Construction error: {0}")]
    Construction(String),

    /// A byte sequence could not be decoded into a structure
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Unsupported smartcard configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    //
    // Collaborator errors
    //
    /// The underlying byte channel failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a construction error
    pub fn construction<S: Into<String>>(message: S) -> Self {
        Self::Construction(message.into())
    }

    /// Create a decoding error
    pub fn decoding<S: Into<String>>(message: S) -> Self {
        Self::Decoding(message.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    /// Strip any context layers and return the underlying error
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Failure reported by the firmware during the status phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// 'U': the firmware does not handle this command
    #[error("LEIA firmware does not handle this command")]
    Unsupported,

    /// 'E': unspecified firmware error
    #[error("Unknown firmware error (E)")]
    Firmware,

    /// 'S' followed by a nonzero platform code
    #[error("Platform error: {0}")]
    Platform(PlatformError),

    /// A status flag that is not part of the protocol
    #[error("Invalid status flag {0:#04x} received")]
    Invalid(u8),

    /// No status flag or status code arrived before the read timed out
    #[error("No status flag received")]
    Missing,
}

/// Platform error codes carried after an 'S' status flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PlatformError {
    /// 0x01
    #[display("PLATFORM_ERR_CARD_NOT_INSERTED")]
    CardNotInserted,
    /// 0xFF
    #[display("UNKNOWN_ERROR")]
    Unknown,
    /// Any code outside the known table
    #[display("unlisted platform error code {_0:#04x}")]
    Unlisted(u8),
}

impl PlatformError {
    /// Map a nonzero status code onto the known error table
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::CardNotInserted,
            0xFF => Self::Unknown,
            other => Self::Unlisted(other),
        }
    }
}

/// Extension trait for Result with LEIA Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
