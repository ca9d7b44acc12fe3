//! Error types for the serial transport

/// Serial specific errors
#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    /// Error reported by the serial port layer
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Discovery found no LEIA board
    #[error("No {vid:04x}/{pid:04x} device found")]
    NoDevice {
        /// USB vendor id searched for
        vid: u16,
        /// USB product id searched for
        pid: u16,
    },

    /// Discovery found more boards than it can choose from
    #[error("Too many {vid:04x}/{pid:04x} devices found ({count}), cannot choose one")]
    TooManyDevices {
        /// USB vendor id searched for
        vid: u16,
        /// USB product id searched for
        pid: u16,
        /// Number of candidates
        count: usize,
    },

    /// The board failed to answer
    #[error(transparent)]
    Leia(#[from] smartleia_core::Error),
}
