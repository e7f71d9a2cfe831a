//! Custom error types for the communication engine.
//!
//! `CommError` consolidates every failure source the engine can hit: transport
//! I/O, configuration loading, protocol-level desynchronization and retry
//! exhaustion. Errors never cross the public boundary as panics; everything is
//! reported through `CommResult` and log output.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type CommResult<T> = std::result::Result<T, CommError>;

/// All failure modes of the communication engine.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serial port not connected")]
    NotConnected,

    #[error("Serial port already open on '{0}'")]
    AlreadyOpen(String),

    #[error("Short write: transport accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Receive timed out after {got} of {expected} bytes")]
    ReceiveTimeout { got: usize, expected: usize },

    #[error("Exchange id already assigned (old {old:#04x}, new {new:#04x})")]
    IdReassigned { old: u8, new: u8 },

    #[error("Payload of {len} bytes exceeds the wire limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Two interrupt notifications without an intervening reply")]
    InterruptStorm,

    #[error("Interrupt notification with bad parity (core {core:#04x}, parity {parity:#04x})")]
    InterruptParity { core: u8, parity: u8 },

    #[error("Wire desynchronized: {0} unclaimed bytes in the receive queue")]
    Desynchronized(usize),

    #[error("'{name}' failed after {attempts} attempts")]
    RetriesExhausted { name: String, attempts: u32 },

    #[error("'{name}' aborted: {reason}")]
    Aborted { name: String, reason: String },

    #[error("Request send failed for '{0}'")]
    SendFailed(String),

    #[error("Cannot switch target from {from} to {to}")]
    TargetSwitch { from: String, to: String },

    #[error("Unrecognized detect reply class {0:#04x}")]
    UnknownBoardClass(u8),

    #[error("No board found matching the configured device pattern")]
    NoBoardFound,

    #[error("Invalid device pattern: {0}")]
    DevicePattern(#[from] regex::Error),
}
