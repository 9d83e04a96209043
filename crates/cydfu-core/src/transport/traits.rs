//! Transport layer abstraction.
//!
//! Defines the `DfuTransport` trait for byte-oriented links to the
//! bootloader (serial, BLE bridge, ...), allowing different implementations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Abstract link to the bootloader.
///
/// `write` returning `Ok` is the completion of a frame write. Writes must be
/// delivered in call order.
pub trait DfuTransport: Send + Sync {
    /// Write one complete frame.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever bytes are available, up to `max_len`.
    ///
    /// Returns `TransportError::Timeout` when nothing arrived in time. The
    /// returned chunk has no alignment to frame boundaries.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;
}
