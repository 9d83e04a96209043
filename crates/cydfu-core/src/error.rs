//! Update error taxonomy.
//!
//! Parse-time problems (`ImageError`, `AckError`) are returned straight to
//! the caller. Everything that goes wrong while an update is running ends up
//! here and is delivered through the `Error` notification.

use thiserror::Error;

use crate::protocol::Command;

/// Fatal (or, for row checksums, retriable) conditions of a running update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The device answered with a nonzero status byte.
    #[error("Device rejected {command}")]
    DeviceStatus { command: Command },

    /// The connected silicon is not the one the image was built for.
    #[error(
        "Device mismatch: image targets {expected_id} rev {expected_rev}, device is {actual_id} rev {actual_rev}"
    )]
    DeviceMismatch {
        expected_id: String,
        expected_rev: String,
        actual_id: String,
        actual_rev: String,
    },

    /// A row address falls outside the flash bounds reported for its array.
    #[error("Row {row} of array {array_id} is outside flash rows {start}..={end}")]
    RowOutOfRange {
        array_id: u8,
        row: String,
        start: u32,
        end: u32,
    },

    /// The device computed a different checksum for a programmed row.
    #[error("Row {row} checksum mismatch: expected 0x{expected:02X}, device reported 0x{actual:02X}")]
    RowChecksumMismatch { row: String, expected: u8, actual: u8 },

    /// The device rejected the checksum of the whole application.
    #[error("Application checksum verification failed")]
    ImageChecksumMismatch,

    /// No acknowledgement arrived in time.
    #[error("Timed out after {timeout_ms}ms waiting for {command} acknowledgement")]
    Timeout { command: Command, timeout_ms: u64 },

    /// A frame could not be handed to the transport.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl UpdateError {
    /// Short code carried by the error notification.
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::DeviceStatus { .. } => "DEVICE_STATUS_ERROR",
            UpdateError::DeviceMismatch { .. } => "DEVICE_MISMATCH",
            UpdateError::RowOutOfRange { .. } => "ROW_OUT_OF_RANGE",
            UpdateError::RowChecksumMismatch { .. } => "ROW_CHECKSUM_MISMATCH",
            UpdateError::ImageChecksumMismatch => "IMAGE_CHECKSUM_MISMATCH",
            UpdateError::Timeout { .. } => "TIMEOUT",
            UpdateError::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// Only a single row's checksum is worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(self, UpdateError::RowChecksumMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = [
            (
                UpdateError::DeviceStatus {
                    command: Command::ProgramRow,
                },
                "DEVICE_STATUS_ERROR",
            ),
            (UpdateError::ImageChecksumMismatch, "IMAGE_CHECKSUM_MISMATCH"),
            (
                UpdateError::Timeout {
                    command: Command::VerifyRow,
                    timeout_ms: 10,
                },
                "TIMEOUT",
            ),
            (UpdateError::Transport("gone".into()), "TRANSPORT_ERROR"),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code);
            assert!(!error.is_retriable());
        }
    }

    #[test]
    fn test_row_checksum_is_retriable() {
        let error = UpdateError::RowChecksumMismatch {
            row: "D500".into(),
            expected: 0xDE,
            actual: 0x00,
        };
        assert!(error.is_retriable());
        assert_eq!(error.code(), "ROW_CHECKSUM_MISMATCH");
        assert_eq!(
            error.to_string(),
            "Row D500 checksum mismatch: expected 0xDE, device reported 0x00"
        );
    }

    #[test]
    fn test_display_names_command() {
        let error = UpdateError::DeviceStatus {
            command: Command::EnterBootloader,
        };
        assert_eq!(error.to_string(), "Device rejected ENTER_BOOTLOADER");
    }
}
