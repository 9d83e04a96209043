//! Acknowledgement parsing.
//!
//! Acknowledgements are handled as hex text, the form in which they are
//! logged and captured from devices. Field positions below are hex digit
//! offsets into the frame, starting at the start marker.

use std::fmt;
use std::ops::Range;

use thiserror::Error;

use super::constants::*;
use crate::checksum::{byte_swap16, byte_swap32};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AckError {
    /// The bytes do not form a decodable acknowledgement.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The device set a nonzero status byte. The code itself is not kept.
    #[error("Device reported an error status")]
    DeviceStatus,
}

impl AckError {
    fn malformed(reason: impl Into<String>) -> Self {
        AckError::MalformedFrame(reason.into())
    }
}

/// A validated acknowledgement in normalized (uppercase, no whitespace) hex.
#[derive(Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    hex: String,
}

impl Acknowledgement {
    /// Normalize and validate acknowledgement text.
    pub fn parse(text: &str) -> Result<Self, AckError> {
        let hex: String = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if hex.is_empty() {
            return Err(AckError::malformed("empty acknowledgement"));
        }
        if hex.len() % 2 != 0 {
            return Err(AckError::malformed(format!(
                "odd number of hex digits ({})",
                hex.len()
            )));
        }
        if let Some(c) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(AckError::malformed(format!("invalid hex digit '{}'", c)));
        }
        Ok(Self { hex })
    }

    /// Wrap a frame extracted from the byte stream.
    pub fn from_frame(frame: &[u8]) -> Result<Self, AckError> {
        Self::parse(&hex::encode_upper(frame))
    }

    /// Normalized hex text.
    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// Frame length in bytes.
    pub fn len(&self) -> usize {
        self.hex.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }

    /// Hex digits at `range`, or `MalformedFrame` if the frame is too short.
    pub fn field(&self, range: Range<usize>) -> Result<&str, AckError> {
        self.hex.get(range.clone()).ok_or_else(|| {
            AckError::malformed(format!(
                "frame of {} bytes too short for field at {}..{}",
                self.len(),
                range.start,
                range.end
            ))
        })
    }

    fn field_u8(&self, range: Range<usize>) -> Result<u8, AckError> {
        let digits = self.field(range)?;
        u8::from_str_radix(digits, 16).map_err(|e| AckError::malformed(e.to_string()))
    }

    fn field_u16(&self, range: Range<usize>) -> Result<u16, AckError> {
        let digits = self.field(range)?;
        u16::from_str_radix(digits, 16).map_err(|e| AckError::malformed(e.to_string()))
    }

    fn field_u32(&self, range: Range<usize>) -> Result<u32, AckError> {
        let digits = self.field(range)?;
        u32::from_str_radix(digits, 16).map_err(|e| AckError::malformed(e.to_string()))
    }

    /// Status byte.
    pub fn status(&self) -> Result<u8, AckError> {
        self.field_u8(ACK_STATUS)
    }

    /// Check the start marker and status, failing on a device error.
    pub fn require_success(&self) -> Result<(), AckError> {
        let start = self.field_u8(0..2)?;
        if start != PACKET_START {
            return Err(AckError::malformed(format!(
                "expected start marker 0x{:02X}, got 0x{:02X}",
                PACKET_START, start
            )));
        }
        if self.status()? != STATUS_SUCCESS {
            return Err(AckError::DeviceStatus);
        }
        Ok(())
    }
}

impl fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Acknowledgement({})", self.hex)
    }
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Enter-bootloader acknowledgement: device identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnterBootloaderAck {
    pub silicon_id: String,
    pub silicon_rev: String,
}

/// Get-flash-size acknowledgement: programmable row range of one array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashSizeAck {
    pub start_row: u32,
    pub end_row: u32,
}

/// Send-data and program-row acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAck {
    pub status: u8,
}

/// Verify-row acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyRowAck {
    pub response_code: u8,
    pub row_checksum: u8,
}

/// Verify-checksum acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyChecksumAck {
    pub checksum_status: u8,
}

/// Whatever the device sent after exit-bootloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitAck {
    pub residual: Vec<u8>,
}

impl ExitAck {
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.residual)
    }
}

fn successful(text: &str) -> Result<Acknowledgement, AckError> {
    let ack = Acknowledgement::parse(text)?;
    ack.require_success()?;
    Ok(ack)
}

pub fn parse_enter_bootloader(text: &str) -> Result<EnterBootloaderAck, AckError> {
    let ack = successful(text)?;
    Ok(EnterBootloaderAck {
        silicon_id: ack.field(ACK_SILICON_ID)?.to_string(),
        silicon_rev: ack.field(ACK_SILICON_REV)?.to_string(),
    })
}

pub fn parse_flash_size(text: &str) -> Result<FlashSizeAck, AckError> {
    let ack = successful(text)?;
    Ok(FlashSizeAck {
        start_row: byte_swap16(ack.field_u16(ACK_START_ROW)?) as u32,
        end_row: byte_swap32(ack.field_u32(ACK_END_ROW)?),
    })
}

pub fn parse_send_data(text: &str) -> Result<RowAck, AckError> {
    let ack = successful(text)?;
    Ok(RowAck {
        status: ack.status()?,
    })
}

pub fn parse_program_row(text: &str) -> Result<RowAck, AckError> {
    parse_send_data(text)
}

pub fn parse_verify_row(text: &str) -> Result<VerifyRowAck, AckError> {
    let ack = successful(text)?;
    Ok(VerifyRowAck {
        response_code: ack.status()?,
        row_checksum: ack.field_u8(ACK_ROW_CHECKSUM)?,
    })
}

pub fn parse_verify_checksum(text: &str) -> Result<VerifyChecksumAck, AckError> {
    let ack = successful(text)?;
    Ok(VerifyChecksumAck {
        checksum_status: ack.status()?,
    })
}

/// The device may reset before answering exit-bootloader, so nothing
/// beyond decodability is checked.
pub fn parse_exit(text: &str) -> Result<ExitAck, AckError> {
    let ack = Acknowledgement::parse(text)?;
    let residual = hex::decode(ack.as_hex()).map_err(|e| AckError::malformed(e.to_string()))?;
    Ok(ExitAck { residual })
}
