//! Checksum engine.
//!
//! The bootloader protects every frame with a 16-bit checksum whose
//! algorithm is selected by the firmware image header: a two's-complement
//! summation or CRC16. Row verification uses a plain unmasked byte sum.

use std::fmt;

use crc16::{State, X_25};

/// Checksum algorithm selector taken from the image header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChecksumType {
    /// Two's complement of the byte sum, masked to 16 bits.
    #[default]
    Summation,
    /// CRC16 as computed by the bootloader.
    Crc16,
}

impl ChecksumType {
    /// Decode the header selector. Zero selects summation, anything else CRC16.
    pub fn from_selector(selector: u8) -> Self {
        match selector {
            0 => ChecksumType::Summation,
            _ => ChecksumType::Crc16,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumType::Summation => write!(f, "Summation"),
            ChecksumType::Crc16 => write!(f, "CRC16"),
        }
    }
}

/// Swap the two bytes of a 16-bit word.
#[inline]
pub const fn byte_swap16(word: u16) -> u16 {
    word.swap_bytes()
}

/// Reverse all four bytes of a 32-bit word.
#[inline]
pub const fn byte_swap32(word: u32) -> u32 {
    word.swap_bytes()
}

/// Compute the 16-bit frame checksum over `bytes`.
pub fn packet_checksum(checksum_type: ChecksumType, bytes: &[u8]) -> u16 {
    match checksum_type {
        ChecksumType::Summation => {
            let sum = bytes
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
            (0x1_0000u32.wrapping_sub(sum) & 0xFFFF) as u16
        }
        ChecksumType::Crc16 => State::<X_25>::calculate(bytes),
    }
}

/// Plain sum of all bytes, used to confirm a device-reported row checksum.
pub fn row_verification_sum(bytes: &[u8]) -> u32 {
    bytes.iter().map(|&b| b as u32).sum()
}
