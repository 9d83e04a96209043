//! Flash row records.

use crate::checksum::{ChecksumType, row_verification_sum};

/// One programmable row of the firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRow {
    array_id: u8,
    row: [u8; 2],
    row_number: String,
    data: Vec<u8>,
    checksum: u16,
}

impl FlashRow {
    /// `row` is in wire order, low byte first.
    pub fn new(array_id: u8, row: [u8; 2], data: Vec<u8>, checksum: u16) -> Self {
        Self {
            array_id,
            row,
            row_number: format!("{:02X}{:02X}", row[0], row[1]),
            data,
            checksum,
        }
    }

    /// Flash array (bank) index.
    pub fn array_id(&self) -> u8 {
        self.array_id
    }

    /// Row number as four hex digits, low byte first (`"D500"` is row 0xD5).
    pub fn row_number(&self) -> &str {
        &self.row_number
    }

    /// Row number bytes in wire order.
    pub fn row_bytes(&self) -> [u8; 2] {
        self.row
    }

    /// Numeric row address.
    pub fn row_address(&self) -> u16 {
        u16::from_le_bytes(self.row)
    }

    pub fn data_length(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Checksum as read from the image.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Checksum the device is expected to report for this row after
    /// programming: the low byte of the sum of the image checksum, array ID,
    /// row number and data length.
    pub fn expected_device_checksum(&self, checksum_type: ChecksumType) -> u8 {
        let mut bytes = match checksum_type {
            ChecksumType::Summation => vec![self.checksum as u8],
            ChecksumType::Crc16 => self.checksum.to_le_bytes().to_vec(),
        };
        bytes.push(self.array_id);
        bytes.extend_from_slice(&self.row);
        bytes.extend_from_slice(&self.data_length().to_le_bytes());
        (row_verification_sum(&bytes) & 0xFF) as u8
    }
}
