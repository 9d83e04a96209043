//! Firmware image parsing.
//!
//! The image is line-oriented hex text:
//!
//! ```text
//! 0E50119E0000                     header: silicon ID, revision, checksum type
//! :0100D50080 <256 digits> 88      row: array, row, length, data, checksum
//! :END                             terminator
//! ```
//!
//! Multi-byte header fields are stored little-endian and read by reversing
//! the order of digit pairs. Row fields are big-endian.

use thiserror::Error;
use tracing::{debug, warn};

use super::row::FlashRow;
use crate::checksum::ChecksumType;

/// Prefix of every data row.
pub const ROW_MARKER: char = ':';

/// Line that ends the image.
pub const END_MARKER: &str = ":END";

/// Hex digits in the header line.
pub const HEADER_DIGITS: usize = 12;

/// Array ID + row number + data length.
const ROW_PREFIX_SIZE: usize = 5;

/// Summation rows are read from the trailing three digits. Only the low
/// byte takes part in row verification.
const SUM_CHECKSUM_DIGITS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("Invalid header '{header}': {reason}")]
    InvalidHeader { header: String, reason: String },

    #[error("Line {line}: data row without a valid header")]
    MissingHeader { line: usize },

    #[error("Line {line}: invalid hex data")]
    InvalidHex { line: usize },

    #[error("Line {line}: row too short ({actual} bytes)")]
    RowTooShort { line: usize, actual: usize },

    #[error("Line {line}: expected {expected} bytes for {declared} data bytes, found {actual}")]
    LengthMismatch {
        line: usize,
        declared: u16,
        expected: usize,
        actual: usize,
    },
}

/// Decoded header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Header digits in big-endian order (`"00009E11500E"`).
    pub header: String,
    /// Eight hex digits.
    pub silicon_id: String,
    /// Two hex digits.
    pub silicon_rev: String,
    pub checksum_type: ChecksumType,
}

impl ImageHeader {
    /// Decode a 12-digit header line.
    pub fn parse(line: &str) -> Result<Self, ImageError> {
        let invalid = |reason: &str| ImageError::InvalidHeader {
            header: line.to_string(),
            reason: reason.to_string(),
        };

        if line.len() != HEADER_DIGITS {
            return Err(invalid("expected 12 hex digits"));
        }
        if !line.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid("not hexadecimal"));
        }

        let header = reverse_pairs(&line.to_ascii_uppercase());
        let selector =
            u8::from_str_radix(&header[0..2], 16).map_err(|_| invalid("not hexadecimal"))?;
        let checksum_type = ChecksumType::from_selector(selector);
        if selector > 1 {
            warn!(selector, "Unknown checksum selector, assuming CRC16");
        }

        Ok(Self {
            silicon_rev: header[2..4].to_string(),
            silicon_id: header[4..12].to_string(),
            checksum_type,
            header,
        })
    }
}

/// Step-wise parser over image text.
///
/// [`FirmwareImage::parse`] is the one-shot entry point; the parser exposes
/// the individual stages.
#[derive(Debug)]
pub struct ImageParser<'a> {
    /// Non-blank lines with their 1-based line numbers.
    lines: Vec<(usize, &'a str)>,
    header: Option<ImageHeader>,
    rows: Vec<FlashRow>,
}

impl<'a> ImageParser<'a> {
    pub fn new(text: &'a str) -> Self {
        let lines = text
            .trim()
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty())
            .collect();
        Self {
            lines,
            header: None,
            rows: Vec::new(),
        }
    }

    /// Number of non-blank lines, header and terminator included.
    pub fn total_lines(&self) -> usize {
        self.lines.len()
    }

    /// Decode the first line as the header. Empty text has no header.
    pub fn analyze_header(&mut self) -> Result<Option<&ImageHeader>, ImageError> {
        self.header = match self.lines.first() {
            Some((_, line)) => Some(ImageHeader::parse(line)?),
            None => None,
        };
        Ok(self.header.as_ref())
    }

    pub fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }

    /// Decode every data row up to the terminator.
    pub fn read_data_lines(&mut self) -> Result<&[FlashRow], ImageError> {
        self.rows.clear();

        for &(number, line) in self.lines.iter().skip(1) {
            if line.eq_ignore_ascii_case(END_MARKER) {
                break;
            }
            let Some(body) = line.strip_prefix(ROW_MARKER) else {
                warn!(line = number, "Ignoring line without row marker");
                continue;
            };
            let header = self
                .header
                .as_ref()
                .ok_or(ImageError::MissingHeader { line: number })?;
            let row = parse_row(number, body, header.checksum_type)?;
            self.rows.push(row);
        }

        debug!(rows = self.rows.len(), "Read data lines");
        Ok(&self.rows)
    }

    pub fn into_image(self) -> FirmwareImage {
        FirmwareImage {
            total_lines: self.lines.len(),
            header: self.header,
            rows: self.rows,
        }
    }
}

/// Reverse the order of digit pairs: `"ABCDEF"` becomes `"EFCDAB"`.
fn reverse_pairs(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(2).rev().flatten().collect()
}

fn parse_row(line: usize, body: &str, checksum_type: ChecksumType) -> Result<FlashRow, ImageError> {
    let bytes = hex::decode(body).map_err(|_| ImageError::InvalidHex { line })?;
    if bytes.len() < ROW_PREFIX_SIZE {
        return Err(ImageError::RowTooShort {
            line,
            actual: bytes.len(),
        });
    }

    let array_id = bytes[0];
    // Big-endian in the image, low byte first on the wire.
    let row = [bytes[2], bytes[1]];
    let declared = u16::from_be_bytes([bytes[3], bytes[4]]);

    let checksum_size = match checksum_type {
        ChecksumType::Summation => 1,
        ChecksumType::Crc16 => 2,
    };
    let expected = ROW_PREFIX_SIZE + declared as usize + checksum_size;
    if bytes.len() != expected {
        return Err(ImageError::LengthMismatch {
            line,
            declared,
            expected,
            actual: bytes.len(),
        });
    }

    let data_end = ROW_PREFIX_SIZE + declared as usize;
    let data = bytes[ROW_PREFIX_SIZE..data_end].to_vec();
    let checksum = match checksum_type {
        ChecksumType::Summation => {
            let digits = &body[body.len() - SUM_CHECKSUM_DIGITS..];
            u16::from_str_radix(digits, 16).map_err(|_| ImageError::InvalidHex { line })?
        }
        ChecksumType::Crc16 => u16::from_be_bytes([bytes[data_end], bytes[data_end + 1]]),
    };

    Ok(FlashRow::new(array_id, row, data, checksum))
}

/// A fully parsed firmware image. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    header: Option<ImageHeader>,
    rows: Vec<FlashRow>,
    total_lines: usize,
}

impl FirmwareImage {
    /// Parse image text. Empty and header-only text yield zero rows.
    pub fn parse(text: &str) -> Result<Self, ImageError> {
        let mut parser = ImageParser::new(text);
        parser.analyze_header()?;
        parser.read_data_lines()?;
        Ok(parser.into_image())
    }

    pub fn header(&self) -> Option<&ImageHeader> {
        self.header.as_ref()
    }

    pub fn silicon_id(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.silicon_id.as_str())
    }

    pub fn silicon_rev(&self) -> Option<&str> {
        self.header.as_ref().map(|h| h.silicon_rev.as_str())
    }

    /// Header checksum type, summation when there is no header.
    pub fn checksum_type(&self) -> ChecksumType {
        self.header
            .as_ref()
            .map(|h| h.checksum_type)
            .unwrap_or_default()
    }

    /// Rows in programming order.
    pub fn rows(&self) -> &[FlashRow] {
        &self.rows
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Distinct array IDs in order of first appearance.
    pub fn array_ids(&self) -> Vec<u8> {
        let mut ids = Vec::new();
        for row in &self.rows {
            if !ids.contains(&row.array_id()) {
                ids.push(row.array_id());
            }
        }
        ids
    }

    /// Total data bytes across all rows.
    pub fn data_size(&self) -> usize {
        self.rows.iter().map(|r| r.data().len()).sum()
    }
}
