//! Protocol constants for the bootloader command set.

// ============================================================================
// Frame Markers
// ============================================================================

/// First byte of every command and acknowledgement frame.
pub const PACKET_START: u8 = 0x01;

/// Last byte of every command and acknowledgement frame.
pub const PACKET_END: u8 = 0x17;

/// Start marker + opcode/status + 16-bit length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// 16-bit checksum + end marker.
pub const FRAME_TRAILER_SIZE: usize = 3;

/// Smallest well-formed frame (no data).
pub const MIN_FRAME_SIZE: usize = FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE;

/// Shortest acknowledgement span accepted from the byte stream: start,
/// status, two data or length bytes, checksum low byte, end.
pub const MIN_ACK_SPAN: usize = 6;

// ============================================================================
// Command Opcodes (Host -> Device)
// ============================================================================

/// Verify the application checksum of the whole image.
pub const CMD_VERIFY_CHECKSUM: u8 = 0x31;

/// Report the first and last programmable row of a flash array.
pub const CMD_GET_FLASH_SIZE: u8 = 0x32;

/// Buffer a row fragment without committing it.
pub const CMD_SEND_DATA: u8 = 0x37;

/// Enter bootloader mode and report silicon identity.
pub const CMD_ENTER_BOOTLOADER: u8 = 0x38;

/// Commit the final fragment of a row to flash.
pub const CMD_PROGRAM_ROW: u8 = 0x39;

/// Report the checksum of a written row.
pub const CMD_VERIFY_ROW: u8 = 0x3A;

/// Leave the bootloader and start the application.
pub const CMD_EXIT_BOOTLOADER: u8 = 0x3B;

// ============================================================================
// Acknowledgement Status
// ============================================================================

/// Status byte of a successful acknowledgement. Anything else is an error.
pub const STATUS_SUCCESS: u8 = 0x00;

// ============================================================================
// Acknowledgement Field Offsets (hex digit positions)
// ============================================================================

/// Status byte, directly after the start marker.
pub const ACK_STATUS: std::ops::Range<usize> = 2..4;

/// Silicon ID reported by enter-bootloader.
pub const ACK_SILICON_ID: std::ops::Range<usize> = 8..16;

/// Silicon revision reported by enter-bootloader.
pub const ACK_SILICON_REV: std::ops::Range<usize> = 16..18;

/// First row of the flash array (byte-swapped 16-bit word).
pub const ACK_START_ROW: std::ops::Range<usize> = 8..12;

/// Last row of the flash array (byte-swapped 32-bit word).
pub const ACK_END_ROW: std::ops::Range<usize> = 8..16;

/// Row checksum reported by verify-row.
pub const ACK_ROW_CHECKSUM: std::ops::Range<usize> = 8..10;

// ============================================================================
// Size Constants
// ============================================================================

/// Default largest row fragment carried by a single frame.
pub const DEFAULT_MAX_DATA_SIZE: usize = 133;

/// Default bound on buffered inbound bytes awaiting a complete frame.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024;

/// Array ID + 16-bit row number prefixed to program-row and verify-row data.
pub const ROW_ADDRESS_SIZE: usize = 3;

/// Largest row fragment whose program-row data still fits the 16-bit
/// length field.
pub const MAX_FRAGMENT_SIZE: usize = u16::MAX as usize - ROW_ADDRESS_SIZE;

// ============================================================================
// Timing and Retries
// ============================================================================

/// Default time to wait for each acknowledgement.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5000;

/// Default number of times a row is rewritten after a checksum mismatch.
pub const DEFAULT_MAX_ROW_RETRIES: u32 = 3;

/// Default serial baud rate of the bootloader.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;
