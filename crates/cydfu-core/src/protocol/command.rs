//! Command frame construction.
//!
//! Every command travels as
//! `[START, opcode, len_lo, len_hi, data.., checksum_lo, checksum_hi, END]`
//! where the checksum covers the opcode, the length and the data.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use crate::checksum::{ChecksumType, packet_checksum};
use crate::transport::{DfuTransport, TransportError};

/// Bootloader commands understood by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnterBootloader,
    GetFlashSize,
    SendData,
    ProgramRow,
    VerifyRow,
    VerifyChecksum,
    ExitBootloader,
}

impl Command {
    /// Wire opcode.
    pub const fn opcode(self) -> u8 {
        match self {
            Command::EnterBootloader => CMD_ENTER_BOOTLOADER,
            Command::GetFlashSize => CMD_GET_FLASH_SIZE,
            Command::SendData => CMD_SEND_DATA,
            Command::ProgramRow => CMD_PROGRAM_ROW,
            Command::VerifyRow => CMD_VERIFY_ROW,
            Command::VerifyChecksum => CMD_VERIFY_CHECKSUM,
            Command::ExitBootloader => CMD_EXIT_BOOTLOADER,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::EnterBootloader => write!(f, "ENTER_BOOTLOADER"),
            Command::GetFlashSize => write!(f, "GET_FLASH_SIZE"),
            Command::SendData => write!(f, "SEND_DATA"),
            Command::ProgramRow => write!(f, "PROGRAM_ROW"),
            Command::VerifyRow => write!(f, "VERIFY_ROW"),
            Command::VerifyChecksum => write!(f, "VERIFY_CHECKSUM"),
            Command::ExitBootloader => write!(f, "EXIT_BOOTLOADER"),
        }
    }
}

/// An outbound command with its data region, not yet encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    command: Command,
    data: Vec<u8>,
}

impl CommandFrame {
    pub fn new(command: Command, data: Vec<u8>) -> Self {
        Self { command, data }
    }

    pub fn enter_bootloader() -> Self {
        Self::new(Command::EnterBootloader, Vec::new())
    }

    pub fn get_flash_size(array_id: u8) -> Self {
        Self::new(Command::GetFlashSize, vec![array_id])
    }

    /// Non-final fragment of a row.
    pub fn send_data(fragment: &[u8]) -> Self {
        Self::new(Command::SendData, fragment.to_vec())
    }

    /// Final fragment of a row, committing it at `row` of `array_id`.
    ///
    /// `row` is in wire order (low byte first).
    pub fn program_row(array_id: u8, row: [u8; 2], fragment: &[u8]) -> Self {
        let mut data = Vec::with_capacity(ROW_ADDRESS_SIZE + fragment.len());
        data.push(array_id);
        data.extend_from_slice(&row);
        data.extend_from_slice(fragment);
        Self::new(Command::ProgramRow, data)
    }

    pub fn verify_row(array_id: u8, row: [u8; 2]) -> Self {
        Self::new(Command::VerifyRow, vec![array_id, row[0], row[1]])
    }

    pub fn verify_checksum() -> Self {
        Self::new(Command::VerifyChecksum, Vec::new())
    }

    pub fn exit_bootloader() -> Self {
        Self::new(Command::ExitBootloader, Vec::new())
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encode to wire bytes.
    ///
    /// The data region must fit the 16-bit length field (see
    /// [`MAX_FRAGMENT_SIZE`]).
    pub fn encode(&self, checksum_type: ChecksumType) -> Vec<u8> {
        debug_assert!(self.data.len() <= u16::MAX as usize);

        let mut frame = Vec::with_capacity(MIN_FRAME_SIZE + self.data.len());
        frame.push(PACKET_START);
        frame.push(self.command.opcode());

        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, self.data.len() as u16);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&self.data);

        let mut checksum = [0u8; 2];
        LittleEndian::write_u16(&mut checksum, packet_checksum(checksum_type, &frame[1..]));
        frame.extend_from_slice(&checksum);
        frame.push(PACKET_END);
        frame
    }

    /// Encode and hand the frame to `transport`.
    ///
    /// Returning `Ok` is the write completion: the bytes are with the
    /// transport, not necessarily acknowledged by the device.
    pub fn write_to<T: DfuTransport + ?Sized>(
        &self,
        transport: &T,
        checksum_type: ChecksumType,
    ) -> Result<Vec<u8>, TransportError> {
        let frame = self.encode(checksum_type);
        transport.write(&frame)?;
        Ok(frame)
    }
}
