//! State machine implementation for the bootloader update.

use std::fmt;
use std::ops::Range;
use std::time::Instant;

use super::accumulator::FrameAccumulator;
use crate::error::UpdateError;
use crate::protocol::Command;

/// Phase of an update. Row states carry the row index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateState {
    #[default]
    Idle,
    EnteringBootloader,
    ReadingFlashSize,
    ProgrammingRow(usize),
    VerifyingRow(usize),
    VerifyingChecksum,
    ExitingBootloader,
    Done,
    Error,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "IDLE"),
            UpdateState::EnteringBootloader => write!(f, "ENTERING_BOOTLOADER"),
            UpdateState::ReadingFlashSize => write!(f, "READING_FLASH_SIZE"),
            UpdateState::ProgrammingRow(i) => write!(f, "PROGRAMMING_ROW({})", i),
            UpdateState::VerifyingRow(i) => write!(f, "VERIFYING_ROW({})", i),
            UpdateState::VerifyingChecksum => write!(f, "VERIFYING_CHECKSUM"),
            UpdateState::ExitingBootloader => write!(f, "EXITING_BOOTLOADER"),
            UpdateState::Done => write!(f, "DONE"),
            UpdateState::Error => write!(f, "ERROR"),
        }
    }
}

impl UpdateState {
    /// `Done` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Done | UpdateState::Error)
    }

    /// Anything between start and a terminal state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != UpdateState::Idle
    }
}

/// Fragment tracking within one row.
#[derive(Debug, Default, Clone)]
pub struct ChunkTracker {
    /// Number of frames for the row, at least one.
    pub total_chunks: usize,
    /// Current chunk index.
    pub current_chunk: usize,
    /// Row data length.
    pub data_size: usize,
    /// Largest fragment.
    pub chunk_size: usize,
}

impl ChunkTracker {
    pub fn new(data_size: usize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            total_chunks: data_size.div_ceil(chunk_size).max(1),
            current_chunk: 0,
            data_size,
            chunk_size,
        }
    }

    /// Byte offset of the current fragment.
    pub fn byte_offset(&self) -> usize {
        (self.current_chunk * self.chunk_size).min(self.data_size)
    }

    /// Byte range of the current fragment.
    pub fn range(&self) -> Range<usize> {
        let start = self.byte_offset();
        start..(start + self.chunk_size).min(self.data_size)
    }

    pub fn advance(&mut self) {
        self.current_chunk += 1;
    }

    pub fn is_last_chunk(&self) -> bool {
        self.current_chunk + 1 >= self.total_chunks
    }
}

/// Command awaiting its acknowledgement.
#[derive(Debug, Clone, Copy)]
pub struct PendingAck {
    pub command: Command,
    pub deadline: Instant,
}

/// Session state holding all runtime data of one update.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Current phase.
    pub state: UpdateState,
    /// Row being programmed or verified.
    pub row_index: usize,
    /// Fragment position within the current row.
    pub chunk: ChunkTracker,
    /// Array IDs still to query, in image order.
    pub arrays: Vec<u8>,
    /// Next entry of `arrays` to query.
    pub array_index: usize,
    /// Failed verifications of the current row.
    pub row_retries: u32,
    /// Rows programmed and verified.
    pub rows_done: usize,
    /// Whether the start notification went out.
    pub flash_started: bool,
    pub pending: Option<PendingAck>,
    /// Condition that ended the update.
    pub last_error: Option<UpdateError>,
    /// Inbound bytes not yet framed.
    pub accumulator: FrameAccumulator,
}

impl SessionState {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            accumulator: FrameAccumulator::new(max_buffer_size),
            ..Default::default()
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: UpdateState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    pub fn pending_command(&self) -> Option<Command> {
        self.pending.map(|p| p.command)
    }
}
