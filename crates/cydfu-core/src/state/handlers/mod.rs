//! Acknowledgement handlers - one per protocol phase.
//!
//! This module is split into submodules by phase:
//! - `bootloader`: enter, flash size and exit
//! - `rows`: fragmenting, programming and verifying rows
//! - `checksum`: application checksum verification

mod bootloader;
mod checksum;
mod rows;

use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::checksum::ChecksumType;
use crate::error::UpdateError;
use crate::events::{DfuEvent, DfuObserver, LogLevel, PacketDirection};
use crate::payload::FirmwareImage;
use crate::protocol::{AckError, Command, CommandFrame};
use crate::session::SessionConfig;
use crate::state::machine::{PendingAck, SessionState, UpdateState};
use crate::transport::DfuTransport;

/// Leading bytes of a frame copied into packet events.
pub(crate) const PACKET_PREVIEW_LEN: usize = 32;

/// Result of handling an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleResult {
    /// Next command is on its way, or nothing to do.
    Continue,
    /// The exit frame was written. The update is done.
    Complete,
    /// Fatal condition.
    Error(UpdateError),
}

impl HandleResult {
    fn after_send(sent: Result<(), UpdateError>) -> Self {
        match sent {
            Ok(()) => HandleResult::Continue,
            Err(e) => HandleResult::Error(e),
        }
    }
}

/// Turn a device error status into a fatal result; pass malformed frames up.
fn status_error(err: AckError, command: Command) -> Result<HandleResult, AckError> {
    match err {
        AckError::DeviceStatus => Ok(HandleResult::Error(UpdateError::DeviceStatus { command })),
        other => Err(other),
    }
}

/// Handler context containing all resources of a running update.
pub struct HandlerContext<'a, T: DfuTransport, O: DfuObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub session: &'a mut SessionState,
    pub image: &'a FirmwareImage,
    pub config: &'a SessionConfig,
}

impl<'a, T: DfuTransport, O: DfuObserver> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn checksum_type(&self) -> ChecksumType {
        self.image.checksum_type()
    }

    pub(crate) fn goto(&mut self, to: UpdateState) {
        let from = self.session.state;
        if from != to {
            self.session.goto_state(to);
            self.emit(DfuEvent::StateChanged { from, to });
        }
    }

    /// Write `frame` and arm the acknowledgement deadline.
    pub(crate) fn send(&mut self, frame: CommandFrame) -> Result<(), UpdateError> {
        let command = frame.command();
        let bytes = frame
            .write_to(self.transport, self.checksum_type())
            .map_err(|e| UpdateError::Transport(e.to_string()))?;

        debug!(command = %command, len = bytes.len(), "Frame written");
        self.emit(DfuEvent::Packet {
            direction: PacketDirection::Tx,
            command: Some(command),
            length: bytes.len(),
            data: bytes.iter().take(PACKET_PREVIEW_LEN).copied().collect(),
        });

        self.session.pending = Some(PendingAck {
            command,
            deadline: Instant::now() + Duration::from_millis(self.config.ack_timeout_ms),
        });
        Ok(())
    }

    /// Apply a handler result to the session.
    pub(crate) fn conclude(&mut self, result: HandleResult) {
        match result {
            HandleResult::Continue => {}
            HandleResult::Complete => self.finish(),
            HandleResult::Error(e) => self.fail(e),
        }
    }

    fn finish(&mut self) {
        self.session.pending = None;
        self.goto(UpdateState::Done);
        self.log(LogLevel::Info, "Update complete");
        self.emit(DfuEvent::FlashFinished);
    }

    /// Stop the update. No further commands are sent.
    pub(crate) fn fail(&mut self, err: UpdateError) {
        error!(code = err.code(), "{}", err);
        self.session.pending = None;
        self.session.last_error = Some(err.clone());
        self.goto(UpdateState::Error);
        self.emit(DfuEvent::Error {
            code: err.code(),
            message: err.to_string(),
            error: err,
        });
    }
}

/// Kick off an update: enter the bootloader.
pub fn begin<T: DfuTransport, O: DfuObserver>(ctx: &mut HandlerContext<'_, T, O>) -> HandleResult {
    bootloader::enter(ctx)
}

/// Handle one acknowledgement frame (as hex text) in the current state.
///
/// Malformed frames leave the session untouched and are returned as errors.
pub fn handle_ack<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    match ctx.session.state {
        UpdateState::EnteringBootloader => bootloader::handle_enter(ack, ctx),
        UpdateState::ReadingFlashSize => bootloader::handle_flash_size(ack, ctx),
        UpdateState::ProgrammingRow(_) => rows::handle_row_ack(ack, ctx),
        UpdateState::VerifyingRow(_) => rows::handle_verify_row(ack, ctx),
        UpdateState::VerifyingChecksum => checksum::handle_verify_checksum(ack, ctx),
        UpdateState::ExitingBootloader | UpdateState::Done => bootloader::handle_exit(ack, ctx),
        UpdateState::Idle | UpdateState::Error => {
            warn!(ack = %ack, state = %ctx.session.state, "Unexpected acknowledgement");
            ctx.log(LogLevel::Warn, format!("Ignoring acknowledgement {}", ack));
            Ok(HandleResult::Continue)
        }
    }
}
