//! Bootloader session handlers (enter, flash size, exit).

use tracing::{debug, info};

use super::{HandleResult, HandlerContext, rows, status_error};
use crate::error::UpdateError;
use crate::events::{DfuObserver, LogLevel};
use crate::protocol::ack::{parse_enter_bootloader, parse_exit, parse_flash_size};
use crate::protocol::{AckError, Command, CommandFrame};
use crate::state::machine::UpdateState;
use crate::transport::DfuTransport;

/// Send enter-bootloader.
pub fn enter<T: DfuTransport, O: DfuObserver>(ctx: &mut HandlerContext<'_, T, O>) -> HandleResult {
    ctx.goto(UpdateState::EnteringBootloader);
    ctx.log(LogLevel::Info, "Entering bootloader");
    HandleResult::after_send(ctx.send(CommandFrame::enter_bootloader()))
}

/// Enter-bootloader acknowledged: check the silicon, then query flash bounds.
pub fn handle_enter<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    let device = match parse_enter_bootloader(ack) {
        Ok(device) => device,
        Err(e) => return status_error(e, Command::EnterBootloader),
    };

    let expected_id = ctx.image.silicon_id().unwrap_or_default();
    let expected_rev = ctx.image.silicon_rev().unwrap_or_default();
    info!(
        silicon_id = %device.silicon_id,
        silicon_rev = %device.silicon_rev,
        "Bootloader entered"
    );

    if !device.silicon_id.eq_ignore_ascii_case(expected_id)
        || !device.silicon_rev.eq_ignore_ascii_case(expected_rev)
    {
        return Ok(HandleResult::Error(UpdateError::DeviceMismatch {
            expected_id: expected_id.to_string(),
            expected_rev: expected_rev.to_string(),
            actual_id: device.silicon_id,
            actual_rev: device.silicon_rev,
        }));
    }

    ctx.session.arrays = ctx.image.array_ids();
    ctx.session.array_index = 0;

    if ctx.session.arrays.is_empty() {
        ctx.log(LogLevel::Info, "Image has no rows");
        return Ok(rows::begin_programming(ctx));
    }

    ctx.goto(UpdateState::ReadingFlashSize);
    Ok(request_flash_size(ctx))
}

fn request_flash_size<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let array_id = ctx.session.arrays[ctx.session.array_index];
    debug!(array_id, "Requesting flash size");
    HandleResult::after_send(ctx.send(CommandFrame::get_flash_size(array_id)))
}

/// Flash size acknowledged: validate this array's rows against the bounds.
pub fn handle_flash_size<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    let bounds = match parse_flash_size(ack) {
        Ok(bounds) => bounds,
        Err(e) => return status_error(e, Command::GetFlashSize),
    };

    let Some(&array_id) = ctx.session.arrays.get(ctx.session.array_index) else {
        return Ok(HandleResult::Continue);
    };
    info!(
        array_id,
        start_row = bounds.start_row,
        end_row = bounds.end_row,
        "Flash bounds"
    );

    let outside = ctx.image.rows().iter().find(|row| {
        let address = row.row_address() as u32;
        row.array_id() == array_id && (address < bounds.start_row || address > bounds.end_row)
    });
    if let Some(row) = outside {
        return Ok(HandleResult::Error(UpdateError::RowOutOfRange {
            array_id,
            row: row.row_number().to_string(),
            start: bounds.start_row,
            end: bounds.end_row,
        }));
    }

    ctx.session.array_index += 1;

    if ctx.session.array_index < ctx.session.arrays.len() {
        return Ok(request_flash_size(ctx));
    }
    Ok(rows::begin_programming(ctx))
}

/// Send exit-bootloader. Its write completing ends the update.
pub fn exit<T: DfuTransport, O: DfuObserver>(ctx: &mut HandlerContext<'_, T, O>) -> HandleResult {
    ctx.goto(UpdateState::ExitingBootloader);
    ctx.log(LogLevel::Info, "Exiting bootloader");
    match ctx.send(CommandFrame::exit_bootloader()) {
        Ok(()) => HandleResult::Complete,
        Err(e) => HandleResult::Error(e),
    }
}

/// The device may answer exit-bootloader before it resets; just log it.
pub fn handle_exit<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    let residual = parse_exit(ack)?;
    debug!(residual = %residual.to_hex(), "Exit acknowledgement");
    ctx.log(
        LogLevel::Debug,
        format!("Exit acknowledgement: {}", residual.to_hex()),
    );
    Ok(HandleResult::Continue)
}
