//! Row programming handlers.
//!
//! A row whose data exceeds `max_data_size` goes out as SEND_DATA fragments
//! followed by one PROGRAM_ROW carrying the last fragment and the row
//! address. Each fragment waits for the previous acknowledgement.

use tracing::{debug, info, warn};

use super::{HandleResult, HandlerContext, checksum, status_error};
use crate::error::UpdateError;
use crate::events::{DfuEvent, DfuObserver, LogLevel};
use crate::protocol::ack::{parse_program_row, parse_send_data, parse_verify_row};
use crate::protocol::{AckError, Command, CommandFrame};
use crate::state::machine::{ChunkTracker, UpdateState};
use crate::transport::DfuTransport;

/// Emit the start notification and program the first row.
pub fn begin_programming<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    if !ctx.session.flash_started {
        ctx.session.flash_started = true;
        info!(rows = ctx.image.rows().len(), "Programming rows");
        ctx.emit(DfuEvent::FlashStart);
    }

    if ctx.image.rows().is_empty() {
        return checksum::verify(ctx);
    }
    program_row(ctx, 0)
}

/// (Re)start row `index` from its first fragment.
fn program_row<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
    index: usize,
) -> HandleResult {
    let image = ctx.image;
    let Some(row) = image.rows().get(index) else {
        return checksum::verify(ctx);
    };

    ctx.session.row_index = index;
    ctx.session.chunk = ChunkTracker::new(row.data().len(), ctx.config.fragment_size());
    ctx.goto(UpdateState::ProgrammingRow(index));
    debug!(
        row = %row.row_number(),
        fragments = ctx.session.chunk.total_chunks,
        "Programming row"
    );
    send_fragment(ctx)
}

fn send_fragment<T: DfuTransport, O: DfuObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> HandleResult {
    let image = ctx.image;
    let Some(row) = image.rows().get(ctx.session.row_index) else {
        return HandleResult::Continue;
    };
    let fragment = &row.data()[ctx.session.chunk.range()];

    let frame = if ctx.session.chunk.is_last_chunk() {
        CommandFrame::program_row(row.array_id(), row.row_bytes(), fragment)
    } else {
        CommandFrame::send_data(fragment)
    };
    HandleResult::after_send(ctx.send(frame))
}

/// SEND_DATA or PROGRAM_ROW acknowledged.
pub fn handle_row_ack<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    let committed = ctx.session.chunk.is_last_chunk();
    let command = ctx.session.pending_command().unwrap_or(if committed {
        Command::ProgramRow
    } else {
        Command::SendData
    });

    let parsed = match command {
        Command::SendData => parse_send_data(ack),
        _ => parse_program_row(ack),
    };
    if let Err(e) = parsed {
        return status_error(e, command);
    }

    if !committed {
        ctx.session.chunk.advance();
        return Ok(send_fragment(ctx));
    }

    let image = ctx.image;
    let index = ctx.session.row_index;
    let Some(row) = image.rows().get(index) else {
        return Ok(HandleResult::Continue);
    };
    ctx.goto(UpdateState::VerifyingRow(index));
    Ok(HandleResult::after_send(ctx.send(CommandFrame::verify_row(
        row.array_id(),
        row.row_bytes(),
    ))))
}

/// VERIFY_ROW acknowledged: compare checksums, retry or move on.
pub fn handle_verify_row<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    let verified = match parse_verify_row(ack) {
        Ok(verified) => verified,
        Err(e) => return status_error(e, Command::VerifyRow),
    };

    let image = ctx.image;
    let index = ctx.session.row_index;
    let Some(row) = image.rows().get(index) else {
        return Ok(HandleResult::Continue);
    };
    let expected = row.expected_device_checksum(ctx.checksum_type());

    if verified.row_checksum != expected {
        let err = UpdateError::RowChecksumMismatch {
            row: row.row_number().to_string(),
            expected,
            actual: verified.row_checksum,
        };
        if ctx.session.row_retries >= ctx.config.max_row_retries {
            return Ok(HandleResult::Error(err));
        }
        ctx.session.row_retries += 1;
        warn!(
            attempt = ctx.session.row_retries,
            max = ctx.config.max_row_retries,
            "{}, rewriting row",
            err
        );
        ctx.log(
            LogLevel::Warn,
            format!(
                "{} (retry {}/{})",
                err, ctx.session.row_retries, ctx.config.max_row_retries
            ),
        );
        return Ok(program_row(ctx, index));
    }

    ctx.session.row_retries = 0;
    ctx.session.rows_done = index + 1;
    let total_rows = image.rows().len();
    let percentage = (ctx.session.rows_done * 100 / total_rows) as u8;
    ctx.emit(DfuEvent::Progress {
        percentage,
        rows_done: ctx.session.rows_done,
        total_rows,
    });

    if index + 1 < total_rows {
        Ok(program_row(ctx, index + 1))
    } else {
        Ok(checksum::verify(ctx))
    }
}
