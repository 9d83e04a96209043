//! Application checksum verification.

use tracing::info;

use super::{HandleResult, HandlerContext, bootloader};
use crate::error::UpdateError;
use crate::events::DfuObserver;
use crate::protocol::ack::parse_verify_checksum;
use crate::protocol::{AckError, CommandFrame};
use crate::state::machine::UpdateState;
use crate::transport::DfuTransport;

/// Ask the device to check the whole application.
pub fn verify<T: DfuTransport, O: DfuObserver>(ctx: &mut HandlerContext<'_, T, O>) -> HandleResult {
    ctx.goto(UpdateState::VerifyingChecksum);
    HandleResult::after_send(ctx.send(CommandFrame::verify_checksum()))
}

/// A failure here is final: fixing it means rewriting the image.
pub fn handle_verify_checksum<T: DfuTransport, O: DfuObserver>(
    ack: &str,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, AckError> {
    match parse_verify_checksum(ack) {
        Ok(_) => {
            info!("Application checksum verified");
            Ok(bootloader::exit(ctx))
        }
        Err(AckError::DeviceStatus) => Ok(HandleResult::Error(UpdateError::ImageChecksumMismatch)),
        Err(e) => Err(e),
    }
}
