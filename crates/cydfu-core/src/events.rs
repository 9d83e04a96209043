//! Event system for UI decoupling.
//!
//! The session reports everything through a `DfuObserver`, so a CLI, a GUI
//! or a test can follow an update without being wired into the protocol.

use std::fmt;

use crate::error::UpdateError;
use crate::protocol::Command;
use crate::state::UpdateState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Frame direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by an update session.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// State machine transition.
    StateChanged { from: UpdateState, to: UpdateState },
    /// Row programming is about to begin. Sent once per update.
    FlashStart,
    /// A row was programmed and verified.
    Progress {
        percentage: u8,
        rows_done: usize,
        total_rows: usize,
    },
    /// The update completed. Sent once per update.
    FlashFinished,
    /// The update stopped on a fatal condition.
    Error {
        error: UpdateError,
        code: &'static str,
        message: String,
    },
    /// Frame written or received. `data` holds at most the leading bytes.
    Packet {
        direction: PacketDirection,
        command: Option<Command>,
        length: usize,
        data: Vec<u8>,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            DfuEvent::FlashStart => {
                tracing::info!("Flashing started");
            }
            DfuEvent::Progress {
                percentage,
                rows_done,
                total_rows,
            } => {
                tracing::info!(
                    progress = %format!("{}%", percentage),
                    rows = %format!("{}/{}", rows_done, total_rows),
                    "Progress"
                );
            }
            DfuEvent::FlashFinished => {
                tracing::info!("Flashing finished");
            }
            DfuEvent::Error { code, message, .. } => {
                tracing::error!(code = code, "Error: {}", message);
            }
            DfuEvent::Packet {
                direction,
                command,
                length,
                data,
            } => {
                let command = command.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
                tracing::trace!(
                    dir = %direction,
                    command = %command,
                    len = length,
                    head = %hex::encode_upper(data),
                    "Frame"
                );
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
