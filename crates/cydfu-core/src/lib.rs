//! cydfu-core: host side of the Cypress-style bootloader protocol.
//!
//! This crate reprograms a microcontroller from a `.cyacd` firmware image
//! over any byte-oriented link (UART, BLE bridge, ...).
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Checksum**: summation and CRC16 frame checksums, row verification sums
//! - **Protocol**: command frame encoding and acknowledgement parsing
//! - **Payload**: `.cyacd` image parsing into flash rows
//! - **Transport**: link abstraction (serialport, mock)
//! - **State**: update state machine, frame reassembly and ack handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cydfu_core::session::{DfuSession, SessionConfig};
//! use cydfu_core::transport::SerialTransport;
//!
//! let config = SessionConfig::default();
//! let transport = SerialTransport::open("/dev/ttyUSB0", config.baud_rate, Duration::from_millis(100))
//!     .expect("open port");
//! let image = std::fs::read_to_string("app.cyacd").expect("read image");
//!
//! let mut session = DfuSession::new(config, transport);
//! session.start_update(&image).expect("invalid image");
//! session.run().expect("update failed");
//! ```

pub mod checksum;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use checksum::ChecksumType;
pub use error::UpdateError;
pub use events::{DfuEvent, DfuObserver, LogLevel, NullObserver, TracingObserver};
pub use payload::{FirmwareImage, FlashRow, ImageError, ImageHeader};
pub use protocol::{AckError, Command, CommandFrame};
pub use session::{DfuSession, SessionConfig};
pub use state::UpdateState;
pub use transport::{DfuTransport, MockTransport, SerialTransport, TransportError};
