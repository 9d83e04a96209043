//! Protocol module - bootloader frame definitions.

pub mod ack;
pub mod command;
pub mod constants;

pub use ack::{
    AckError, Acknowledgement, EnterBootloaderAck, ExitAck, FlashSizeAck, RowAck,
    VerifyChecksumAck, VerifyRowAck,
};
pub use command::{Command, CommandFrame};
pub use constants::*;
