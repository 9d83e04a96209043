//! Payload handling module.
//!
//! Parses the firmware image text into ordered flash rows.

pub mod image;
pub mod row;

pub use image::{FirmwareImage, ImageError, ImageHeader, ImageParser};
pub use row::FlashRow;
