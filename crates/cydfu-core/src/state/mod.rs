//! State machine module.

pub mod accumulator;
pub mod handlers;
pub mod machine;

pub use accumulator::FrameAccumulator;
pub use handlers::{HandleResult, HandlerContext, begin, handle_ack};
pub use machine::{ChunkTracker, PendingAck, SessionState, UpdateState};
