//! The shroud service: the transformation engine and the watch sessions that
//! feed it.

pub mod engine;
pub mod watch;

pub use engine::{CycleOutcome, CycleReport, SkipReason, StatusCallback, TransformHandler};
pub use watch::{Monitor, SessionInfo};
