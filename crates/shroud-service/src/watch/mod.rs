//! Filesystem notification plumbing around the engine.

pub mod monitor;
pub mod watcher;

pub use monitor::{Monitor, SessionInfo};
pub use watcher::{translate_event, FsWatcher};
