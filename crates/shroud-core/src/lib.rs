//! Shared building blocks for the shroud file-protection service: policy
//! values, the ciphertext token format, key storage, the audit trail and
//! configuration.

pub mod audit;
pub mod config;
pub mod keys;
pub mod paths;
pub mod policy;
pub mod token;

pub use audit::{AuditEvent, AuditLog, AuditSink, MemoryAuditSink, NullAuditSink};
pub use policy::{Direction, FsEvent, FsEventKind, Mode, Trigger, WatchPolicy, CIPHERTEXT_SUFFIX};
pub use token::{TokenError, TransformKey};
