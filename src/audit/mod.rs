//! Tamper-evident audit trail
//!
//! Each entry carries the hash of its predecessor, so editing, removing or
//! reordering any stored entry breaks verification from that point on.
//! Aggregate state can be replayed from the stream as of any timestamp.

mod log;
mod types;

pub use log::{AuditLog, AUDIT_TABLE};
pub use types::{
    AuditEntry, AuditQuery, ChainBreak, ChainBreakKind, ChainVerification, EventType, NewAuditEvent,
};
