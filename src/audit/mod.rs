//! Audit Trail
//!
//! Tamper-evident logging of sensitive financial operations with a
//! SHA-256 hash chain, integrity verification, severity alerts and
//! degraded-mode buffering.

pub mod alert;
pub mod canonical;
pub mod chain;
pub mod entry;
pub mod fallback;
pub mod report;
pub mod sequencer;
pub mod trail;
pub mod verify;

pub use alert::{Alert, AlertDispatcher, AlertKind, AlertSink, LogAlertSink, WebhookAlertSink};
pub use entry::{
    ActionType, Actor, AuditLogEntry, EntryContent, LogRequest, Operation, Severity, Status,
    GENESIS_HASH,
};
pub use fallback::{FallbackEntry, FallbackRecorder};
pub use report::{AuditReport, ReportStatistics};
pub use trail::{AuditTrail, LogOutcome, ReconcileReport};
pub use verify::{verify_entries, BrokenLink, SequenceRange, VerificationReport};
