//! Lineage tracking for records.
//!
//! A `ProvenanceReporter` collects events while a session runs; the session
//! hands them to the `ProvenanceLog` on commit. The log keeps them in SQLite
//! and a background reclaimer trims them by age and total size.

pub mod event;
pub mod log;
pub mod reporter;

pub use event::{EventDetail, ProvenanceEvent, ProvenanceEventType, RecordSnapshot};
pub use log::{LogStats, ProvenanceLog, RetentionPolicy};
pub use reporter::ProvenanceReporter;
