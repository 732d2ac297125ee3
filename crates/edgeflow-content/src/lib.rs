//! Content storage for record payloads.
//!
//! Blobs live as files in a content directory. Each one is reached through a
//! reference-counted `ContentClaim`; the blob is deleted when the final
//! handle is dropped, and failed deletions are parked for lazy retry.

pub mod claim;
pub mod store;

pub use claim::ContentClaim;
pub use store::{ContentStats, ContentStore};
