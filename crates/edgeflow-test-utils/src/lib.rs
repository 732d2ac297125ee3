//! Test processors and fixtures shared by the edgeflow crates' integration tests.

pub mod harness;
pub mod processors;

pub use harness::{properties, wait_for, TestHarness};
pub use processors::{
    CloneToSuccess, CollectSink, CollectedRecord, FailAfterGet, GenerateRecords, PassThrough,
};
