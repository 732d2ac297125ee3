use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::types::{RecordId, Relationship};
use edgeflow_engine::{
    ProcessContext, ProcessSession, Processor, ProcessorDescriptor, PropertyDescriptor,
};

/// Source that creates `Batch Size` records per trigger, each holding
/// `Content`, until `Max Records` (0 = no limit) have been made.
#[derive(Default)]
pub struct GenerateRecords {
    generated: AtomicUsize,
}

impl GenerateRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl Processor for GenerateRecords {
    fn initialize(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new("GenerateRecords")
            .property(PropertyDescriptor::new("Batch Size", "Records per trigger").with_default("1"))
            .property(PropertyDescriptor::new("Content", "Payload of each record").with_default(""))
            .property(
                PropertyDescriptor::new("Max Records", "Stop after this many (0 = never)")
                    .with_default("0"),
            )
            .relationship(Relationship::success())
    }

    fn on_trigger(&self, ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()> {
        let batch = ctx.parse_property::<usize>("Batch Size")?.unwrap_or(1);
        let max = ctx.parse_property::<usize>("Max Records")?.unwrap_or(0);
        let content = ctx.property("Content").unwrap_or_default();

        for _ in 0..batch {
            let index = self.generated.load(Ordering::SeqCst);
            if max > 0 && index >= max {
                ctx.yield_processor();
                break;
            }
            let mut record = session.create()?;
            if !content.is_empty() {
                session.write(&mut record, |out| {
                    out.write_all(content.as_bytes())?;
                    Ok(())
                })?;
            }
            session.put_attribute(&mut record, "generate.index", index.to_string())?;
            session.transfer(record, &Relationship::success())?;
            self.generated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Moves each record to `success` untouched.
#[derive(Default)]
pub struct PassThrough;

impl Processor for PassThrough {
    fn initialize(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new("PassThrough")
            .property(PropertyDescriptor::new("Batch Size", "Records per trigger").with_default("1"))
            .relationship(Relationship::success())
    }

    fn on_trigger(&self, ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()> {
        let batch = ctx.parse_property::<usize>("Batch Size")?.unwrap_or(1);
        for record in session.get_batch(batch)? {
            session.transfer(record, &Relationship::success())?;
        }
        Ok(())
    }
}

/// Takes a record, creates and routes a new one with content, then fails.
#[derive(Default)]
pub struct FailAfterGet {
    taken: Mutex<Vec<RecordId>>,
    written: Mutex<Vec<PathBuf>>,
}

impl FailAfterGet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records obtained from the input before failing.
    pub fn taken(&self) -> Vec<RecordId> {
        self.taken.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Content paths of the records created before failing.
    pub fn written(&self) -> Vec<PathBuf> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

impl Processor for FailAfterGet {
    fn initialize(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new("FailAfterGet").relationship(Relationship::success())
    }

    fn on_trigger(&self, ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()> {
        let Some(input) = session.get()? else {
            return Ok(());
        };
        if let Ok(mut taken) = self.taken.lock() {
            taken.push(input.id());
        }

        let mut created = session.create()?;
        session.write(&mut created, |out| {
            out.write_all(b"partial output")?;
            Ok(())
        })?;
        if let (Some(claim), Ok(mut written)) = (created.claim(), self.written.lock()) {
            written.push(claim.path().to_path_buf());
        }
        session.transfer(created, &Relationship::success())?;

        Err(FlowError::processor(ctx.name(), "downstream service unavailable"))
    }
}

/// Clones each input and routes both the input and its clone to `success`.
#[derive(Default)]
pub struct CloneToSuccess;

impl Processor for CloneToSuccess {
    fn initialize(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new("CloneToSuccess").relationship(Relationship::success())
    }

    fn on_trigger(&self, _ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()> {
        let Some(original) = session.get()? else {
            return Ok(());
        };
        let clone = session.clone_record(&original)?;
        session.transfer(original, &Relationship::success())?;
        session.transfer(clone, &Relationship::success())?;
        Ok(())
    }
}

/// What `CollectSink` saw of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedRecord {
    pub id: RecordId,
    pub attributes: BTreeMap<String, String>,
    pub content: Vec<u8>,
}

/// Terminal processor that reads and removes everything it receives.
#[derive(Default)]
pub struct CollectSink {
    collected: Mutex<Vec<CollectedRecord>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collected(&self) -> Vec<CollectedRecord> {
        self.collected.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.collected.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Processor for CollectSink {
    fn initialize(&self) -> ProcessorDescriptor {
        ProcessorDescriptor::new("CollectSink")
            .property(PropertyDescriptor::new("Batch Size", "Records per trigger").with_default("10"))
    }

    fn on_trigger(&self, ctx: &ProcessContext, session: &mut ProcessSession) -> Result<()> {
        let batch = ctx.parse_property::<usize>("Batch Size")?.unwrap_or(10);
        for record in session.get_batch(batch)? {
            let content = session.read(&record, |input| {
                let mut bytes = Vec::new();
                input.read_to_end(&mut bytes)?;
                Ok(bytes)
            })?;
            let entry = CollectedRecord {
                id: record.id(),
                attributes: record.attributes().clone(),
                content,
            };
            session.remove(record)?;
            if let Ok(mut collected) = self.collected.lock() {
                collected.push(entry);
            }
        }
        Ok(())
    }
}
