//! The flow engine: records, connections, sessions, processors and the
//! scheduling agents that drive them.

pub mod connection;
pub mod context;
pub mod engine;
pub mod node;
pub mod processor;
pub mod record;
pub mod scheduling;
pub mod session;

pub use connection::Connection;
pub use context::ProcessContext;
pub use engine::{EngineContext, FlowEngine, FlowEngineBuilder};
pub use node::{ProcessorPorts, ProcessorState};
pub use processor::{Processor, ProcessorDescriptor, PropertyDescriptor};
pub use record::Record;
pub use scheduling::{ScheduledUnit, SchedulingAgent};
pub use session::{CommitSummary, ProcessSession, SessionFactory, SessionState};
