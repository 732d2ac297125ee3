use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use edgeflow_content::ContentStore;
use edgeflow_core::clock::SystemClock;
use edgeflow_core::config::{
    ConnectionConfig, EngineConfig, FlowConfig, ProcessorConfig, ProvenanceConfig,
    SchedulingConfig, SchedulingStrategy,
};
use edgeflow_core::error::{FlowError, Result};
use edgeflow_core::event::EventBus;
use edgeflow_core::traits::Clock;
use edgeflow_core::types::{ConnectionId, FlowEvent, IdGenerator, ProcessorId};
use edgeflow_provenance::{ProvenanceLog, RetentionPolicy};

use crate::connection::Connection;
use crate::context::ProcessContext;
use crate::node::{ProcessorNode, ProcessorPorts, ProcessorState};
use crate::processor::{Processor, ProcessorDescriptor};
use crate::scheduling::{ScheduledUnit, SchedulingAgent};
use crate::session::SessionFactory;

/// Shared services every part of one engine uses. Built once per engine and
/// passed down explicitly.
pub struct EngineContext {
    clock: Arc<dyn Clock>,
    ids: IdGenerator,
    content: Arc<ContentStore>,
    provenance: Arc<ProvenanceLog>,
    events: Arc<EventBus>,
}

impl EngineContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        content: Arc<ContentStore>,
        provenance: Arc<ProvenanceLog>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            ids: IdGenerator::new(),
            content,
            provenance,
            events,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn content(&self) -> &Arc<ContentStore> {
        &self.content
    }

    pub fn provenance(&self) -> &Arc<ProvenanceLog> {
        &self.provenance
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

struct PendingProcessor {
    name: String,
    processor: Arc<dyn Processor>,
    descriptor: ProcessorDescriptor,
    scheduling: SchedulingConfig,
    properties: BTreeMap<String, String>,
    auto_terminated: BTreeSet<String>,
    state: Arc<ProcessorState>,
}

struct PendingConnection {
    config: ConnectionConfig,
    source: ProcessorId,
    destination: ProcessorId,
}

/// Assembles a flow graph. Services not supplied explicitly are opened from
/// the engine and provenance configuration at `build`.
pub struct FlowEngineBuilder {
    engine_config: EngineConfig,
    provenance_config: ProvenanceConfig,
    clock: Option<Arc<dyn Clock>>,
    content: Option<Arc<ContentStore>>,
    provenance: Option<Arc<ProvenanceLog>>,
    events: Option<Arc<EventBus>>,
    processors: Vec<PendingProcessor>,
    connections: Vec<PendingConnection>,
}

impl FlowEngineBuilder {
    fn new() -> Self {
        Self {
            engine_config: EngineConfig::default(),
            provenance_config: ProvenanceConfig::default(),
            clock: None,
            content: None,
            provenance: None,
            events: None,
            processors: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    pub fn provenance_config(mut self, config: ProvenanceConfig) -> Self {
        self.provenance_config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn content_store(mut self, content: Arc<ContentStore>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn provenance_log(mut self, provenance: Arc<ProvenanceLog>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn pending(&self, id: ProcessorId) -> Result<&PendingProcessor> {
        self.processors
            .get(id.0)
            .ok_or_else(|| FlowError::UnknownProcessor(id.to_string()))
    }

    /// Register a processor. Its descriptor is read once, here.
    pub fn add_processor(
        &mut self,
        name: impl Into<String>,
        processor: Arc<dyn Processor>,
        scheduling: SchedulingConfig,
        properties: BTreeMap<String, String>,
    ) -> Result<ProcessorId> {
        let name = name.into();
        if self.processors.iter().any(|p| p.name == name) {
            return Err(FlowError::Config(format!("duplicate processor name '{}'", name)));
        }
        if scheduling.max_concurrent_tasks == 0 {
            return Err(FlowError::Config(format!(
                "processor '{}' must allow at least one concurrent task",
                name
            )));
        }

        let descriptor = processor.initialize();
        let id = ProcessorId(self.processors.len());
        debug!(processor = %name, id = %id, kind = %descriptor.type_name, "Processor added");
        self.processors.push(PendingProcessor {
            name,
            processor,
            descriptor,
            scheduling,
            properties,
            auto_terminated: BTreeSet::new(),
            state: ProcessorState::new(),
        });
        Ok(id)
    }

    /// Wire `relationship` of `source` into `destination`.
    pub fn connect(
        &mut self,
        source: ProcessorId,
        relationship: &str,
        destination: ProcessorId,
        mut config: ConnectionConfig,
    ) -> Result<ConnectionId> {
        let src = self.pending(source)?;
        if !src.descriptor.has_relationship(relationship) {
            return Err(FlowError::UnknownRelationship {
                processor: src.name.clone(),
                relationship: relationship.to_string(),
            });
        }
        let src_name = src.name.clone();
        let dst_name = self.pending(destination)?.name.clone();

        if self.connections.iter().any(|c| c.config.name == config.name) {
            return Err(FlowError::Config(format!(
                "duplicate connection name '{}'",
                config.name
            )));
        }

        config.source = src_name;
        config.destination = dst_name;
        config.relationship = relationship.to_string();

        let id = ConnectionId(self.connections.len());
        debug!(
            connection = %config.name,
            source = %config.source,
            relationship = %relationship,
            destination = %config.destination,
            "Connection added"
        );
        self.connections.push(PendingConnection {
            config,
            source,
            destination,
        });
        Ok(id)
    }

    /// Drop records routed to `relationship` instead of requiring a connection.
    pub fn auto_terminate(&mut self, processor: ProcessorId, relationship: &str) -> Result<()> {
        let pending = self
            .processors
            .get_mut(processor.0)
            .ok_or_else(|| FlowError::UnknownProcessor(processor.to_string()))?;
        if !pending.descriptor.has_relationship(relationship) {
            return Err(FlowError::UnknownRelationship {
                processor: pending.name.clone(),
                relationship: relationship.to_string(),
            });
        }
        pending.auto_terminated.insert(relationship.to_string());
        Ok(())
    }

    /// Open missing services and freeze the graph.
    pub fn build(self) -> Result<FlowEngine> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let content = match self.content {
            Some(content) => content,
            None => ContentStore::open(&self.engine_config.content_dir())?,
        };
        let provenance = match self.provenance {
            Some(provenance) => provenance,
            None => ProvenanceLog::open(
                &self.provenance_config.db_path(),
                RetentionPolicy::from(&self.provenance_config),
                Arc::clone(&clock),
            )?,
        };
        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::default()));
        let ctx = EngineContext::new(Arc::clone(&clock), content, provenance, events);

        let connections: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .enumerate()
            .map(|(index, pending)| {
                Arc::new(Connection::new(
                    ConnectionId(index),
                    &pending.config,
                    pending.source,
                    pending.destination,
                    Arc::clone(&clock),
                    self.processors[pending.destination.0].state.work_signal(),
                ))
            })
            .collect();

        let mut nodes = Vec::with_capacity(self.processors.len());
        for (index, pending) in self.processors.into_iter().enumerate() {
            let id = ProcessorId(index);
            let incoming: Vec<_> = connections
                .iter()
                .filter(|c| c.destination() == id)
                .cloned()
                .collect();
            let mut outgoing: BTreeMap<String, Vec<Arc<Connection>>> = BTreeMap::new();
            for connection in connections.iter().filter(|c| c.source() == id) {
                outgoing
                    .entry(connection.relationship().to_string())
                    .or_default()
                    .push(Arc::clone(connection));
            }

            let ports = Arc::new(ProcessorPorts {
                id,
                name: pending.name.clone(),
                type_name: pending.descriptor.type_name.clone(),
                relationships: pending
                    .descriptor
                    .relationships
                    .iter()
                    .map(|r| r.name.clone())
                    .collect(),
                incoming,
                outgoing,
                auto_terminated: pending.auto_terminated,
                penalization_ms: pending.scheduling.penalization_period_ms,
                cursor: AtomicUsize::new(0),
            });
            let context = Arc::new(ProcessContext::new(
                id,
                pending.name,
                pending.descriptor.type_name.clone(),
                pending.properties,
                pending.descriptor.properties.clone(),
                pending.scheduling.clone(),
                Arc::clone(&pending.state),
                Arc::clone(&clock),
                Arc::clone(ctx.events()),
            ));
            nodes.push(ProcessorNode {
                processor: pending.processor,
                descriptor: pending.descriptor,
                scheduling: pending.scheduling,
                state: pending.state,
                context,
                ports,
            });
        }

        info!(
            processors = nodes.len(),
            connections = connections.len(),
            "Flow graph built"
        );
        Ok(FlowEngine {
            timer: SchedulingAgent::new(
                SchedulingStrategy::TimerDriven,
                self.engine_config.timer_driven_threads,
            ),
            event: SchedulingAgent::new(
                SchedulingStrategy::EventDriven,
                self.engine_config.event_driven_threads,
            ),
            config: self.engine_config,
            ctx,
            nodes,
            connections,
            scheduled: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            cleanup: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

/// Composition root: owns the graph, the scheduling agents and the
/// background tasks. An engine runs once; `start` after `stop` is an error.
pub struct FlowEngine {
    config: EngineConfig,
    ctx: Arc<EngineContext>,
    nodes: Vec<ProcessorNode>,
    connections: Vec<Arc<Connection>>,
    timer: SchedulingAgent,
    event: SchedulingAgent,
    scheduled: Mutex<Vec<ProcessorId>>,
    cancel: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }

    /// Build an engine from a flow file. `resolver` maps each processor entry
    /// to an implementation.
    pub fn from_config<F>(config: &FlowConfig, resolver: F) -> Result<Self>
    where
        F: Fn(&ProcessorConfig) -> Result<Arc<dyn Processor>>,
    {
        Self::builder_from_config(config, resolver, Self::builder())?.build()
    }

    /// Like `from_config`, but on top of a builder that may already carry
    /// services (clock, stores, bus).
    pub fn builder_from_config<F>(
        config: &FlowConfig,
        resolver: F,
        builder: FlowEngineBuilder,
    ) -> Result<FlowEngineBuilder>
    where
        F: Fn(&ProcessorConfig) -> Result<Arc<dyn Processor>>,
    {
        config.validate()?;
        let mut builder = builder
            .engine_config(config.engine.clone())
            .provenance_config(config.provenance.clone());

        let mut ids = BTreeMap::new();
        for entry in &config.processors {
            let processor = resolver(entry)?;
            let id = builder.add_processor(
                entry.name.clone(),
                processor,
                entry.scheduling.clone(),
                entry.properties.clone(),
            )?;
            for relationship in &entry.auto_terminate {
                builder.auto_terminate(id, relationship)?;
            }
            ids.insert(entry.name.as_str(), id);
        }

        for connection in &config.connections {
            let lookup = |name: &str| {
                ids.get(name)
                    .copied()
                    .ok_or_else(|| FlowError::UnknownProcessor(name.to_string()))
            };
            let source = lookup(&connection.source)?;
            let destination = lookup(&connection.destination)?;
            builder.connect(source, &connection.relationship, destination, connection.clone())?;
        }
        Ok(builder)
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.ctx.events()
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        self.ctx.content()
    }

    pub fn provenance(&self) -> &Arc<ProvenanceLog> {
        self.ctx.provenance()
    }

    pub fn processor_id(&self, name: &str) -> Option<ProcessorId> {
        self.nodes.iter().position(|n| n.ports.name == name).map(ProcessorId)
    }

    pub fn descriptor(&self, id: ProcessorId) -> Option<&ProcessorDescriptor> {
        self.nodes.get(id.0).map(|n| &n.descriptor)
    }

    pub fn processor_context(&self, id: ProcessorId) -> Option<&Arc<ProcessContext>> {
        self.nodes.get(id.0).map(|n| &n.context)
    }

    pub fn processor_state(&self, id: ProcessorId) -> Option<&Arc<ProcessorState>> {
        self.nodes.get(id.0).map(|n| &n.state)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.connections.get(id.0)
    }

    pub fn connection_by_name(&self, name: &str) -> Option<&Arc<Connection>> {
        self.connections.iter().find(|c| c.name() == name)
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Session factory for driving a processor by hand.
    pub fn session_factory(&self, id: ProcessorId) -> Option<SessionFactory> {
        self.nodes
            .get(id.0)
            .map(|n| SessionFactory::new(Arc::clone(&self.ctx), Arc::clone(&n.ports)))
    }

    pub fn is_scheduled(&self, id: ProcessorId) -> bool {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// Start background tasks and schedule every processor whose
    /// configuration is valid. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(FlowError::Engine("engine already started".to_string()));
        }

        self.ctx.provenance().start_reclaimer();
        self.start_content_cleanup();

        let mut scheduled = Vec::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let id = ProcessorId(index);
            let factory = SessionFactory::new(Arc::clone(&self.ctx), Arc::clone(&node.ports));

            let ready = node
                .context
                .validate()
                .and_then(|()| node.processor.on_schedule(&node.context, &factory));
            if let Err(e) = ready {
                error!(processor = %node.ports.name, error = %e, "Processor not scheduled");
                self.ctx.events().publish(FlowEvent::ProcessorScheduleFailed {
                    processor: node.ports.name.clone(),
                    error: e.to_string(),
                });
                continue;
            }

            let unit = ScheduledUnit::new(
                Arc::clone(&node.processor),
                Arc::clone(&node.context),
                factory,
                Arc::clone(&node.ports),
                Arc::clone(&node.state),
                node.scheduling.clone(),
                Arc::clone(self.ctx.clock()),
                Arc::clone(self.ctx.events()),
            );
            let agent = match node.scheduling.strategy {
                SchedulingStrategy::TimerDriven => &self.timer,
                SchedulingStrategy::EventDriven => &self.event,
            };
            agent.schedule(unit);
            self.ctx.events().publish(FlowEvent::ProcessorScheduled {
                processor: node.ports.name.clone(),
                strategy: node.scheduling.strategy.to_string(),
            });
            scheduled.push(id);
        }

        info!(
            scheduled = scheduled.len(),
            processors = self.nodes.len(),
            connections = self.connections.len(),
            "Flow engine started"
        );
        *self.scheduled.lock().unwrap_or_else(PoisonError::into_inner) = scheduled;
        self.ctx.events().publish(FlowEvent::EngineStarted {
            processors: self.nodes.len(),
            connections: self.connections.len(),
        });
        Ok(())
    }

    fn start_content_cleanup(&self) {
        let content = Arc::clone(self.ctx.content());
        let cancel = self.cancel.clone();
        let interval = self.config.content_cleanup_interval();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                let removed = content.retry_pending_deletions();
                if removed > 0 {
                    debug!(removed, "Deferred content cleanup pass");
                }
            }
        });
        *self.cleanup.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop scheduling, wait for in-flight invocations, tell processors to
    /// clean up, and stop the background tasks.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        self.timer.stop().await;
        self.event.stop().await;

        let scheduled = std::mem::take(
            &mut *self.scheduled.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for id in scheduled {
            if let Some(node) = self.nodes.get(id.0) {
                node.processor.notify_stop();
            }
        }

        self.cancel.cancel();
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = cleanup {
            if let Err(e) = handle.await {
                warn!(error = %e, "Content cleanup task failed");
            }
        }
        self.ctx.content().retry_pending_deletions();
        self.ctx.provenance().shutdown().await;

        info!("Flow engine stopped");
        self.ctx.events().publish(FlowEvent::EngineStopped);
    }

    /// Empty every connection without provenance. Returns the records dropped.
    pub fn drain(&self) -> usize {
        let drained: usize = self.connections.iter().map(|c| c.drain()).sum();
        info!(drained, "Connections drained");
        drained
    }
}
