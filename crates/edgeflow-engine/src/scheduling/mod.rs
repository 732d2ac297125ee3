//! Scheduling agents: drive processors' `on_trigger` on blocking worker
//! threads, one loop per scheduled processor.

mod event;
mod timer;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use edgeflow_core::config::{SchedulingConfig, SchedulingStrategy};
use edgeflow_core::event::EventBus;
use edgeflow_core::traits::Clock;
use edgeflow_core::types::FlowEvent;

use crate::context::ProcessContext;
use crate::node::{ProcessorPorts, ProcessorState};
use crate::processor::Processor;
use crate::session::SessionFactory;

/// Everything a scheduling loop needs to run one processor.
pub struct ScheduledUnit {
    processor: Arc<dyn Processor>,
    context: Arc<ProcessContext>,
    factory: SessionFactory,
    ports: Arc<ProcessorPorts>,
    state: Arc<ProcessorState>,
    scheduling: SchedulingConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl ScheduledUnit {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        processor: Arc<dyn Processor>,
        context: Arc<ProcessContext>,
        factory: SessionFactory,
        ports: Arc<ProcessorPorts>,
        state: Arc<ProcessorState>,
        scheduling: SchedulingConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            context,
            factory,
            ports,
            state,
            scheduling,
            clock,
            events,
        })
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Not yielding, a free concurrency slot, and either a source or an
    /// input whose head is not penalized.
    pub fn is_eligible(&self) -> bool {
        let now = self.clock.now_millis();
        if self.state.is_yielding(now) {
            return false;
        }
        if self.state.active() >= self.scheduling.max_concurrent_tasks {
            return false;
        }
        self.ports.incoming().is_empty() || self.ports.has_queued_work(now)
    }

    /// How long the loop should wait before its next attempt.
    fn next_delay(&self) -> Duration {
        let now = self.clock.now_millis();
        let yield_until = self.state.yield_until();
        let millis = if yield_until > now {
            yield_until - now
        } else {
            self.scheduling.period_ms
        };
        Duration::from_millis(millis.max(1))
    }

    /// Start one invocation on the worker pool if the unit is eligible and a
    /// worker is free.
    fn try_launch(self: &Arc<Self>, permits: &Arc<Semaphore>, inflight: &mut JoinSet<()>) -> bool {
        if !self.is_eligible() {
            return false;
        }
        let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
            debug!(processor = %self.name(), "Worker pool saturated");
            return false;
        };

        let guard = self.state.begin();
        let unit = Arc::clone(self);
        inflight.spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            unit.trigger_once();
        });
        true
    }

    fn launch_ready(self: &Arc<Self>, permits: &Arc<Semaphore>, inflight: &mut JoinSet<()>) {
        while self.try_launch(permits, inflight) {}
    }

    /// One trigger cycle: open a session, run the processor, commit or roll back.
    fn trigger_once(&self) {
        let mut session = self.factory.create_session();
        let outcome = self
            .processor
            .on_trigger(&self.context, &mut session)
            .and_then(|()| {
                if session.is_open() {
                    session.commit().map(Some)
                } else {
                    Ok(None)
                }
            });

        match outcome {
            Ok(Some(summary)) => {
                if summary.transferred > 0 || summary.dropped > 0 || summary.expired > 0 {
                    self.events.publish(FlowEvent::SessionCommitted {
                        processor: self.name().to_string(),
                        transferred: summary.transferred,
                        dropped: summary.dropped,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => {
                if session.is_open() {
                    if let Err(rollback_error) = session.rollback() {
                        error!(processor = %self.name(), error = %rollback_error, "Rollback failed");
                    }
                }
                warn!(processor = %self.name(), error = %e, "Trigger failed, session rolled back");
                self.events.publish(FlowEvent::SessionRolledBack {
                    processor: self.name().to_string(),
                    error: e.to_string(),
                });
                self.context.yield_processor();
            }
        }
    }

    /// Handle a finished invocation. Panics count as failures.
    fn finish(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(processor = %self.name(), error = %e, "Trigger task aborted");
            self.events.publish(FlowEvent::SessionRolledBack {
                processor: self.name().to_string(),
                error: e.to_string(),
            });
            self.context.yield_processor();
        }
    }

    async fn join_all(&self, inflight: &mut JoinSet<()>) {
        while let Some(joined) = inflight.join_next().await {
            self.finish(joined);
        }
    }
}

/// A worker pool plus the loops feeding it, for one scheduling strategy.
pub struct SchedulingAgent {
    strategy: SchedulingStrategy,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    loops: Mutex<JoinSet<()>>,
}

impl SchedulingAgent {
    pub fn new(strategy: SchedulingStrategy, threads: usize) -> Self {
        Self {
            strategy,
            permits: Arc::new(Semaphore::new(threads.max(1))),
            cancel: CancellationToken::new(),
            loops: Mutex::new(JoinSet::new()),
        }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Start driving `unit`. Must be called inside a tokio runtime.
    pub fn schedule(&self, unit: Arc<ScheduledUnit>) {
        info!(
            processor = %unit.name(),
            strategy = %self.strategy,
            period_ms = unit.scheduling.period_ms,
            max_concurrent_tasks = unit.scheduling.max_concurrent_tasks,
            "Processor scheduled"
        );
        let permits = Arc::clone(&self.permits);
        let cancel = self.cancel.clone();
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        match self.strategy {
            SchedulingStrategy::TimerDriven => {
                loops.spawn(timer::run(unit, permits, cancel));
            }
            SchedulingStrategy::EventDriven => {
                loops.spawn(event::run(unit, permits, cancel));
            }
        }
    }

    /// Cancel every loop and wait for in-flight invocations to return.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut loops = {
            let mut guard = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(strategy = %self.strategy, error = %e, "Scheduling loop failed");
            }
        }
        info!(strategy = %self.strategy, "Scheduling agent stopped");
    }
}
