use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ScheduledUnit;

/// Work-signal loop: launches while eligible, then waits for an upstream
/// enqueue, a finished invocation, or the poll timeout.
pub(super) async fn run(unit: Arc<ScheduledUnit>, permits: Arc<Semaphore>, cancel: CancellationToken) {
    info!(processor = %unit.name(), "Event-driven loop started");
    let mut inflight = JoinSet::new();

    loop {
        unit.launch_ready(&permits, &mut inflight);

        tokio::select! {
            _ = unit.state.work().notified() => {}
            _ = tokio::time::sleep(unit.next_delay()) => {}
            Some(joined) = inflight.join_next() => unit.finish(joined),
            _ = cancel.cancelled() => {
                info!(processor = %unit.name(), "Event-driven loop shutting down");
                break;
            }
        }
    }

    unit.join_all(&mut inflight).await;
}
