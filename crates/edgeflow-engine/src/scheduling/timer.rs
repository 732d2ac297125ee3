use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ScheduledUnit;

/// Fixed-period loop: each tick launches as many invocations as the unit's
/// free concurrency allows, then sleeps for the period (or the rest of a
/// yield).
pub(super) async fn run(unit: Arc<ScheduledUnit>, permits: Arc<Semaphore>, cancel: CancellationToken) {
    info!(processor = %unit.name(), period_ms = unit.scheduling.period_ms, "Timer-driven loop started");
    let mut inflight = JoinSet::new();
    let mut next = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {
                unit.launch_ready(&permits, &mut inflight);
                next = Instant::now() + unit.next_delay();
            }
            Some(joined) = inflight.join_next() => unit.finish(joined),
            _ = cancel.cancelled() => {
                info!(processor = %unit.name(), "Timer-driven loop shutting down");
                break;
            }
        }
    }

    unit.join_all(&mut inflight).await;
}
