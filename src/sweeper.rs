//! The background expiry sweeper.
//!
//! On a fixed interval, every tube is visited to promote delayed jobs
//! whose delay has elapsed, return reserved jobs whose TTR has elapsed,
//! and wake any consumers a promotion can satisfy. The same sweep logic
//! also runs at the head of the reserve and peek paths, so the interval
//! only bounds how stale an idle tube can get.

use std::sync::Arc;

use tokio::select;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::broker::Broker;

/// Sweeps all tubes on the broker's configured interval until cancelled.
pub async fn run(broker: Arc<Broker>, cancel: CancellationToken) {
    let mut interval = time::interval(broker.config().sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = interval.tick() => {
                let moved = broker.sweep();
                if moved > 0 {
                    trace!(moved, "sweep re-filed jobs");
                }
            },
            _ = cancel.cancelled() => return,
        }
    }
}
