//! Periodic cleanup
//!
//! Each pass asks every resource actor to evict stale presence and orphan
//! cursors and to expire overdue leases, then reaps actors left with no
//! state. Actors evaluate staleness against the clock when the sweep
//! command reaches them, so an entry refreshed just before the pass stays.
//! Subscriptions are never swept.

use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MAX_DURATION;
use crate::resource::{ResourceCommand, ResourceTable};

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Totals for one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub resources: usize,
    pub stale_presence: usize,
    pub stale_cursors: usize,
    pub expired_leases: usize,
    pub reaped: usize,
}

pub(crate) async fn sweep_once(resources: &ResourceTable) -> SweepReport {
    let outcomes = resources
        .broadcast(|reply| ResourceCommand::Sweep { reply })
        .await;

    let mut report = SweepReport {
        resources: outcomes.len(),
        ..SweepReport::default()
    };
    let mut idle = Vec::new();

    for (key, outcome) in outcomes {
        report.stale_presence += outcome.stale_presence;
        report.stale_cursors += outcome.stale_cursors;
        if outcome.expired_lease {
            report.expired_leases += 1;
        }
        if outcome.idle {
            idle.push(key);
        }
    }

    report.reaped = resources.reap(&idle).await;
    report
}

pub(crate) fn spawn(
    resources: ResourceTable,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(resources, period, shutdown))
}

async fn run(resources: ResourceTable, period: Duration, shutdown: CancellationToken) {
    let period = period.clamp(MIN_PERIOD, MAX_DURATION);
    tracing::info!(interval_secs = period.as_secs(), "Sweeper started");

    // First pass one full period after start
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep_once(&resources).await;
                if report.stale_presence + report.stale_cursors + report.expired_leases + report.reaped > 0 {
                    tracing::info!(
                        resources = report.resources,
                        stale_presence = report.stale_presence,
                        stale_cursors = report.stale_cursors,
                        expired_leases = report.expired_leases,
                        reaped = report.reaped,
                        "Sweep completed"
                    );
                } else {
                    tracing::debug!(resources = report.resources, "Sweep found nothing to evict");
                }
            }
        }
    }

    tracing::info!("Sweeper stopped");
}
