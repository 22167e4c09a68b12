//! Periodic eviction of idle clients, stale spam records and dead transfers.
//!
//! Each pass snapshots the keys it wants to evict under the table's shard
//! locks and removes them afterwards, so notifications never fire while a
//! lock is held. A pass that panics is logged and the remaining passes still
//! run.

use crate::server::RelayRouter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle sessions evicted, with their clients.
    pub clients: usize,
    /// Spam records dropped.
    pub spam: usize,
    /// Transfers evicted.
    pub transfers: usize,
    /// Inconsistencies and failed passes.
    pub errors: usize,
}

impl SweepReport {
    /// Nothing was evicted and nothing went wrong.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn guarded(pass: &'static str, report: &mut SweepReport, f: impl FnOnce(&mut SweepReport)) {
    if catch_unwind(AssertUnwindSafe(|| f(report))).is_err() {
        tracing::error!(pass, "sweep pass panicked");
        report.errors += 1;
    }
}

impl RelayRouter {
    /// Run every sweep pass now.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) at `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        guarded("clients", &mut report, |r| self.sweep_clients(now, r));
        guarded("spam", &mut report, |r| self.sweep_spam(now, r));
        guarded("transfers", &mut report, |r| self.sweep_transfers(now, r));
        report
    }

    fn sweep_clients(&self, now: Instant, report: &mut SweepReport) {
        let timeout = self.config().client_timeout();
        let expired = self
            .sessions
            .select(|_, s| s.idle.expired_at(timeout, now));

        for entity in expired {
            let client = self.client_of(entity);
            match self.remove_session(entity) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(%entity, error = %e, "inconsistent tables during sweep");
                    report.errors += 1;
                }
            }
            report.clients += 1;
            Self::bump(&self.metrics().clients_evicted);
            match client {
                Some(client) => tracing::info!(%entity, %client, "evicted idle client"),
                None => tracing::info!(%entity, "evicted idle session"),
            }
        }
    }

    fn sweep_spam(&self, now: Instant, report: &mut SweepReport) {
        let timeout = self.config().spam_timeout();
        let expired = self.spam.select(|_, clock| clock.expired_at(timeout, now));

        for client in expired {
            if self.remove_spam(&client) {
                report.spam += 1;
                tracing::info!(%client, "spam record expired");
            }
        }

        self.clients.for_each_mut(|_, c| c.guard.prune_at(now));
    }

    fn sweep_transfers(&self, now: Instant, report: &mut SweepReport) {
        let transfer_timeout = self.config().transfer_timeout();
        let queue_timeout = self.config().queue_timeout();
        let expired = self.transfers.select(|_, t| {
            let elapsed = t.clock.elapsed_at(now);
            // A transfer that never moved a byte waits for the longer queue timeout.
            let waiting = t.queue.chunk_count() == 0 && elapsed < queue_timeout;
            elapsed >= transfer_timeout && !waiting
        });

        for entity in expired {
            if self.remove_transfer_entity(entity) {
                report.transfers += 1;
                Self::bump(&self.metrics().transfers_evicted);
                tracing::info!(%entity, "evicted stalled transfer");
            }
        }
    }
}

/// Spawn the background sweep task.
///
/// Runs [`RelayRouter::sweep`] every `period` and trims the rate limiter
/// key tables. Returns a handle that can be used to abort the task.
pub fn spawn_sweep_task(router: Arc<RelayRouter>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_secs = period.as_secs(), "sweep task started");

        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            let report = router.sweep();
            router.rate_limits().shrink();

            if report.is_empty() {
                tracing::debug!("sweep: nothing to evict");
            } else {
                tracing::info!(
                    clients = report.clients,
                    spam = report.spam,
                    transfers = report.transfers,
                    errors = report.errors,
                    "sweep complete"
                );
            }
        }
    })
}
