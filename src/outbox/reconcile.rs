//! Reconciliation and scheduled maintenance.
//!
//! A single loop owns the three periodic duties:
//!
//! - requeue events stuck in `processing` (every minute);
//! - purge expired idempotency keys (hourly);
//! - the nightly edge-decay pass (03:00).
//!
//! Cron expressions are evaluated against a last-run watermark: a task
//! fires when a trigger falls between its last run and now.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::store::graph::GraphStore;
use crate::store::relational::RelationalStore;

/// Seconds between maintenance ticks.
const TICK_SECS: u64 = 60;

/// Nightly decay schedule (seconds minutes hours dom month dow).
const DECAY_CRON: &str = "0 0 3 * * *";

/// Hourly idempotency cleanup schedule.
const IDEMPOTENCY_CRON: &str = "0 10 * * * *";

/// Page size for the decay scan.
const DECAY_PAGE_SIZE: usize = 1000;

/// Periodic maintenance runner.
pub struct Reconciler {
    relational: RelationalStore,
    graph: GraphStore,
    config: OutboxConfig,
    last_decay: Option<DateTime<Utc>>,
    last_cleanup: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("last_decay", &self.last_decay)
            .field("last_cleanup", &self.last_cleanup)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Assemble a reconciler.
    pub fn new(relational: RelationalStore, graph: GraphStore, config: OutboxConfig) -> Self {
        Self {
            relational,
            graph,
            config,
            last_decay: None,
            last_cleanup: None,
        }
    }

    /// Run until `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("reconciler starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick(Utc::now()).await;
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_secs(TICK_SECS)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("reconciler stopped");
    }

    /// One maintenance tick at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        match self
            .relational
            .requeue_stuck(self.config.processing_timeout(), now)
            .await
        {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "requeued stuck outbox events"),
            Err(err) => warn!(error = %err, "stuck-event requeue failed"),
        }

        if cron_due(IDEMPOTENCY_CRON, self.last_cleanup, now) {
            self.last_cleanup = Some(now);
            match self.relational.cleanup_idempotency(now).await {
                Ok(removed) => debug!(removed, "expired idempotency keys purged"),
                Err(err) => warn!(error = %err, "idempotency cleanup failed"),
            }
        }

        if cron_due(DECAY_CRON, self.last_decay, now) {
            self.last_decay = Some(now);
            match self.graph.apply_decay(DECAY_PAGE_SIZE, now).await {
                Ok(updated) => info!(updated, "nightly edge decay complete"),
                Err(err) => warn!(error = %err, "edge decay failed"),
            }
        }
    }
}

/// A cron task is due when a trigger falls between the last run and
/// now. Never-run tasks compare against the epoch, so they fire on the
/// first tick after startup and settle onto the schedule from there.
fn cron_due(expression: &str, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    let schedule = match cron::Schedule::from_str(expression) {
        Ok(s) => s,
        Err(err) => {
            warn!(expression, error = %err, "invalid cron expression");
            return false;
        }
    };
    let after = last_run.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    schedule.after(&after).take(1).any(|next| next <= now)
}
