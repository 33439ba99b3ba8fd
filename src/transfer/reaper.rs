//! Expiry reaper
//!
//! Periodically moves unclaimed transfers past their deadline to `expired`.
//! Each move is a compare-and-swap keyed on the status just read, so a
//! transfer that completes or fails concurrently is never overwritten.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::broker::{purge_packets, BrokerClient};
use super::repository::TransferRepository;
use crate::clock::Clock;
use crate::error::{Result, TransferError};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    /// Lost a race or failed to update
    pub skipped: usize,
    pub purged_packets: u64,
}

/// Expires stale transfers on an interval
#[derive(Clone)]
pub struct ExpiryReaper {
    repository: Arc<dyn TransferRepository>,
    clock: Arc<dyn Clock>,
    broker: Option<Arc<dyn BrokerClient>>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(
        repository: Arc<dyn TransferRepository>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            clock,
            broker: None,
            interval,
        }
    }

    /// Also tombstone the packets of transfers that expire
    pub fn with_purge(mut self, broker: Arc<dyn BrokerClient>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass over the expirable transfers
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let candidates = self.repository.list_expirable(now).await?;
        let mut report = SweepReport::default();

        for record in candidates {
            report.examined += 1;

            let next = match record.expire(now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::debug!(transfer_id = %record.id(), reason = %e, "Not expirable, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            match self
                .repository
                .update_state(record.id(), record.status(), next)
                .await
            {
                Ok(expired) => {
                    report.expired += 1;
                    tracing::info!(
                        transfer_id = %expired.id(),
                        previous_status = %record.status(),
                        expires_at = %expired.expires_at(),
                        "Transfer expired"
                    );

                    if let (Some(broker), Some(binding)) =
                        (self.broker.as_deref(), expired.state().binding())
                    {
                        report.purged_packets +=
                            purge_packets(broker, &expired, binding.span()).await;
                    }
                }
                Err(TransferError::StaleState { expected, actual }) => {
                    report.skipped += 1;
                    tracing::debug!(
                        transfer_id = %record.id(),
                        expected = %expected,
                        actual = %actual,
                        "Transfer changed before it could expire"
                    );
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(transfer_id = %record.id(), error = %e, "Failed to expire transfer");
                }
            }
        }

        Ok(report)
    }

    /// Run sweeps in the background until the handle is shut down
    pub fn start(self) -> ReaperHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_secs = period.as_secs(), "Expiry reaper started");

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match self.sweep().await {
                    Ok(report) if report.expired > 0 || report.skipped > 0 => {
                        tracing::info!(
                            examined = report.examined,
                            expired = report.expired,
                            skipped = report.skipped,
                            purged_packets = report.purged_packets,
                            "Expiry sweep finished"
                        );
                    }
                    Ok(_) => tracing::debug!("Expiry sweep found nothing to do"),
                    Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
                }
            }

            tracing::info!("Expiry reaper stopped");
        });

        ReaperHandle { cancel, task }
    }
}

/// Running reaper task
pub struct ReaperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop after the current sweep and wait for the task to end
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Expiry reaper task ended abnormally");
        }
    }
}
