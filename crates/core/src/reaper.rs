//! Inactivity reaper
//!
//! A periodic sweep that force-closes sessions idle beyond the configured
//! threshold and removes them from the registry. Runs as an explicit task
//! handle owned by the process lifecycle.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::config::ReaperConfig;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::cancelled;

/// Shortest sweep period `spawn` will run with
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Outcome of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions force-closed and removed
    pub reaped: Vec<String>,
    /// Sessions whose force-close failed or hung; removed regardless
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.failed.is_empty()
    }
}

/// Force-closes idle sessions
pub struct InactivityReaper {
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
}

impl InactivityReaper {
    pub fn new(registry: Arc<SessionRegistry>, config: ReaperConfig) -> Self {
        Self { registry, config }
    }

    /// Run one sweep over the registry
    pub async fn sweep(&self) -> SweepReport {
        let threshold = self.config.inactivity_timeout();
        let idle = self.registry.idle_sessions(threshold);
        if idle.is_empty() {
            return SweepReport::default();
        }

        tracing::info!(count = idle.len(), threshold_secs = threshold.as_secs(), "Reaping idle sessions");

        let results = join_all(idle.into_iter().map(|session| self.reap(session))).await;

        let mut report = SweepReport::default();
        for (id, outcome) in results.into_iter().flatten() {
            if outcome {
                report.reaped.push(id);
            } else {
                report.failed.push(id);
            }
        }
        report
    }

    /// Force-close one session; `None` if it became active again
    async fn reap(&self, session: SessionHandle) -> Option<(String, bool)> {
        let id = session.id().to_string();
        if !self.registry.is_idle(&id, self.config.inactivity_timeout()) {
            tracing::debug!(session_id = %id, "Session active again, not reaping");
            return None;
        }

        let bound = self.config.force_close_timeout();
        let ok = match tokio::time::timeout(bound, session.force_close()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(session_id = %id, "Force-close of idle session failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %id,
                    timeout_ms = bound.as_millis() as u64,
                    "Force-close of idle session timed out"
                );
                false
            }
        };

        self.registry.remove_session(&session);
        self.registry.metrics().session_reaped();
        tracing::info!(session_id = %id, clean = ok, "Idle session reaped");
        Some((id, ok))
    }

    /// Start sweeping every `interval_seconds`
    pub fn spawn(self) -> ReaperHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        // `interval_at` rejects a zero period
        let period = self.config.interval().max(MIN_SWEEP_PERIOD);

        let handle = tokio::spawn(async move {
            tracing::info!(
                "Inactivity reaper started (interval: {}s, threshold: {}s)",
                self.config.interval_seconds,
                self.config.inactivity_timeout_seconds
            );

            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled(&mut stop_rx) => {
                        tracing::info!("Inactivity reaper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if !report.is_empty() {
                            tracing::debug!(reaped = report.reaped.len(), failed = report.failed.len(), "Sweep finished");
                        }
                    }
                }
            }
        });

        ReaperHandle { stop_tx, handle }
    }
}

/// Running reaper task
pub struct ReaperHandle {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for an in-flight sweep to finish
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Inactivity reaper task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
