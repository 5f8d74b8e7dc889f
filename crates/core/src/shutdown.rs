//! Process shutdown drain
//!
//! Closes registry admission, then closes every live session concurrently:
//! gracefully within a per-session bound, falling back to force-close. The
//! whole drain is bounded by a hard ceiling.

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ShutdownConfig;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::CloseOutcome;

/// Outcome of a shutdown drain
#[derive(Debug, Default, Clone)]
pub struct DrainReport {
    /// Sessions closed gracefully
    pub graceful: Vec<String>,
    /// Sessions closed by the force-close fallback
    pub forced: Vec<String>,
    /// Sessions whose force-close failed or timed out
    pub failed: Vec<String>,
    /// Sessions still closing when the ceiling hit
    pub abandoned: Vec<String>,
    pub ceiling_exceeded: bool,
    pub elapsed: Duration,
}

impl DrainReport {
    /// Every session closed, gracefully or forced, within the ceiling
    pub fn is_clean(&self) -> bool {
        !self.ceiling_exceeded && self.failed.is_empty() && self.abandoned.is_empty()
    }

    /// Process exit status for this drain
    pub fn exit_code(&self) -> i32 {
        if self.ceiling_exceeded {
            1
        } else {
            0
        }
    }

    fn settled(&self) -> usize {
        self.graceful.len() + self.forced.len() + self.failed.len()
    }
}

/// Drains all sessions on process termination
pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, config: ShutdownConfig) -> Self {
        Self { registry, config }
    }

    pub async fn drain(&self) -> DrainReport {
        let started = Instant::now();
        self.registry.close_admission();

        let sessions = self.registry.sessions();
        tracing::info!(
            count = sessions.len(),
            ceiling_ms = self.config.hard_ceiling_ms,
            "Draining sessions"
        );

        let report = Arc::new(Mutex::new(DrainReport::default()));
        let closes = sessions
            .iter()
            .cloned()
            .map(|session| self.close_one(session, report.clone()));

        let ceiling = self.config.hard_ceiling();
        let within = tokio::time::timeout(ceiling, join_all(closes)).await.is_ok();

        let mut report = report.lock().clone();
        if !within {
            report.ceiling_exceeded = true;
            let settled: Vec<&String> = report
                .graceful
                .iter()
                .chain(&report.forced)
                .chain(&report.failed)
                .collect();
            let abandoned: Vec<SessionHandle> = sessions
                .iter()
                .filter(|s| !settled.iter().any(|id| id.as_str() == s.id()))
                .cloned()
                .collect();

            tracing::error!(
                abandoned = abandoned.len(),
                ceiling_ms = ceiling.as_millis() as u64,
                "Shutdown drain exceeded its hard ceiling"
            );

            for session in abandoned {
                report.abandoned.push(session.id().to_string());
                self.registry.remove_session(&session);
                tokio::spawn(async move {
                    let _ = session.force_close().await;
                });
            }
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            graceful = report.graceful.len(),
            forced = report.forced.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            settled = report.settled(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown drain finished"
        );
        report
    }

    async fn close_one(&self, session: SessionHandle, report: Arc<Mutex<DrainReport>>) {
        let id = session.id().to_string();
        let outcome = session
            .close_within(self.config.graceful_timeout(), self.config.force_close_timeout())
            .await;
        self.registry.remove_session(&session);

        let mut report = report.lock();
        match outcome {
            Ok(CloseOutcome::Graceful) => report.graceful.push(id),
            Ok(CloseOutcome::Forced) => report.forced.push(id),
            Err(e) => {
                tracing::warn!(session_id = %id, "Session did not close during shutdown: {}", e);
                report.failed.push(id);
            }
        }
    }
}
