//! Process-wide session counters
//!
//! Served by the gateway at `GET /api/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Session metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Sessions registered since startup
    sessions_created: AtomicU64,

    /// Sessions whose channel was torn down
    sessions_closed: AtomicU64,

    /// Teardowns that went through force-close
    force_closes: AtomicU64,

    /// Sessions reaped for inactivity
    sessions_reaped: AtomicU64,

    /// Audio chunks handed to the outbound queue
    audio_chunks_forwarded: AtomicU64,

    /// Audio chunks shed under the drop-newest policy
    audio_chunks_dropped: AtomicU64,

    /// Error events emitted to callers
    errors_emitted: AtomicU64,

    /// Tool invocations completed (either outcome)
    tool_invocations: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, forced: bool) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.force_closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn session_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_forwarded(&self) {
        self.audio_chunks_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_dropped(&self) {
        self.audio_chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_emitted(&self) {
        self.errors_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tool_invoked(&self) {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let created = self.sessions_created.load(Ordering::Relaxed);
        let closed = self.sessions_closed.load(Ordering::Relaxed);

        MetricsSnapshot {
            sessions_created: created,
            sessions_closed: closed,
            active_sessions: created.saturating_sub(closed),
            force_closes: self.force_closes.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            audio_chunks_forwarded: self.audio_chunks_forwarded.load(Ordering::Relaxed),
            audio_chunks_dropped: self.audio_chunks_dropped.load(Ordering::Relaxed),
            errors_emitted: self.errors_emitted.load(Ordering::Relaxed),
            tool_invocations: self.tool_invocations.load(Ordering::Relaxed),
            uptime_secs: now.saturating_sub(self.startup_time.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub active_sessions: u64,
    pub force_closes: u64,
    pub sessions_reaped: u64,
    pub audio_chunks_forwarded: u64,
    pub audio_chunks_dropped: u64,
    pub errors_emitted: u64,
    pub tool_invocations: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of audio chunks shed under backpressure
    pub fn audio_drop_rate(&self) -> f64 {
        let total = self.audio_chunks_forwarded + self.audio_chunks_dropped;
        if total == 0 {
            0.0
        } else {
            self.audio_chunks_dropped as f64 / total as f64
        }
    }
}

static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tracking() {
        let metrics = Metrics::new();

        metrics.session_created();
        metrics.session_created();
        metrics.session_closed(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_created, 2);
        assert_eq!(snapshot.sessions_closed, 1);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.force_closes, 1);
    }

    #[test]
    fn test_audio_drop_rate() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().audio_drop_rate(), 0.0);

        for _ in 0..3 {
            metrics.audio_forwarded();
        }
        metrics.audio_dropped();
        assert!((metrics.snapshot().audio_drop_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_global_metrics() {
        let m1 = global_metrics();
        let m2 = global_metrics();
        assert!(Arc::ptr_eq(&m1, &m2));
    }
}
