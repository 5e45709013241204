//! Host metrics for observability
//!
//! Counters for sessions, tabs, polls and messages, plus a serializable
//! snapshot served at `/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Host-wide metrics
#[derive(Debug, Default)]
pub struct HostMetrics {
    // Session metrics
    /// Sessions minted since start
    pub sessions_created: AtomicU64,

    // Tab metrics
    /// Tabs currently registered
    pub active_tabs: AtomicU64,
    /// Tabs created since start
    pub tabs_created: AtomicU64,
    /// Tabs closed by expiry or by the client
    pub tabs_closed: AtomicU64,

    // Poll metrics
    /// Long-poll requests accepted
    pub polls_started: AtomicU64,
    /// Second concurrent polls answered with a clash event
    pub poll_clashes: AtomicU64,

    // Message metrics
    /// Client messages delivered to apps
    pub messages_received: AtomicU64,
    /// Events queued for clients
    pub events_sent: AtomicU64,

    // Error metrics
    /// Requests rejected as malformed
    pub bad_requests: AtomicU64,

    /// Start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    // Tab tracking
    pub fn tab_created(&self) {
        self.active_tabs.fetch_add(1, Ordering::Relaxed);
        self.tabs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tab_closed(&self) {
        self.active_tabs.fetch_sub(1, Ordering::Relaxed);
        self.tabs_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_started(&self) {
        self.polls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn poll_clash(&self) {
        self.poll_clashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                created: self.sessions_created.load(Ordering::Relaxed),
            },
            tabs: TabMetrics {
                active: self.active_tabs.load(Ordering::Relaxed),
                created: self.tabs_created.load(Ordering::Relaxed),
                closed: self.tabs_closed.load(Ordering::Relaxed),
            },
            polls: PollMetrics {
                started: self.polls_started.load(Ordering::Relaxed),
                clashes: self.poll_clashes.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.events_sent.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                bad_requests: self.bad_requests.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub tabs: TabMetrics,
    pub polls: PollMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabMetrics {
    pub active: u64,
    pub created: u64,
    pub closed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollMetrics {
    pub started: u64,
    pub clashes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub bad_requests: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub apps: Vec<String>,
    pub sessions: usize,
    pub active_tabs: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_tracking() {
        let metrics = HostMetrics::new();

        metrics.tab_created();
        metrics.tab_created();
        assert_eq!(metrics.active_tabs.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.tabs_created.load(Ordering::Relaxed), 2);

        metrics.tab_closed();
        assert_eq!(metrics.active_tabs.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.tabs_closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = HostMetrics::new();
        metrics.session_created();
        metrics.tab_created();
        metrics.poll_started();
        metrics.poll_clash();
        metrics.message_received();
        metrics.event_sent();
        metrics.event_sent();
        metrics.bad_request();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.created, 1);
        assert_eq!(snapshot.tabs.active, 1);
        assert_eq!(snapshot.polls.started, 1);
        assert_eq!(snapshot.polls.clashes, 1);
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.sent, 2);
        assert_eq!(snapshot.errors.bad_requests, 1);
    }
}
