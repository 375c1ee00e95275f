//! Lock-free statistics collector

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use once_cell::sync::Lazy;
use serde::Serialize;

/// Point-in-time view of a collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsSnapshot {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Connections accepted since creation
    pub total_connections: u64,
    /// Connections currently being served
    pub active_connections: u64,
    /// Bytes read from clients
    pub bytes_received: u64,
    /// Bytes written back to clients
    pub bytes_sent: u64,
    /// HTTP requests served
    pub requests: u64,
    /// Per-connection failures
    pub errors: u64,
    /// Mean connection latency in nanoseconds
    pub avg_latency_ns: u64,
    /// Largest connection latency in nanoseconds
    pub max_latency_ns: u64,
    /// Smallest connection latency in nanoseconds, 0 before the first sample
    pub min_latency_ns: u64,
}

/// Statistics of one proxy
#[derive(Debug)]
pub struct StatsCollector {
    instance: String,
    enabled: AtomicBool,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    latency_sum: AtomicU64,
    latency_count: AtomicU64,
    latency_max: AtomicU64,
    latency_min: AtomicU64,
}

static DEFAULT: Lazy<Arc<StatsCollector>> = Lazy::new(|| Arc::new(StatsCollector::new("default")));

/// Shared collector for call sites that were not handed one
pub fn default_collector() -> Arc<StatsCollector> {
    Arc::clone(&DEFAULT)
}

impl StatsCollector {
    /// New collector labelled with `instance`
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            enabled: AtomicBool::new(true),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_sum: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_max: AtomicU64::new(0),
            latency_min: AtomicU64::new(u64::MAX),
        }
    }

    /// Instance label
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Resume counting
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Stop counting; existing values are kept
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Whether updates are recorded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// A connection was accepted
    ///
    /// Returns whether it was counted; only counted connections may be
    /// reported closed.
    pub fn connection_opened(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("tlcpchan_connections_total", "instance" => self.instance.clone()).increment(1);
        gauge!("tlcpchan_connections_active", "instance" => self.instance.clone()).set(active as f64);
        true
    }

    /// A counted connection finished
    ///
    /// Applied even while disabled, so connections opened before a disable
    /// still leave the active count.
    pub fn connection_closed(&self) {
        let previous = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        gauge!("tlcpchan_connections_active", "instance" => self.instance.clone())
            .set(previous.saturating_sub(1) as f64);
    }

    /// Bytes read from the client side
    pub fn add_bytes_received(&self, n: u64) {
        if !self.is_enabled() || n == 0 {
            return;
        }
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        counter!("tlcpchan_bytes_received_total", "instance" => self.instance.clone()).increment(n);
    }

    /// Bytes written to the client side
    pub fn add_bytes_sent(&self, n: u64) {
        if !self.is_enabled() || n == 0 {
            return;
        }
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        counter!("tlcpchan_bytes_sent_total", "instance" => self.instance.clone()).increment(n);
    }

    /// An HTTP request was served
    pub fn increment_requests(&self) {
        if !self.is_enabled() {
            return;
        }
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter!("tlcpchan_requests_total", "instance" => self.instance.clone()).increment(1);
    }

    /// A connection or request failed
    pub fn increment_errors(&self) {
        if !self.is_enabled() {
            return;
        }
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("tlcpchan_errors_total", "instance" => self.instance.clone()).increment(1);
    }

    /// Record a connection's round-trip latency
    pub fn record_latency(&self, latency: Duration) {
        if !self.is_enabled() {
            return;
        }
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_sum.fetch_add(ns, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_max.fetch_max(ns, Ordering::Relaxed);
        self.latency_min.fetch_min(ns, Ordering::Relaxed);
        histogram!("tlcpchan_connection_latency_seconds", "instance" => self.instance.clone())
            .record(latency.as_secs_f64());
    }

    /// Current values
    pub fn snapshot(&self) -> StatsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let avg_latency_ns = if count > 0 {
            self.latency_sum.load(Ordering::Relaxed) / count
        } else {
            0
        };
        let min = self.latency_min.load(Ordering::Relaxed);

        StatsSnapshot {
            timestamp: Utc::now(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_ns,
            max_latency_ns: self.latency_max.load(Ordering::Relaxed),
            min_latency_ns: if min == u64::MAX { 0 } else { min },
        }
    }

    /// Zero every counter except the active connection count
    pub fn reset(&self) {
        for counter in [
            &self.total_connections,
            &self.bytes_received,
            &self.bytes_sent,
            &self.requests,
            &self.errors,
            &self.latency_sum,
            &self.latency_count,
            &self.latency_max,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.latency_min.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Keeps a connection counted as active until dropped
#[derive(Debug)]
pub(crate) struct ConnectionGuard {
    stats: Arc<StatsCollector>,
    counted: bool,
}

impl ConnectionGuard {
    pub(crate) fn new(stats: Arc<StatsCollector>) -> Self {
        let counted = stats.connection_opened();
        Self { stats, counted }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counted {
            self.stats.connection_closed();
        }
    }
}
