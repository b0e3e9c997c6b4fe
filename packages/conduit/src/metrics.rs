//! Routing counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::TickReport;

/// Lifetime counters of the router. Cheap to update from any thread.
#[derive(Debug, Default)]
pub struct RoutingMetrics {
    emitted: AtomicU64,
    delivered: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
    recirculated: AtomicU64,
    ticks: AtomicU64,
}

/// Copy of [`RoutingMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub emitted: u64,
    pub delivered: u64,
    pub expired: u64,
    pub dropped: u64,
    pub recirculated: u64,
    pub ticks: u64,
}

impl MetricsSnapshot {
    /// Units that have reached a terminal outcome.
    pub fn settled(&self) -> u64 {
        self.delivered + self.expired + self.dropped
    }
}

impl RoutingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tick(&self, report: &TickReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(report.delivered, Ordering::Relaxed);
        self.expired.fetch_add(report.expired, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped, Ordering::Relaxed);
        self.recirculated
            .fetch_add(report.recirculated, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recirculated: self.recirculated.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the counters.
    pub fn render_metrics(&self) -> String {
        let s = self.snapshot();
        format!(
            "conduit_units_total{{outcome=\"emitted\"}} {}\nconduit_units_total{{outcome=\"delivered\"}} {}\nconduit_units_total{{outcome=\"expired\"}} {}\nconduit_units_total{{outcome=\"dropped\"}} {}\nconduit_recirculations_total {}\nconduit_ticks_total {}\n",
            s.emitted, s.delivered, s.expired, s.dropped, s.recirculated, s.ticks
        )
    }
}
