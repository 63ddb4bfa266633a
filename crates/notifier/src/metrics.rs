// Process-local delivery counters.
//
// The happy path for an online user never touches the database, so these
// counters are the only record of delivered-while-online notifications.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc, OnceLock,
};

static GLOBAL_METRICS: OnceLock<Arc<NotifierMetrics>> = OnceLock::new();

#[derive(Debug, Default)]
pub struct NotifierMetrics {
    delivered_local_total: AtomicU64,
    forwarded_total: AtomicU64,
    persisted_offline_total: AtomicU64,
    dead_letter_total: AtomicU64,
    malformed_events_total: AtomicU64,
    ws_connected_total: AtomicU64,
    ws_replaced_total: AtomicU64,
    active_connections: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub delivered_local_total: u64,
    pub forwarded_total: u64,
    pub persisted_offline_total: u64,
    pub dead_letter_total: u64,
    pub malformed_events_total: u64,
    pub ws_connected_total: u64,
    pub ws_replaced_total: u64,
    pub active_connections: i64,
}

impl NotifierMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            delivered_local_total: self.delivered_local_total.load(Ordering::Relaxed),
            forwarded_total: self.forwarded_total.load(Ordering::Relaxed),
            persisted_offline_total: self.persisted_offline_total.load(Ordering::Relaxed),
            dead_letter_total: self.dead_letter_total.load(Ordering::Relaxed),
            malformed_events_total: self.malformed_events_total.load(Ordering::Relaxed),
            ws_connected_total: self.ws_connected_total.load(Ordering::Relaxed),
            ws_replaced_total: self.ws_replaced_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<NotifierMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<NotifierMetrics>> {
    GLOBAL_METRICS.get()
}

macro_rules! counter_fn {
    ($name:ident, $field:ident) => {
        pub fn $name() {
            if let Some(metrics) = global_metrics() {
                metrics.$field.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

counter_fn!(increment_delivered_local, delivered_local_total);
counter_fn!(increment_forwarded, forwarded_total);
counter_fn!(increment_persisted_offline, persisted_offline_total);
counter_fn!(increment_dead_letter, dead_letter_total);
counter_fn!(increment_malformed_events, malformed_events_total);
counter_fn!(increment_ws_connected, ws_connected_total);
counter_fn!(increment_ws_replaced, ws_replaced_total);

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
