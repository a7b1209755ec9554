//! Pod metrics: process-local atomic counters rendered as Prometheus
//! text on `/metrics`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Monotonic counter.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `delta`.
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Settable gauge.
#[derive(Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Set the current value.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counter family with one string label.
///
/// Label cardinality is bounded by the callers (frame kinds, close
/// reasons, room ids are capped by `MAX_ROOMS`).
#[derive(Default)]
pub struct LabeledCounter {
    values: Mutex<BTreeMap<String, u64>>,
}

impl LabeledCounter {
    /// Increment the labelled series by one.
    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    /// Increment the labelled series by `delta`.
    pub fn add(&self, label: &str, delta: u64) {
        let mut values = self.values.lock().expect("metrics mutex poisoned");
        *values.entry(label.to_string()).or_insert(0) += delta;
    }

    /// Value of one series (0 if never touched).
    pub fn get(&self, label: &str) -> u64 {
        self.values.lock().expect("metrics mutex poisoned").get(label).copied().unwrap_or(0)
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.lock().expect("metrics mutex poisoned").clone()
    }
}

/// Gauge family with one string label.
#[derive(Default)]
pub struct LabeledGauge {
    values: Mutex<BTreeMap<String, u64>>,
}

impl LabeledGauge {
    /// Set the labelled series.
    pub fn set(&self, label: &str, value: u64) {
        let mut values = self.values.lock().expect("metrics mutex poisoned");
        values.insert(label.to_string(), value);
    }

    /// Remove a series (room destroyed).
    pub fn remove(&self, label: &str) {
        self.values.lock().expect("metrics mutex poisoned").remove(label);
    }

    /// Value of one series (0 if absent).
    pub fn get(&self, label: &str) -> u64 {
        self.values.lock().expect("metrics mutex poisoned").get(label).copied().unwrap_or(0)
    }

    /// Largest value across the family (health threshold checks).
    pub fn max(&self) -> u64 {
        self.values.lock().expect("metrics mutex poisoned").values().copied().max().unwrap_or(0)
    }

    fn snapshot(&self) -> BTreeMap<String, u64> {
        self.values.lock().expect("metrics mutex poisoned").clone()
    }
}

/// All pod counters and gauges.
#[derive(Default)]
pub struct PodMetrics {
    /// Live sessions per room.
    pub active_sessions: LabeledGauge,
    /// Rooms currently materialized on this pod.
    pub active_rooms: Gauge,
    /// Frames received, by frame kind.
    pub frames_in: LabeledCounter,
    /// Frames sent, by frame kind.
    pub frames_out: LabeledCounter,
    /// Peer presence entries rejected as stale.
    pub presence_diffs_dedup_dropped: Counter,
    /// Storage ops applied to in-memory documents.
    pub storage_ops_applied: Counter,
    /// Storage ops durably appended.
    pub storage_ops_persisted: Counter,
    /// Consumer lag behind the stream head, per room.
    pub stream_lag_entries: LabeledGauge,
    /// Egress frames dropped, by reason.
    pub egress_drops: LabeledCounter,
    /// Session closes, by reason.
    pub session_closes: LabeledCounter,
}

impl PodMetrics {
    /// Render every series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        render_labeled_gauge(&mut out, "syncpod_active_sessions", "room", &self.active_sessions);
        render_scalar(&mut out, "syncpod_active_rooms", "gauge", self.active_rooms.get());
        render_labeled(&mut out, "syncpod_frames_in_total", "type", &self.frames_in);
        render_labeled(&mut out, "syncpod_frames_out_total", "type", &self.frames_out);
        render_scalar(
            &mut out,
            "syncpod_presence_diffs_dedup_dropped_total",
            "counter",
            self.presence_diffs_dedup_dropped.get(),
        );
        render_scalar(
            &mut out,
            "syncpod_storage_ops_applied_total",
            "counter",
            self.storage_ops_applied.get(),
        );
        render_scalar(
            &mut out,
            "syncpod_storage_ops_persisted_total",
            "counter",
            self.storage_ops_persisted.get(),
        );
        render_labeled_gauge(&mut out, "syncpod_stream_lag_entries", "room", &self.stream_lag_entries);
        render_labeled(&mut out, "syncpod_egress_drops_total", "reason", &self.egress_drops);
        render_labeled(&mut out, "syncpod_session_closes_total", "reason", &self.session_closes);

        out
    }
}

fn render_scalar(out: &mut String, name: &str, kind: &str, value: u64) {
    out.push_str(&format!("# TYPE {name} {kind}\n{name} {value}\n"));
}

fn render_labeled(out: &mut String, name: &str, label: &str, counter: &LabeledCounter) {
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (key, value) in counter.snapshot() {
        out.push_str(&format!("{name}{{{label}=\"{key}\"}} {value}\n"));
    }
}

fn render_labeled_gauge(out: &mut String, name: &str, label: &str, gauge: &LabeledGauge) {
    out.push_str(&format!("# TYPE {name} gauge\n"));
    for (key, value) in gauge.snapshot() {
        out.push_str(&format!("{name}{{{label}=\"{key}\"}} {value}\n"));
    }
}
