//! Prometheus metrics
//!
//! Prometheus text exporter over `std::sync::atomic` and `parking_lot`.
//! Counters, gauges, histograms and labelled counters are registered on a
//! [`MetricsRegistry`] owned by the application state, so each server (and
//! each test) gets its own set.

use std::collections::HashMap;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use parking_lot::RwLock;

use crate::service::AppState;

// ---------------------------------------------------------------------------
// Atomic primitives
// ---------------------------------------------------------------------------

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An `f64` gauge stored bit-cast in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, val: f64) {
        self.0.store(val.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

fn atomic_add_f64(cell: &AtomicU64, delta: f64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
        Some((f64::from_bits(bits) + delta).to_bits())
    });
}

/// Cumulative histogram over fixed upper bounds (+Inf implied).
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// One slot per bound plus the +Inf slot.
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum: AtomicU64::new(0.0_f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, val: f64) {
        for (slot, bound) in self.counts.iter().zip(&self.bounds) {
            if val <= *bound {
                slot.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counts[self.bounds.len()].fetch_add(1, Ordering::Relaxed);
        atomic_add_f64(&self.sum, val);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }
}

/// Counters keyed by label values.
#[derive(Debug)]
pub struct CounterVec {
    label_names: Vec<String>,
    entries: RwLock<HashMap<Vec<String>, Arc<Counter>>>,
}

impl CounterVec {
    fn new(label_names: &[&str]) -> Self {
        Self {
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        self.with_label_values(label_values).inc();
    }

    pub fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        self.entries.read().get(&key).map_or(0, |c| c.get())
    }

    pub fn with_label_values(&self, label_values: &[&str]) -> Arc<Counter> {
        let key: Vec<String> = label_values.iter().map(|s| s.to_string()).collect();
        if let Some(counter) = self.entries.read().get(&key) {
            return Arc::clone(counter);
        }
        Arc::clone(
            self.entries
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(Counter::default())),
        )
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
        }
    }
}

#[derive(Debug)]
enum MetricData {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    CounterVec(Arc<CounterVec>),
}

#[derive(Debug)]
struct MetricDescriptor {
    name: String,
    help: String,
    metric_type: MetricType,
    data: MetricData,
}

/// Set of metrics rendered together.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<Vec<MetricDescriptor>>,
}

impl MetricsRegistry {
    fn register(&self, name: &str, help: &str, metric_type: MetricType, data: MetricData) {
        self.metrics.write().push(MetricDescriptor {
            name: name.to_string(),
            help: help.to_string(),
            metric_type,
            data,
        });
    }

    pub fn register_counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let counter = Arc::new(Counter::default());
        self.register(name, help, MetricType::Counter, MetricData::Counter(Arc::clone(&counter)));
        counter
    }

    pub fn register_counter_vec(&self, name: &str, help: &str, label_names: &[&str]) -> Arc<CounterVec> {
        let vec = Arc::new(CounterVec::new(label_names));
        self.register(name, help, MetricType::Counter, MetricData::CounterVec(Arc::clone(&vec)));
        vec
    }

    pub fn register_gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let gauge = Arc::new(Gauge::default());
        self.register(name, help, MetricType::Gauge, MetricData::Gauge(Arc::clone(&gauge)));
        gauge
    }

    pub fn register_histogram(&self, name: &str, help: &str, bounds: Vec<f64>) -> Arc<Histogram> {
        let histogram = Arc::new(Histogram::new(bounds));
        self.register(
            name,
            help,
            MetricType::Histogram,
            MetricData::Histogram(Arc::clone(&histogram)),
        );
        histogram
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metrics = self.metrics.read();
        let mut out = String::with_capacity(2048);

        for desc in metrics.iter() {
            let _ = writeln!(out, "# HELP {} {}", desc.name, desc.help);
            let _ = writeln!(out, "# TYPE {} {}", desc.name, desc.metric_type.as_str());

            match &desc.data {
                MetricData::Counter(counter) => {
                    let _ = writeln!(out, "{} {}", desc.name, counter.get());
                }
                MetricData::Gauge(gauge) => {
                    let _ = writeln!(out, "{} {}", desc.name, format_number(gauge.get()));
                }
                MetricData::Histogram(histogram) => render_histogram(&mut out, &desc.name, histogram),
                MetricData::CounterVec(vec) => {
                    let entries = vec.entries.read();
                    let mut sorted: Vec<_> = entries.iter().collect();
                    sorted.sort_by(|a, b| a.0.cmp(b.0));
                    for (values, counter) in sorted {
                        let labels = format_labels(&vec.label_names, values);
                        let _ = writeln!(out, "{}{} {}", desc.name, labels, counter.get());
                    }
                }
            }
        }

        out
    }
}

/// Integers render without a decimal point.
fn format_number(v: f64) -> String {
    if v.is_finite() && v == v.floor() {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn format_labels(names: &[String], values: &[String]) -> String {
    let pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label_value(value)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn render_histogram(out: &mut String, name: &str, h: &Histogram) {
    for (bound, slot) in h.bounds.iter().zip(&h.counts) {
        let _ = writeln!(
            out,
            "{}_bucket{{le=\"{}\"}} {}",
            name,
            format_number(*bound),
            slot.load(Ordering::Relaxed)
        );
    }
    let inf = h.counts[h.bounds.len()].load(Ordering::Relaxed);
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, inf);
    let _ = writeln!(out, "{}_sum {}", name, format_number(h.get_sum()));
    let _ = writeln!(out, "{}_count {}", name, h.get_count());
}

// ---------------------------------------------------------------------------
// Service metrics
// ---------------------------------------------------------------------------

/// Latency bounds in seconds.
const DURATION_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Size bounds in bytes.
const SIZE_BUCKETS: [f64; 8] = [
    1_000.0,
    10_000.0,
    100_000.0,
    500_000.0,
    1_000_000.0,
    5_000_000.0,
    11_000_000.0,
    50_000_000.0,
];

/// Handles for every metric the service records.
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: MetricsRegistry,
    started: Instant,
    /// Requests by operation and result code (`ok` on success).
    pub requests_total: Arc<CounterVec>,
    pub fetch_duration_seconds: Arc<Histogram>,
    pub analysis_duration_seconds: Arc<Histogram>,
    pub file_size_bytes: Arc<Histogram>,
    pub usage_query_duration_seconds: Arc<Histogram>,
    uptime_seconds: Arc<Gauge>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        let registry = MetricsRegistry::default();

        let requests_total = registry.register_counter_vec(
            "fileinfo_requests_total",
            "Total operations handled",
            &["operation", "code"],
        );
        let fetch_duration_seconds = registry.register_histogram(
            "fileinfo_fetch_duration_seconds",
            "Time spent downloading remote files",
            DURATION_BUCKETS.to_vec(),
        );
        let analysis_duration_seconds = registry.register_histogram(
            "fileinfo_analysis_duration_seconds",
            "Time spent running analyzers",
            DURATION_BUCKETS.to_vec(),
        );
        let file_size_bytes = registry.register_histogram(
            "fileinfo_file_size_bytes",
            "Size of fetched files",
            SIZE_BUCKETS.to_vec(),
        );
        let usage_query_duration_seconds = registry.register_histogram(
            "fileinfo_usage_query_duration_seconds",
            "Time spent waiting for usage queries",
            DURATION_BUCKETS.to_vec(),
        );
        let build_info = registry.register_counter_vec(
            "fileinfo_build_info",
            "Build information",
            &["version"],
        );
        build_info.inc(&[env!("CARGO_PKG_VERSION")]);
        let uptime_seconds =
            registry.register_gauge("fileinfo_uptime_seconds", "Service uptime in seconds");

        Self {
            registry,
            started: Instant::now(),
            requests_total,
            fetch_duration_seconds,
            analysis_duration_seconds,
            file_size_bytes,
            usage_query_duration_seconds,
            uptime_seconds,
        }
    }

    pub fn record_request(&self, operation: &str, code: &str) {
        self.requests_total.inc(&[operation, code]);
    }

    pub fn render(&self) -> String {
        self.uptime_seconds
            .set(self.started.elapsed().as_secs_f64().floor());
        self.registry.render()
    }
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics().render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_inc() {
        let c = Counter::default();
        assert_eq!(c.get(), 0);
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
    }

    #[test]
    fn test_gauge_set_overwrite() {
        let g = Gauge::default();
        g.set(2.5);
        g.set(-1.0);
        assert_eq!(g.get(), -1.0);
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let h = Histogram::new(vec![1.0, 5.0]);
        h.observe(0.5);
        h.observe(1.0);
        h.observe(3.0);
        h.observe(10.0);

        let mut out = String::new();
        render_histogram(&mut out, "h", &h);
        assert!(out.contains("h_bucket{le=\"1\"} 2\n"), "{out}");
        assert!(out.contains("h_bucket{le=\"5\"} 3\n"), "{out}");
        assert!(out.contains("h_bucket{le=\"+Inf\"} 4\n"), "{out}");
        assert!(out.contains("h_sum 14.5\n"), "{out}");
        assert!(out.contains("h_count 4\n"), "{out}");
    }

    #[test]
    fn test_histogram_observe_duration() {
        let h = Histogram::new(vec![0.1]);
        h.observe_duration(Duration::from_millis(50));
        assert_eq!(h.get_count(), 1);
        assert!((h.get_sum() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_counter_vec_labels() {
        let registry = MetricsRegistry::default();
        let vec = registry.register_counter_vec("ops_total", "Ops", &["operation", "code"]);
        vec.inc(&["read_file", "ok"]);
        vec.inc(&["read_file", "ok"]);
        vec.inc(&["get_usage", "query_failed"]);

        assert_eq!(vec.get(&["read_file", "ok"]), 2);
        assert_eq!(vec.get(&["read_file", "file_too_large"]), 0);

        let out = registry.render();
        assert!(out.contains("# TYPE ops_total counter"));
        assert!(out.contains("ops_total{operation=\"read_file\",code=\"ok\"} 2"));
        assert!(out.contains("ops_total{operation=\"get_usage\",code=\"query_failed\"} 1"));
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\\b"), "a\\\\b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.25), "0.25");
    }

    #[test]
    fn test_render_empty_registry() {
        assert!(MetricsRegistry::default().render().is_empty());
    }

    #[test]
    fn test_service_metrics_registered() {
        let metrics = ServiceMetrics::new();
        metrics.record_request("read_file", "ok");
        metrics.file_size_bytes.observe(2048.0);

        let out = metrics.render();
        for name in [
            "fileinfo_requests_total",
            "fileinfo_fetch_duration_seconds",
            "fileinfo_analysis_duration_seconds",
            "fileinfo_file_size_bytes",
            "fileinfo_usage_query_duration_seconds",
            "fileinfo_build_info",
            "fileinfo_uptime_seconds",
        ] {
            assert!(out.contains(&format!("# TYPE {name} ")), "missing {name}");
        }
        assert!(out.contains(&format!(
            "fileinfo_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )));
        assert!(out.contains("fileinfo_file_size_bytes_count 1"));
    }
}
