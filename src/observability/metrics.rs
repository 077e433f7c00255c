use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency service.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_request(&self, service: &str, operation: &str) {
        counter!("idempotency_requests_total", "service" => service.to_string(), "operation" => operation.to_string()).increment(1);
    }

    pub fn record_cache_hit(&self, service: &str, operation: &str, outcome: &str) {
        counter!("idempotency_cache_hits_total", "service" => service.to_string(), "operation" => operation.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_lock_acquired(&self, service: &str, operation: &str, reclaimed: bool) {
        counter!("idempotency_locks_acquired_total", "service" => service.to_string(), "operation" => operation.to_string(), "reclaimed" => reclaimed.to_string()).increment(1);
    }

    pub fn record_lock_conflict(&self, service: &str, operation: &str, expired: bool) {
        counter!("idempotency_lock_conflicts_total", "service" => service.to_string(), "operation" => operation.to_string(), "expired" => expired.to_string()).increment(1);
    }

    pub fn record_execution(&self, service: &str, operation: &str, success: bool, duration_ms: f64) {
        counter!("idempotency_executions_total", "service" => service.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_execution_duration_ms", "service" => service.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_duplicate_write(&self, kind: &str) {
        counter!("idempotency_duplicate_writes_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn record_late_completion(&self, service: &str, operation: &str) {
        counter!("idempotency_late_completions_total", "service" => service.to_string(), "operation" => operation.to_string()).increment(1);
    }

    pub fn record_locks_reaped(&self, count: u64) {
        counter!("idempotency_locks_reaped_total").increment(count);
    }

    pub fn record_reservations_purged(&self, count: u64) {
        counter!("idempotency_reservations_purged_total").increment(count);
    }

    pub fn record_store_retry(&self, call: &str) {
        counter!("idempotency_store_retries_total", "call" => call.to_string()).increment(1);
    }

    pub fn record_store_call(&self, call: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_calls_total", "call" => call.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_call_duration_ms", "call" => call.to_string()).record(duration_ms);
    }

    pub fn set_registered_operations(&self, count: usize) {
        gauge!("idempotency_registered_operations").set(count as f64);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_requests_total", Unit::Count, "Total idempotent operation requests");
    describe_counter!("idempotency_cache_hits_total", Unit::Count, "Requests answered from a stored result");
    describe_counter!("idempotency_locks_acquired_total", Unit::Count, "Locks acquired, including reclaimed stale reservations");
    describe_counter!("idempotency_lock_conflicts_total", Unit::Count, "Acquisition attempts that found an existing reservation");
    describe_counter!("idempotency_executions_total", Unit::Count, "Wrapped operation executions");
    describe_histogram!("idempotency_execution_duration_ms", Unit::Milliseconds, "Wrapped operation latency in milliseconds");
    describe_counter!("idempotency_duplicate_writes_total", Unit::Count, "Result writes that lost a race to an earlier writer");
    describe_counter!("idempotency_late_completions_total", Unit::Count, "Completions reported after the lock expired");

    describe_counter!("idempotency_locks_reaped_total", Unit::Count, "Expired locks recorded as OPERATION_EXPIRED by the reaper");
    describe_counter!("idempotency_reservations_purged_total", Unit::Count, "Expired reservations physically removed");

    describe_counter!("idempotency_store_retries_total", Unit::Count, "Store calls retried after a transient error");
    describe_counter!("idempotency_store_calls_total", Unit::Count, "Store calls made by the idempotency core");
    describe_histogram!("idempotency_store_call_duration_ms", Unit::Milliseconds, "Store call latency in milliseconds");

    describe_gauge!("idempotency_registered_operations", Unit::Count, "Operation configs loaded in the registry");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
