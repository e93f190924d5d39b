//! Lightweight metrics helpers for Keystone Gateway.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It intentionally avoids embedding a
//! concrete exporter (the application can initialize any compatible recorder
//! externally) while still documenting and describing gateway-specific
//! metric names.
//!
//! Provided metrics (labels vary by family):
//! * `keystone_requests_total` (counter)
//! * `keystone_request_duration_seconds` (histogram)
//! * `keystone_backend_requests_total` (counter)
//! * `keystone_backend_request_duration_seconds` (histogram)
//! * `keystone_backend_health_status` (gauge per backend)
//! * `keystone_active_connections` (gauge)
//! * `keystone_active_requests` (gauge)
//! * `keystone_script_pool_idle` (gauge per tenant)
//! * `keystone_script_pool_capacity` (gauge per tenant)
//!
//! The `*_timer` structs leverage `Drop` to record durations safely even when
//! early returns or errors occur.
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const KEYSTONE_BACKEND_HEALTH_STATUS: &str = "keystone_backend_health_status";
pub const KEYSTONE_REQUESTS_TOTAL: &str = "keystone_requests_total";
pub const KEYSTONE_REQUEST_DURATION_SECONDS: &str = "keystone_request_duration_seconds";
pub const KEYSTONE_BACKEND_REQUESTS_TOTAL: &str = "keystone_backend_requests_total";
pub const KEYSTONE_BACKEND_REQUEST_DURATION_SECONDS: &str =
    "keystone_backend_request_duration_seconds";
pub const KEYSTONE_ACTIVE_CONNECTIONS: &str = "keystone_active_connections";
pub const KEYSTONE_ACTIVE_REQUESTS: &str = "keystone_active_requests";
pub const KEYSTONE_SCRIPT_POOL_IDLE: &str = "keystone_script_pool_idle";
pub const KEYSTONE_SCRIPT_POOL_CAPACITY: &str = "keystone_script_pool_capacity";

/// Storage for backend health status gauges
pub static BACKEND_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        KEYSTONE_BACKEND_HEALTH_STATUS,
        "Health status of individual backends (1 for healthy, 0 for unhealthy)"
    );
    describe_counter!(
        KEYSTONE_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        KEYSTONE_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        KEYSTONE_BACKEND_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to backend services."
    );
    describe_histogram!(
        KEYSTONE_BACKEND_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to backend services."
    );
    describe_gauge!(
        KEYSTONE_ACTIVE_CONNECTIONS,
        "Number of currently active connections to the gateway."
    );
    describe_gauge!(
        KEYSTONE_ACTIVE_REQUESTS,
        "Number of currently active requests being processed."
    );
    describe_gauge!(
        KEYSTONE_SCRIPT_POOL_IDLE,
        "Number of idle interpreter instances in a tenant's script pool."
    );
    describe_gauge!(
        KEYSTONE_SCRIPT_POOL_CAPACITY,
        "Configured interpreter pool capacity for a tenant."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health status gauge for a backend.
pub fn set_backend_health_status(backend_id: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = BACKEND_HEALTH_GAUGES.lock() {
        gauges.insert(backend_id.to_string(), health_value);
    } else {
        tracing::error!("Failed to acquire lock for backend health gauges");
        return;
    }

    let backend_label = backend_id.to_string();
    gauge!(KEYSTONE_BACKEND_HEALTH_STATUS, "backend" => backend_label).set(health_value);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        KEYSTONE_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        KEYSTONE_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of proxied backend requests.
pub fn increment_backend_request_total(backend: &str, path: &str, method: &str, status: u16) {
    counter!(
        KEYSTONE_BACKEND_REQUESTS_TOTAL,
        "backend" => backend.to_string(),
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed backend request duration.
pub fn record_backend_request_duration(
    backend: &str,
    path: &str,
    method: &str,
    duration: std::time::Duration,
) {
    histogram!(
        KEYSTONE_BACKEND_REQUEST_DURATION_SECONDS,
        "backend" => backend.to_string(),
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current active connection count.
pub fn set_active_connections(count: usize) {
    gauge!(KEYSTONE_ACTIVE_CONNECTIONS).set(count as f64);
}

/// Set current active in-flight request count.
pub fn set_active_requests(count: u64) {
    gauge!(KEYSTONE_ACTIVE_REQUESTS).set(count as f64);
}

/// Record a tenant's interpreter pool occupancy (§4.6, §5).
pub fn set_script_pool_gauges(tenant: &str, idle: usize, capacity: usize) {
    gauge!(KEYSTONE_SCRIPT_POOL_IDLE, "tenant" => tenant.to_string()).set(idle as f64);
    gauge!(KEYSTONE_SCRIPT_POOL_CAPACITY, "tenant" => tenant.to_string()).set(capacity as f64);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring backend request duration.
pub struct BackendRequestTimer {
    start: Instant,
    backend: String,
    path: String,
    method: String,
}

impl BackendRequestTimer {
    pub fn new(backend: &str, path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            backend: backend.to_string(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for BackendRequestTimer {
    fn drop(&mut self) {
        record_backend_request_duration(
            &self.backend,
            &self.path,
            &self.method,
            self.start.elapsed(),
        );
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("initializing metrics system");

    Lazy::force(&BACKEND_HEALTH_GAUGES);

    tracing::info!("metrics system initialized");
    Ok(())
}

/// Collect a snapshot of gauge values used for ad-hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = BACKEND_HEALTH_GAUGES.lock() {
        for (backend, health) in gauges.iter() {
            metrics.insert(format!("backend_health_{backend}"), *health);
        }
    }

    metrics
}
