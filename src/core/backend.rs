use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

use crate::{config::HealthStatus, metrics::set_backend_health_status};

const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to backend operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackendError {
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of a backend URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    url: String,
    is_secure: bool,
}

impl BackendUrl {
    pub fn new(url: &str) -> BackendResult<Self> {
        let is_secure = url.starts_with("https://");
        let is_http = url.starts_with("http://");

        if !is_secure && !is_http {
            return Err(BackendError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {url}"
            )));
        }

        Ok(BackendUrl {
            url: url.to_string(),
            is_secure,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    pub fn into_string(self) -> String {
        self.url
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Tracks the liveness of a backend. Initial state is unhealthy: a backend
/// must pass its first probe before it can be selected (§4.1).
#[derive(Debug)]
pub struct BackendHealth {
    target_url: BackendUrl,
    status: AtomicU8,
    pub consecutive_successes: AtomicU32,
    pub consecutive_failures: AtomicU32,
    last_probe_at_millis: AtomicI64,
}

impl BackendHealth {
    pub fn new(target: BackendUrl) -> Self {
        Self {
            target_url: target,
            status: AtomicU8::new(HEALTH_STATUS_UNHEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_probe_at_millis: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub fn mark_healthy(&self) {
        self.status.store(HEALTH_STATUS_HEALTHY, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        let current = self.consecutive_successes.load(Ordering::Relaxed);
        self.consecutive_successes
            .store(current + 1, Ordering::Release);
        self.record_probe();
        set_backend_health_status(self.target_url.as_str(), true);
    }

    pub fn mark_unhealthy(&self) {
        self.status
            .store(HEALTH_STATUS_UNHEALTHY, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        let current = self.consecutive_failures.load(Ordering::Relaxed);
        self.consecutive_failures
            .store(current + 1, Ordering::Release);
        self.record_probe();
        set_backend_health_status(self.target_url.as_str(), false);
    }

    fn record_probe(&self) {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.last_probe_at_millis.store(now_millis, Ordering::Release);
    }

    pub fn last_probe_at_millis(&self) -> i64 {
        self.last_probe_at_millis.load(Ordering::Acquire)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

/// A tenant's upstream service instance: a stable identity (`name`, `url`)
/// plus the mutable liveness tracked by the health checker.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub url: BackendUrl,
    pub health_path: String,
    pub health: BackendHealth,
}

impl Backend {
    pub fn new(name: impl Into<String>, url: BackendUrl, health_path: impl Into<String>) -> Self {
        let url_clone = url.clone();
        Self {
            name: name.into(),
            url,
            health_path: health_path.into(),
            health: BackendHealth::new(url_clone),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    pub fn health_check_url(&self) -> String {
        format!("{}{}", self.url.as_str(), self.health_path)
    }
}
