//! Configuration data structures for Keystone Gateway.
//!
//! These types map directly to YAML (also JSON / TOML via the `config` crate)
//! configuration files. They are intentionally serde-friendly and carry
//! defaults so a minimal tenant definition stays concise.
use serde::{Deserialize, Serialize};

fn default_admin_base_path() -> String {
    "/admin".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

/// Top-level gateway configuration, the typed object a loader hands to the core.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub admin_base_path: String,
    pub server: ServerConfig,
    pub request_limits: RequestLimits,
    pub health_check: HealthCheckConfig,
    pub tenants: Vec<TenantConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            admin_base_path: default_admin_base_path(),
            server: ServerConfig::default(),
            request_limits: RequestLimits::default(),
            health_check: HealthCheckConfig::default(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Upstream proxy timeout in seconds (request to backend, §4.4).
    pub upstream_timeout_secs: u64,
    /// Outbound HTTP client (scripting `http_get`/`http_post`) default timeout.
    pub outbound_timeout_secs: u64,
    /// Per-request script execution budget, in milliseconds (§5 Timeouts).
    pub script_budget_ms: u64,
    /// Grace period allowed for in-flight requests during shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            port: default_listen_port(),
            upstream_timeout_secs: 60,
            outbound_timeout_secs: 10,
            script_budget_ms: 250,
            shutdown_grace_secs: 30,
        }
    }
}

/// Request guard limits (§3 Tenant.request_limits), with gateway-wide defaults
/// that a tenant may override.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct RequestLimits {
    pub max_body_bytes: usize,
    pub max_header_bytes: usize,
    pub max_url_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            max_header_bytes: 1024 * 1024,
            max_url_bytes: 8 * 1024,
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    10
}

fn default_max_instances() -> usize {
    32
}

/// Health-checker tuning, shared across all tenants (§4.1). A tenant may
/// override the polling interval only; the probe timeout is gateway-wide.
/// There are no threshold fields here: a single failed probe flips a
/// backend unhealthy immediately and a single successful one flips it back,
/// by design (§4.1 "there is no flapping suppression").
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { timeout_secs: 3 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A single tenant's routing, backends, and script-set binding.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TenantConfig {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Directory of `.lua` sources owned by this tenant, read at startup/reload.
    #[serde(default)]
    pub script_dir: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_interval_seconds: u64,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub request_limits: Option<RequestLimits>,
    #[serde(default = "default_max_instances")]
    pub max_script_instances: usize,
}

/// How a tenant is selected from (host, path) — derived from config, not set
/// directly; see [`TenantConfig::selector`] and the Route Resolver (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantSelector {
    Hybrid {
        domains: Vec<String>,
        path_prefix: String,
    },
    HostOnly {
        domains: Vec<String>,
    },
    PathOnly {
        path_prefix: String,
    },
}

impl TenantConfig {
    /// Classify this tenant's routing selector per the three resolver strategies.
    pub fn selector(&self) -> TenantSelector {
        match (self.domains.is_empty(), &self.path_prefix) {
            (false, Some(prefix)) => TenantSelector::Hybrid {
                domains: self.domains.clone(),
                path_prefix: prefix.clone(),
            },
            (false, None) => TenantSelector::HostOnly {
                domains: self.domains.clone(),
            },
            (true, Some(prefix)) => TenantSelector::PathOnly {
                path_prefix: prefix.clone(),
            },
            (true, None) => TenantSelector::PathOnly {
                path_prefix: "/".to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(domains: Vec<&str>, path_prefix: Option<&str>) -> TenantConfig {
        TenantConfig {
            name: "t".into(),
            domains: domains.into_iter().map(String::from).collect(),
            path_prefix: path_prefix.map(String::from),
            script_dir: None,
            health_interval_seconds: 10,
            backends: vec![],
            request_limits: None,
            max_script_instances: 8,
        }
    }

    #[test]
    fn selector_classifies_hybrid() {
        let t = tenant(vec!["example.com"], Some("/api/"));
        assert_eq!(
            t.selector(),
            TenantSelector::Hybrid {
                domains: vec!["example.com".into()],
                path_prefix: "/api/".into(),
            }
        );
    }

    #[test]
    fn selector_classifies_host_only() {
        let t = tenant(vec!["svc.example.com"], None);
        assert_eq!(
            t.selector(),
            TenantSelector::HostOnly {
                domains: vec!["svc.example.com".into()],
            }
        );
    }

    #[test]
    fn selector_classifies_path_only() {
        let t = tenant(vec![], Some("/api/"));
        assert_eq!(
            t.selector(),
            TenantSelector::PathOnly {
                path_prefix: "/api/".into(),
            }
        );
    }

    #[test]
    fn selector_defaults_to_root_path() {
        let t = tenant(vec![], None);
        assert_eq!(
            t.selector(),
            TenantSelector::PathOnly {
                path_prefix: "/".into(),
            }
        );
    }
}
