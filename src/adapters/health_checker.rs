//! Health checker adapter (§4.1): one task per tenant, each backend probed
//! on its own schedule. No flapping suppression — a single failed probe
//! flips a backend unhealthy, a single successful one flips it back.
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body as AxumBody;
use hyper::Request;
use tokio_util::sync::CancellationToken;

use crate::core::{GatewayService, backend::Backend};
use crate::ports::http_client::HttpClient;

const PROBE_TIMEOUT_SECS: u64 = 3;

/// Performs one health probe against `backend` and updates its atomic
/// status in place. Never panics; a transport error or non-2xx/3xx status
/// is simply recorded as unhealthy.
pub async fn check_once(http_client: &dyn HttpClient, backend: &Backend) {
    let url = backend.health_check_url();
    let request = match Request::builder()
        .method("GET")
        .uri(&url)
        .body(AxumBody::empty())
    {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!(backend = %backend.name, error = %err, "failed to build health probe request");
            backend.health.mark_unhealthy();
            return;
        }
    };

    let timeout = Duration::from_secs(PROBE_TIMEOUT_SECS);
    let outcome = tokio::time::timeout(timeout, http_client.send_request(request)).await;

    match outcome {
        Ok(Ok(response)) if (response.status().as_u16()) < 400 => backend.health.mark_healthy(),
        Ok(Ok(response)) => {
            tracing::debug!(backend = %backend.name, status = %response.status(), "health probe returned error status");
            backend.health.mark_unhealthy();
        }
        Ok(Err(err)) => {
            tracing::debug!(backend = %backend.name, error = %err, "health probe transport error");
            backend.health.mark_unhealthy();
        }
        Err(_) => {
            tracing::debug!(backend = %backend.name, "health probe timed out");
            backend.health.mark_unhealthy();
        }
    }
}

/// Drives periodic [`check_once`] calls for every backend of one tenant,
/// each on its own interval ticker so probes across backends may overlap
/// (§4.1). Returns when `cancel` fires.
pub async fn run_tenant(
    gateway: &GatewayService,
    tenant_name: &str,
    http_client: Arc<dyn HttpClient>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let Some(runtime) = gateway.tenant(tenant_name).await else {
        return;
    };

    for backend in &runtime.backends {
        tracing::debug!(tenant = tenant_name, backend = %backend.name, url = %backend.health_check_url(), "starting health probe loop");
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let probes = runtime
                    .backends
                    .iter()
                    .map(|backend| check_once(http_client.as_ref(), backend));
                futures_util::future::join_all(probes).await;
            }
        }
    }
}

/// Spawns one health-check task per currently configured tenant, each
/// running until `cancel` fires. Intended to be (re)started whenever the
/// gateway's tenant table changes (config reload, §4.9).
pub fn spawn_all(
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    cancel: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let config = gateway.config();
    config
        .tenants
        .iter()
        .map(|tenant_cfg| {
            let gateway = gateway.clone();
            let http_client = http_client.clone();
            let cancel = cancel.clone();
            let tenant_name = tenant_cfg.name.clone();
            let interval = Duration::from_secs(tenant_cfg.health_interval_seconds);
            tokio::spawn(async move {
                run_tenant(&gateway, &tenant_name, http_client, interval, cancel).await;
            })
        })
        .collect()
}
