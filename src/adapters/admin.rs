//! Admin Surface (§4.10): thin, read-only gateway introspection endpoints.
//! Served directly by the request entrypoint and never fall through to
//! tenant scripts or the proxy director.
use axum::body::Body as AxumBody;
use hyper::{Response, StatusCode, header};
use serde::Serialize;

use crate::core::GatewayService;

#[derive(Serialize)]
struct TenantHealthSummary {
    name: String,
    alive: usize,
    total: usize,
    healthy: bool,
}

#[derive(Serialize)]
struct GatewayHealthResponse {
    healthy: bool,
    tenants: Vec<TenantHealthSummary>,
}

#[derive(Serialize)]
struct TenantListEntry {
    name: String,
    selector: &'static str,
    domains: Vec<String>,
    path_prefix: Option<String>,
    backends: Vec<String>,
    alive: usize,
    total: usize,
}

fn json_response(status: StatusCode, body: impl Serialize) -> Response<AxumBody> {
    let payload = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(AxumBody::from(payload))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(AxumBody::empty())
                .expect("bare 500 response is always constructible")
        })
}

fn not_found(message: &str) -> Response<AxumBody> {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": message }),
    )
}

/// `GET {admin_base_path}/health`: 200 if every tenant has at least one
/// alive backend, else 503 (§4.10). A tenant with zero configured backends
/// counts as unhealthy rather than vacuously healthy.
pub async fn gateway_health(gateway: &GatewayService) -> Response<AxumBody> {
    let all = gateway.all_tenant_health().await;
    let tenants: Vec<TenantHealthSummary> = all
        .into_iter()
        .map(|(name, alive, total)| TenantHealthSummary {
            name,
            alive,
            total,
            healthy: alive > 0,
        })
        .collect();
    let healthy = !tenants.is_empty() && tenants.iter().all(|t| t.healthy);

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    json_response(status, GatewayHealthResponse { healthy, tenants })
}

/// `GET {admin_base_path}/tenants`: selector, backend names, and health
/// counts for every configured tenant (§4.10).
pub async fn list_tenants(gateway: &GatewayService) -> Response<AxumBody> {
    let config = gateway.config();
    let mut entries = Vec::with_capacity(config.tenants.len());

    for tenant_cfg in &config.tenants {
        let (alive, total) = gateway
            .tenant_health(&tenant_cfg.name)
            .await
            .unwrap_or((0, 0));
        let selector = match tenant_cfg.selector() {
            crate::config::TenantSelector::Hybrid { .. } => "hybrid",
            crate::config::TenantSelector::HostOnly { .. } => "host_only",
            crate::config::TenantSelector::PathOnly { .. } => "path_only",
        };
        entries.push(TenantListEntry {
            name: tenant_cfg.name.clone(),
            selector,
            domains: tenant_cfg.domains.clone(),
            path_prefix: tenant_cfg.path_prefix.clone(),
            backends: tenant_cfg
                .backends
                .iter()
                .map(|b| b.name.clone())
                .collect(),
            alive,
            total,
        });
    }

    json_response(StatusCode::OK, entries)
}

/// `GET {admin_base_path}/tenants/{name}/health`: per-tenant detail (§4.10).
/// 404 when `name` isn't a configured tenant.
pub async fn tenant_health(gateway: &GatewayService, tenant_name: &str) -> Response<AxumBody> {
    match gateway.tenant_health(tenant_name).await {
        Some((alive, total)) => json_response(
            StatusCode::OK,
            TenantHealthSummary {
                name: tenant_name.to_string(),
                alive,
                total,
                healthy: alive > 0,
            },
        ),
        None => not_found(&format!("no such tenant: {tenant_name}")),
    }
}
