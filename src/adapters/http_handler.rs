//! Request entrypoint (§4.4, §4.8, §4.9, §4.10): the single place every
//! inbound request passes through. Order of operations:
//!
//! 1. `/metrics` and `{admin_base_path}/*` are served directly and never
//!    reach tenant resolution or scripts (§4.10).
//! 2. The request is resolved to a tenant (§4.3); an unresolved `(host,
//!    path)` is a 404.
//! 3. The request is validated against the tenant's (or the gateway's
//!    default) request limits (§4.4).
//! 4. If the tenant's script router claims the (stripped) path under any
//!    method, the body is buffered and the request is dispatched through
//!    [`scripting::binding::dispatch`] (§4.8); otherwise the original,
//!    still-streaming request is forwarded straight to the proxy director
//!    with no buffering at all.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, header};
use tracing::Instrument;

use crate::core::GatewayService;
use crate::core::route_resolver::strip_prefix;
use crate::ports::http_client::HttpClient;
use crate::ports::http_server::{HandlerError, HttpHandler as HttpHandlerPort};
use crate::scripting::binding::{DispatchOutcome, dispatch};
use crate::scripting::context::{RequestContext, ScriptError};
use crate::utils::connection_tracker::ConnectionInfo;

use super::admin;
use super::proxy::{self, ValidationFailure, validate_request};

/// Wires tenant resolution, script dispatch, and plain proxying behind one
/// [`HttpHandlerPort`] implementation, plus the admin and metrics surfaces
/// that are served directly rather than routed to a tenant.
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>, http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            gateway,
            http_client,
        }
    }

    async fn handle(&self, req: Request<AxumBody>) -> Result<Response<AxumBody>, HandlerError> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let path = uri.path().to_string();

        if path == "/metrics" {
            return Ok(metrics_response());
        }

        let config = self.gateway.config();
        if path == config.admin_base_path
            || path.starts_with(&format!("{}/", config.admin_base_path))
        {
            return Ok(self.handle_admin(&config.admin_base_path, &path).await);
        }

        let host = request_host(&req);
        let Some(resolved) = self.gateway.resolve(&host, &path) else {
            return Ok(plain_text_response(
                StatusCode::NOT_FOUND,
                &format!("no tenant matches host '{host}' path '{path}'"),
            ));
        };

        let Some(tenant) = self.gateway.tenant(&resolved.tenant_name).await else {
            return Ok(plain_text_response(
                StatusCode::NOT_FOUND,
                &format!("tenant '{}' is no longer configured", resolved.tenant_name),
            ));
        };

        let limits = tenant.config.request_limits.unwrap_or(config.request_limits);

        if let Err(failure) = validate_request(&req, &limits) {
            return Ok(match failure {
                ValidationFailure::Url(reason) => {
                    plain_text_response(StatusCode::NOT_FOUND, &reason)
                }
                ValidationFailure::Header(reason) => {
                    plain_text_response(StatusCode::BAD_REQUEST, &reason)
                }
            });
        }

        if let Some(reason) = &tenant.unavailable {
            return Ok(plain_text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("tenant '{}' is unavailable: {reason}", resolved.tenant_name),
            ));
        }

        let remote_addr = remote_addr_string(&req);
        let stripped_path = strip_prefix(&path, &resolved.path_strip_prefix);
        let snapshot = tenant.scripts.snapshot();

        if !snapshot.has_any_route_for(&stripped_path) {
            return proxy::proxy_request(
                &self.gateway,
                self.http_client.as_ref(),
                &resolved.tenant_name,
                &resolved.path_strip_prefix,
                &remote_addr,
                config.server.upstream_timeout_secs,
                req,
            )
            .await;
        }

        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|err| HandlerError::InternalError(err.to_string()))?;

        if body_bytes.len() > limits.max_body_bytes {
            return Ok(plain_text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!(
                    "request body of {} bytes exceeds the {}-byte limit",
                    body_bytes.len(),
                    limits.max_body_bytes
                ),
            ));
        }

        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let query: Vec<(String, String)> =
            url::form_urlencoded::parse(parts.uri.query().unwrap_or_default().as_bytes())
                .into_owned()
                .collect();

        let ctx = RequestContext::new(
            method.as_str().to_string(),
            stripped_path,
            host,
            remote_addr.clone(),
            headers,
            query,
            std::collections::HashMap::new(),
            Some(body_bytes.to_vec()),
            limits.max_body_bytes,
            tokio_util::sync::CancellationToken::new(),
        );

        match dispatch(&tenant.scripts, method.as_str(), ctx).await {
            Ok(DispatchOutcome::Handled(resp)) => Ok(response_from_accumulator(resp)),
            Ok(DispatchOutcome::NotScriptRouted) | Ok(DispatchOutcome::MethodNotAllowed) => {
                let rebuilt = rebuild_request(parts, body_bytes);
                proxy::proxy_request(
                    &self.gateway,
                    self.http_client.as_ref(),
                    &resolved.tenant_name,
                    &resolved.path_strip_prefix,
                    &remote_addr,
                    config.server.upstream_timeout_secs,
                    rebuilt,
                )
                .await
            }
            Err(err) => {
                tracing::warn!(tenant = %resolved.tenant_name, error = %err, "script dispatch failed");
                Ok(response_for_script_error(&err))
            }
        }
    }

    async fn handle_admin(&self, admin_base_path: &str, path: &str) -> Response<AxumBody> {
        if path == format!("{admin_base_path}/health") {
            return admin::gateway_health(&self.gateway).await;
        }
        if path == format!("{admin_base_path}/tenants") {
            return admin::list_tenants(&self.gateway).await;
        }
        let tenants_prefix = format!("{admin_base_path}/tenants/");
        if let Some(rest) = path.strip_prefix(&tenants_prefix) {
            if let Some(tenant_name) = rest.strip_suffix("/health") {
                return admin::tenant_health(&self.gateway, tenant_name).await;
            }
        }
        plain_text_response(
            StatusCode::NOT_FOUND,
            &format!("no such admin route: {path}"),
        )
    }
}

impl HttpHandlerPort for HttpHandler {
    async fn handle_request(
        &self,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, HandlerError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = crate::tracing_setup::create_request_span(method.as_str(), &path, &request_id, "", "");

        let _timer = crate::metrics::RequestTimer::new(&path, method.as_str());
        let _connection_guard = req
            .extensions()
            .get::<Arc<ConnectionInfo>>()
            .cloned()
            .map(RequestGuard::new);

        let result = self.handle(req).instrument(span.clone()).await;

        let status = match &result {
            Ok(resp) => resp.status().as_u16(),
            Err(_) => 500,
        };
        span.record("http.status_code", status);
        crate::metrics::increment_request_total(&path, method.as_str(), status);

        result
    }
}

/// Decrements a connection's active-request count when a request finishes,
/// however it finishes (§4.9 shutdown drains on this count).
struct RequestGuard(Arc<ConnectionInfo>);

impl RequestGuard {
    fn new(info: Arc<ConnectionInfo>) -> Self {
        info.increment_requests();
        Self(info)
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.decrement_requests();
    }
}

fn request_host(req: &Request<AxumBody>) -> String {
    if let Some(host) = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        return host.to_string();
    }
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default()
}

fn remote_addr_string(req: &Request<AxumBody>) -> String {
    if let Some(info) = req.extensions().get::<Arc<ConnectionInfo>>() {
        return info.remote_addr.to_string();
    }
    req.extensions()
        .get::<SocketAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn rebuild_request(parts: hyper::http::request::Parts, body: Bytes) -> Request<AxumBody> {
    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(parts.uri.clone())
        .version(parts.version);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    let mut req = builder
        .body(AxumBody::from(body))
        .expect("rebuilt request from previously-valid parts is always constructible");
    *req.extensions_mut() = parts.extensions;
    req
}

fn response_from_accumulator(
    resp: crate::scripting::context::ResponseAccumulator,
) -> Response<AxumBody> {
    let mut builder = Response::builder().status(resp.status);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(AxumBody::from(resp.body))
        .unwrap_or_else(|_| internal_error_response())
}

fn response_for_script_error(err: &ScriptError) -> Response<AxumBody> {
    match err {
        ScriptError::PayloadTooLarge { actual, limit } => plain_text_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("request body of {actual} bytes exceeds the {limit}-byte limit"),
        ),
        ScriptError::Cancelled => {
            plain_text_response(StatusCode::GATEWAY_TIMEOUT, "request cancelled")
        }
        ScriptError::Runtime(_) | ScriptError::Compile(_) | ScriptError::Configuration(_) => {
            plain_text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal script error")
        }
    }
}

/// Renders a [`HandlerError`] the entrypoint propagated rather than
/// converted to a response itself; used by the binary's outer server loop.
pub fn error_response(err: &HandlerError) -> Response<AxumBody> {
    let (status, message) = match err {
        HandlerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
        HandlerError::RequestError(m) => (StatusCode::BAD_REQUEST, m.clone()),
        HandlerError::BadGateway(m) => (StatusCode::BAD_GATEWAY, m.clone()),
        HandlerError::GatewayTimeout(m) => (StatusCode::GATEWAY_TIMEOUT, m.clone()),
        HandlerError::InternalError(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
    };
    plain_text_response(status, &message)
}

fn plain_text_response(status: StatusCode, message: &str) -> Response<AxumBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(AxumBody::from(message.to_string()))
        .unwrap_or_else(|_| internal_error_response())
}

fn internal_error_response() -> Response<AxumBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(AxumBody::empty())
        .expect("bare 500 response is always constructible")
}

/// Minimal Prometheus text exposition (ambient stack). The `metrics` crate
/// facade's macros are write-only without a concrete exporter installed, so
/// this only re-exports the backend health gauges kept in
/// [`crate::metrics::get_current_metrics`] rather than a full scrape of
/// every family; a production deployment would layer a real exporter (e.g.
/// `metrics-exporter-prometheus`) on top instead (see DESIGN.md).
fn metrics_response() -> Response<AxumBody> {
    let mut body = String::new();
    body.push_str(
        "# HELP keystone_backend_health_status Health status of individual backends (1 healthy, 0 unhealthy)\n",
    );
    body.push_str("# TYPE keystone_backend_health_status gauge\n");
    for (key, value) in crate::metrics::get_current_metrics() {
        if let Some(backend) = key.strip_prefix("backend_health_") {
            body.push_str(&format!(
                "keystone_backend_health_status{{backend=\"{backend}\"}} {value}\n"
            ));
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(AxumBody::from(body))
        .unwrap_or_else(|_| internal_error_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::HttpClientAdapter;
    use crate::config::{BackendConfig, GatewayConfig, TenantConfig};

    fn client() -> Arc<dyn HttpClient> {
        Arc::new(HttpClientAdapter::new().unwrap())
    }

    async fn handler_with(config: GatewayConfig) -> HttpHandler {
        let gateway = Arc::new(GatewayService::new(config, client()).await);
        HttpHandler::new(gateway, client())
    }

    fn config_with_script_tenant(script_dir: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            tenants: vec![TenantConfig {
                name: "acme".into(),
                domains: vec![],
                path_prefix: Some("/api/".into()),
                script_dir: Some(script_dir.to_str().unwrap().to_string()),
                health_interval_seconds: 10,
                backends: vec![BackendConfig {
                    name: "primary".into(),
                    url: "http://backend.invalid".into(),
                    health_path: "/health".into(),
                }],
                request_limits: None,
                max_script_instances: 2,
            }],
            ..Default::default()
        }
    }

    fn request(method: &str, uri: &str) -> Request<AxumBody> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, "anyhost")
            .body(AxumBody::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn script_route_is_dispatched_and_bypasses_proxy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("routes.lua"),
            "register_route('get', '/hello', function(req, res) res:write('hi') end)",
        )
        .unwrap();
        let handler = handler_with(config_with_script_tenant(dir.path())).await;

        let resp = handler
            .handle_request(request("GET", "/api/hello"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unresolved_host_and_path_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(config_with_script_tenant(dir.path())).await;

        let resp = handler.handle_request(request("GET", "/nowhere")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_health_is_served_without_tenant_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(config_with_script_tenant(dir.path())).await;

        let resp = handler
            .handle_request(request("GET", "/admin/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_endpoint_is_always_available() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(config_with_script_tenant(dir.path())).await;

        let resp = handler.handle_request(request("GET", "/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unclaimed_path_falls_through_to_proxy_and_gets_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("routes.lua"),
            "register_route('get', '/hello', function(req, res) end)",
        )
        .unwrap();
        let handler = handler_with(config_with_script_tenant(dir.path())).await;

        let resp = handler
            .handle_request(request("GET", "/api/unclaimed"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
