//! Request Validation and Proxy Director (§4.4): rejects malformed requests
//! before they reach a tenant, then plain-proxies anything a tenant's script
//! set doesn't claim to the tenant's next healthy backend.
use std::time::Duration;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, StatusCode, header};

use crate::config::RequestLimits;
use crate::core::GatewayService;
use crate::ports::http_client::HttpClient;
use crate::ports::http_server::HandlerError;

/// Why a request was rejected before routing (§4.4). The two cases map to
/// different HTTP statuses: an oversized or NUL-containing URL is treated as
/// unroutable (404), a malformed header is a client error (400).
#[derive(Debug, PartialEq, Eq)]
pub enum ValidationFailure {
    Url(String),
    Header(String),
}

/// Rejects a request outright before any routing or proxying is attempted
/// (§4.4): embedded NULs in header values, an oversized URL, or an oversized
/// header block are all treated as malformed rather than forwarded.
pub fn validate_request(
    req: &Request<AxumBody>,
    limits: &RequestLimits,
) -> Result<(), ValidationFailure> {
    let uri = req.uri().to_string();
    if uri.len() > limits.max_url_bytes {
        return Err(ValidationFailure::Url(format!(
            "request URI of {} bytes exceeds the {}-byte limit",
            uri.len(),
            limits.max_url_bytes
        )));
    }
    if uri.as_bytes().contains(&0) {
        return Err(ValidationFailure::Url(
            "request URI contains a NUL byte".to_string(),
        ));
    }

    let mut header_bytes = 0usize;
    for (name, value) in req.headers() {
        header_bytes += name.as_str().len() + value.len();
        if value.as_bytes().contains(&0) {
            return Err(ValidationFailure::Header(format!(
                "header '{name}' contains a NUL byte"
            )));
        }
    }
    if header_bytes > limits.max_header_bytes {
        return Err(ValidationFailure::Header(format!(
            "request headers total {header_bytes} bytes, exceeding the {}-byte limit",
            limits.max_header_bytes
        )));
    }

    Ok(())
}

/// Strips `prefix` from the front of `path` if present; otherwise leaves the
/// path untouched (a host-only tenant has an empty strip prefix, §4.3).
fn strip_prefix(path: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{rest}"),
        None => path.to_string(),
    }
}

/// Proxies one request to `tenant_name`'s next healthy backend (§4.2 round
/// robin selection, §4.4 forwarding). Returns 502 with a tenant-identifying
/// body on transport failure or an empty/all-unhealthy backend pool; never
/// retries against a second backend.
pub async fn proxy_request(
    gateway: &GatewayService,
    http_client: &dyn HttpClient,
    tenant_name: &str,
    strip: &str,
    remote_addr: &str,
    upstream_timeout_secs: u64,
    mut req: Request<AxumBody>,
) -> Result<Response<AxumBody>, HandlerError> {
    let Some(selected) = gateway.select_backend(tenant_name).await else {
        return Ok(bad_gateway(tenant_name, "no healthy backend available"));
    };

    let original_path = req.uri().path().to_string();
    let stripped = strip_prefix(&original_path, strip);
    let query = req
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let upstream_uri = format!("{}{}{}", selected.url, stripped, query);

    *req.uri_mut() = upstream_uri
        .parse()
        .map_err(|err| HandlerError::BadRequest(format!("invalid upstream URI: {err}")))?;

    inject_forwarded_headers(&mut req, remote_addr);

    let timeout = Duration::from_secs(upstream_timeout_secs);
    match tokio::time::timeout(timeout, http_client.send_request(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => {
            tracing::warn!(tenant = tenant_name, backend = %selected.name, error = %err, "backend request failed");
            Ok(bad_gateway(
                tenant_name,
                &format!("backend '{}' request failed: {err}", selected.name),
            ))
        }
        Err(_) => {
            tracing::warn!(tenant = tenant_name, backend = %selected.name, "backend request timed out");
            Ok(bad_gateway(
                tenant_name,
                &format!("backend '{}' timed out", selected.name),
            ))
        }
    }
}

fn inject_forwarded_headers(req: &mut Request<AxumBody>, remote_addr: &str) {
    let headers = req.headers_mut();

    let existing_for = headers
        .get(header::HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let forwarded_for = match existing_for {
        Some(prior) => format!("{prior}, {remote_addr}"),
        None => remote_addr.to_string(),
    };
    if let Ok(value) = header::HeaderValue::from_str(&forwarded_for) {
        headers.insert(header::HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Ok(value) = header::HeaderValue::from_str(remote_addr) {
        headers.insert(header::HeaderName::from_static("x-real-ip"), value);
    }
    headers.insert(
        header::HeaderName::from_static("x-forwarded-proto"),
        header::HeaderValue::from_static("http"),
    );
}

fn bad_gateway(tenant_name: &str, reason: &str) -> Response<AxumBody> {
    let body = format!("502 Bad Gateway: tenant '{tenant_name}': {reason}");
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(AxumBody::from(Bytes::from(body)))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(AxumBody::empty())
                .expect("bare 502 response is always constructible")
        })
}

/// Collects a proxied response's body to bytes, used where the caller needs
/// to re-wrap the response (e.g. to add gateway-level headers).
pub async fn collect_body(body: AxumBody) -> Result<Bytes, HandlerError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| HandlerError::InternalError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RequestLimits {
        RequestLimits {
            max_body_bytes: 1024,
            max_header_bytes: 256,
            max_url_bytes: 64,
        }
    }

    fn request(uri: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(uri)
            .body(AxumBody::empty())
            .unwrap()
    }

    #[test]
    fn rejects_oversized_uri() {
        let long_path = format!("/{}", "a".repeat(100));
        let req = request(&long_path);
        assert!(validate_request(&req, &limits()).is_err());
    }

    #[test]
    fn accepts_well_formed_request() {
        let req = request("/hello");
        assert!(validate_request(&req, &limits()).is_ok());
    }

    #[test]
    fn rejects_nul_byte_in_header_value() {
        let mut req = request("/hello");
        req.headers_mut().insert(
            header::HeaderName::from_static("x-test"),
            header::HeaderValue::from_bytes(b"a\0b").unwrap(),
        );
        assert!(validate_request(&req, &limits()).is_err());
    }

    #[test]
    fn strip_prefix_removes_matching_prefix() {
        assert_eq!(strip_prefix("/api/widgets", "/api/"), "/widgets");
        assert_eq!(strip_prefix("/api", "/api/"), "/api");
        assert_eq!(strip_prefix("/other", "/api/"), "/other");
        assert_eq!(strip_prefix("/any", ""), "/any");
    }

    #[test]
    fn forwarded_headers_are_injected() {
        let mut req = request("/hello");
        inject_forwarded_headers(&mut req, "10.0.0.5");
        assert_eq!(
            req.headers().get("x-forwarded-for").unwrap(),
            "10.0.0.5"
        );
        assert_eq!(req.headers().get("x-real-ip").unwrap(), "10.0.0.5");
        assert_eq!(req.headers().get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut req = request("/hello");
        req.headers_mut().insert(
            header::HeaderName::from_static("x-forwarded-for"),
            header::HeaderValue::from_static("1.2.3.4"),
        );
        inject_forwarded_headers(&mut req, "5.6.7.8");
        assert_eq!(
            req.headers().get("x-forwarded-for").unwrap(),
            "1.2.3.4, 5.6.7.8"
        );
    }
}
