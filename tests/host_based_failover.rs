//! Seed scenario 2 (spec §8): a host-matched tenant with two healthy
//! backends round-robins between them, then fails over once one backend is
//! marked unhealthy, and finally returns 502 once both are unhealthy.
use std::sync::Arc;

use axum::body::Body as AxumBody;
use axum::response::Response as AxumResponse;
use axum::routing::get;
use hyper::{Request, StatusCode, header};
use keystone_gateway::adapters::{HttpClientAdapter, HttpHandler};
use keystone_gateway::config::{BackendConfig, GatewayConfig, TenantConfig};
use keystone_gateway::core::GatewayService;
use keystone_gateway::ports::http_client::HttpClient;
use keystone_gateway::ports::http_server::HttpHandler as _;
use tokio::net::TcpListener;

async fn spawn_identifying_backend(identity: &'static str) -> String {
    let app = axum::Router::new().route(
        "/x",
        get(move || async move { AxumResponse::new(AxumBody::from(identity)) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> Arc<dyn HttpClient> {
    Arc::new(HttpClientAdapter::new().unwrap())
}

async fn request_and_read_body(handler: &HttpHandler) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri("/x")
        .header(header::HOST, "svc.example.com")
        .body(AxumBody::empty())
        .unwrap();
    let resp = handler.handle_request(req).await.unwrap();
    let status = resp.status();
    let body = http_body_util::BodyExt::collect(resp.into_body())
        .await
        .unwrap()
        .to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn round_robins_then_fails_over_then_502s_once_all_unhealthy() {
    let b1_url = spawn_identifying_backend("B1").await;
    let b2_url = spawn_identifying_backend("B2").await;

    let config = GatewayConfig {
        tenants: vec![TenantConfig {
            name: "svc".into(),
            domains: vec!["svc.example.com".into()],
            path_prefix: None,
            script_dir: None,
            health_interval_seconds: 10,
            backends: vec![
                BackendConfig {
                    name: "b1".into(),
                    url: b1_url,
                    health_path: "/health".into(),
                },
                BackendConfig {
                    name: "b2".into(),
                    url: b2_url,
                    health_path: "/health".into(),
                },
            ],
            request_limits: None,
            max_script_instances: 4,
        }],
        ..Default::default()
    };

    let gateway = Arc::new(GatewayService::new(config, client()).await);
    let runtime = gateway.tenant("svc").await.unwrap();
    runtime.backends[0].health.mark_healthy();
    runtime.backends[1].health.mark_healthy();
    let handler = HttpHandler::new(gateway.clone(), client());

    // Four sequential requests visit both backends in round-robin order.
    let mut seen = Vec::new();
    for _ in 0..4 {
        let (status, body) = request_and_read_body(&handler).await;
        assert_eq!(status, StatusCode::OK);
        seen.push(body);
    }
    assert_eq!(seen[0], seen[2]);
    assert_eq!(seen[1], seen[3]);
    assert_ne!(seen[0], seen[1]);

    // Mark b1 unhealthy: every subsequent request fails over to b2.
    runtime.backends[0].health.mark_unhealthy();
    for _ in 0..2 {
        let (status, body) = request_and_read_body(&handler).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "B2");
    }

    // Mark b2 unhealthy too: the tenant has no alive backend left.
    runtime.backends[1].health.mark_unhealthy();
    let (status, _) = request_and_read_body(&handler).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}
