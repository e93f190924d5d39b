//! Core gateway orchestration: holds the tenant table (backends + their
//! health + round-robin state) and the currently active [`GatewayConfig`].
//!
//! This layer deliberately avoids HTTP I/O; it exposes lookups and backend
//! selection that the adapters (proxy director, health checker, admin
//! surface) drive.
use std::sync::Arc;

use arc_swap::ArcSwap;
use scc::HashMap;

use crate::config::{GatewayConfig, TenantConfig};
use crate::core::{
    backend::{Backend, BackendUrl},
    route_resolver::{self, ResolvedRoute},
    tenant_router::TenantRouter,
};
use crate::ports::http_client::HttpClient;
use crate::scripting::compiler::PrototypeCache;
use crate::scripting::script_set::ScriptSet;

/// Runtime state for one configured tenant: its backends (with health), its
/// round-robin cursor, and its loaded script set. Immutable after
/// construction except for the backends' own atomic health fields and the
/// script set's internal router snapshot swap.
pub struct TenantRuntime {
    pub config: TenantConfig,
    pub backends: Vec<Backend>,
    pub router: TenantRouter,
    pub scripts: Arc<ScriptSet>,
    /// Set when the tenant's scripts failed to load or compile (§7): the
    /// tenant stays registered so its backends still count toward gateway
    /// health, but every request against it gets a 503 rather than being
    /// dispatched to a broken script set or silently proxied.
    pub unavailable: Option<String>,
}

impl TenantRuntime {
    async fn new(
        config: TenantConfig,
        prototypes: &PrototypeCache,
        http_client: Arc<dyn HttpClient>,
        outbound_timeout_secs: u64,
    ) -> Self {
        let backends = config
            .backends
            .iter()
            .filter_map(|b| match BackendUrl::new(&b.url) {
                Ok(url) => Some(Backend::new(b.name.clone(), url, b.health_path.clone())),
                Err(err) => {
                    tracing::error!(backend = %b.name, error = %err, "skipping backend with invalid url");
                    None
                }
            })
            .collect();

        let (scripts, unavailable) = match ScriptSet::load(
            config.script_dir.as_deref(),
            prototypes,
            http_client,
            outbound_timeout_secs,
            config.max_script_instances,
        )
        .await
        {
            Ok(set) => (Arc::new(set), None),
            Err(err) => {
                tracing::error!(
                    tenant = %config.name,
                    error = %err,
                    "failed to load tenant scripts; tenant marked unavailable"
                );
                (Arc::new(ScriptSet::empty()), Some(err.to_string()))
            }
        };

        Self {
            config,
            backends,
            router: TenantRouter::new(),
            scripts,
            unavailable,
        }
    }

    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }
}

/// A backend chosen for a single proxied request; detached from the
/// `TenantRuntime` borrow so it can outlive the lookup.
#[derive(Debug, Clone)]
pub struct SelectedBackend {
    pub name: String,
    pub url: String,
}

/// Central orchestrator for tenant lookup, backend selection, and
/// configuration access. Cheap to clone (wraps `Arc`s internally); intended
/// to be shared behind a single `Arc<GatewayService>`.
pub struct GatewayService {
    config: ArcSwap<GatewayConfig>,
    tenants: Arc<HashMap<String, Arc<TenantRuntime>>>,
    prototypes: Arc<PrototypeCache>,
    http_client: Arc<dyn HttpClient>,
}

impl GatewayService {
    /// Build a gateway service from an already-validated configuration,
    /// loading every tenant's scripts eagerly (§4.9 startup). A tenant whose
    /// scripts fail to load is still registered, just marked unavailable
    /// (§7) rather than aborting the whole gateway.
    pub async fn new(config: GatewayConfig, http_client: Arc<dyn HttpClient>) -> Self {
        let tenants = Arc::new(HashMap::new());
        let prototypes = Arc::new(PrototypeCache::new());
        let outbound_timeout_secs = config.server.outbound_timeout_secs;

        for tenant_cfg in &config.tenants {
            let runtime = Arc::new(
                TenantRuntime::new(
                    tenant_cfg.clone(),
                    &prototypes,
                    http_client.clone(),
                    outbound_timeout_secs,
                )
                .await,
            );
            let name = tenant_cfg.name.clone();
            let _ = tenants.insert_async(name, runtime).await;
        }

        Self {
            config: ArcSwap::from_pointee(config),
            tenants,
            prototypes,
            http_client,
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration and tenant table wholesale, used by
    /// the hot-reload path (§4.9). Existing `Arc<TenantRuntime>` handles held
    /// by in-flight requests remain valid; new requests see the new table.
    /// The prototype cache is reused across reload so scripts whose source
    /// hasn't changed are not recompiled (§4.5).
    pub async fn reload(&self, config: GatewayConfig) {
        let outbound_timeout_secs = config.server.outbound_timeout_secs;
        for tenant_cfg in &config.tenants {
            let runtime = Arc::new(
                TenantRuntime::new(
                    tenant_cfg.clone(),
                    &self.prototypes,
                    self.http_client.clone(),
                    outbound_timeout_secs,
                )
                .await,
            );
            self.tenants
                .upsert_async(tenant_cfg.name.clone(), runtime)
                .await;
        }

        let new_names: std::collections::HashSet<&str> =
            config.tenants.iter().map(|t| t.name.as_str()).collect();
        let mut stale = Vec::new();
        self.tenants.scan_async(|name, _| {
            if !new_names.contains(name.as_str()) {
                stale.push(name.clone());
            }
        }).await;
        for name in stale {
            self.tenants.remove_async(&name).await;
        }

        self.config.store(Arc::new(config));
    }

    pub async fn tenant(&self, name: &str) -> Option<Arc<TenantRuntime>> {
        self.tenants
            .get_async(name)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Resolve `(host, path)` to a tenant and the prefix to strip (§4.3).
    pub fn resolve(&self, host: &str, path: &str) -> Option<ResolvedRoute> {
        route_resolver::resolve_route(&self.config.load().tenants, host, path)
    }

    /// Select the next alive backend for a tenant via round-robin (§4.2).
    pub async fn select_backend(&self, tenant_name: &str) -> Option<SelectedBackend> {
        let runtime = self.tenant(tenant_name).await?;
        let chosen = runtime.router.next_backend(&runtime.backends)?;
        Some(SelectedBackend {
            name: chosen.name.clone(),
            url: chosen.url.as_str().to_string(),
        })
    }

    /// `(alive, total)` backend counts for a tenant.
    pub async fn tenant_health(&self, tenant_name: &str) -> Option<(usize, usize)> {
        let runtime = self.tenant(tenant_name).await?;
        Some((runtime.alive_count(), runtime.backends.len()))
    }

    /// `(tenant_name, alive, total)` for every configured tenant, in
    /// configuration order, for the admin surface (§4.10).
    pub async fn all_tenant_health(&self) -> Vec<(String, usize, usize)> {
        let mut out = Vec::new();
        for tenant_cfg in &self.config.load().tenants {
            if let Some((alive, total)) = self.tenant_health(&tenant_cfg.name).await {
                out.push((tenant_cfg.name.clone(), alive, total));
            }
        }
        out
    }

    pub fn tenant_names(&self) -> Vec<String> {
        self.config
            .load()
            .tenants
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::http_client::HttpClientAdapter;
    use crate::config::BackendConfig;

    fn client() -> Arc<dyn HttpClient> {
        Arc::new(HttpClientAdapter::new().unwrap())
    }

    fn sample_config() -> GatewayConfig {
        GatewayConfig {
            tenants: vec![TenantConfig {
                name: "api".into(),
                domains: vec![],
                path_prefix: Some("/api/".into()),
                script_dir: None,
                health_interval_seconds: 10,
                backends: vec![BackendConfig {
                    name: "primary".into(),
                    url: "http://backend:8080".into(),
                    health_path: "/health".into(),
                }],
                request_limits: None,
                max_script_instances: 8,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolves_and_reports_zero_alive_backends_initially() {
        let service = GatewayService::new(sample_config(), client()).await;
        let resolved = service.resolve("anyhost", "/api/foo").unwrap();
        assert_eq!(resolved.tenant_name, "api");

        let (alive, total) = service.tenant_health("api").await.unwrap();
        assert_eq!(alive, 0);
        assert_eq!(total, 1);

        assert!(service.select_backend("api").await.is_none());
    }

    #[tokio::test]
    async fn select_backend_returns_selected_after_marked_healthy() {
        let service = GatewayService::new(sample_config(), client()).await;
        let runtime = service.tenant("api").await.unwrap();
        runtime.backends[0].health.mark_healthy();

        let selected = service.select_backend("api").await.unwrap();
        assert_eq!(selected.name, "primary");
    }

    #[tokio::test]
    async fn unknown_tenant_returns_none() {
        let service = GatewayService::new(sample_config(), client()).await;
        assert!(service.tenant("missing").await.is_none());
        assert!(service.select_backend("missing").await.is_none());
    }
}
