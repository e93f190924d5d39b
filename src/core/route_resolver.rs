//! Maps an incoming request's `(host, path)` to a tenant and the path prefix
//! to strip before forwarding (§4.3).
use crate::config::{TenantConfig, TenantSelector};

/// The outcome of resolving a request to a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub tenant_name: String,
    pub path_strip_prefix: String,
}

fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// Resolves `(host, path)` against the configured tenants, in priority order:
/// hybrid (domains + path_prefix) > host-only > path-only. Ties within a
/// priority class are broken by configuration order.
pub fn resolve<'a>(tenants: &'a [TenantConfig], host: &str, path: &str) -> Option<&'a TenantConfig> {
    let host = normalize_host(host);

    for tenant in tenants {
        if let TenantSelector::Hybrid {
            domains,
            path_prefix,
        } = tenant.selector()
        {
            if domains.iter().any(|d| d.eq_ignore_ascii_case(&host)) && path.starts_with(&path_prefix)
            {
                return Some(tenant);
            }
        }
    }

    for tenant in tenants {
        if let TenantSelector::HostOnly { domains } = tenant.selector() {
            if domains.iter().any(|d| d.eq_ignore_ascii_case(&host)) {
                return Some(tenant);
            }
        }
    }

    for tenant in tenants {
        if let TenantSelector::PathOnly { path_prefix } = tenant.selector() {
            if path.starts_with(&path_prefix) {
                return Some(tenant);
            }
        }
    }

    None
}

/// Builds the full [`ResolvedRoute`] (tenant name + strip prefix) for a match.
pub fn resolve_route(tenants: &[TenantConfig], host: &str, path: &str) -> Option<ResolvedRoute> {
    let tenant = resolve(tenants, host, path)?;
    let path_strip_prefix = match tenant.selector() {
        TenantSelector::Hybrid { path_prefix, .. } => path_prefix,
        TenantSelector::HostOnly { .. } => String::new(),
        TenantSelector::PathOnly { path_prefix } => path_prefix,
    };
    Some(ResolvedRoute {
        tenant_name: tenant.name.clone(),
        path_strip_prefix,
    })
}

/// Strips `prefix` from `path`, returning `/` if nothing remains.
pub fn strip_prefix(path: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{rest}"),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn tenant(name: &str, domains: Vec<&str>, path_prefix: Option<&str>) -> TenantConfig {
        TenantConfig {
            name: name.into(),
            domains: domains.into_iter().map(String::from).collect(),
            path_prefix: path_prefix.map(String::from),
            script_dir: None,
            health_interval_seconds: 10,
            backends: vec![BackendConfig {
                name: "b".into(),
                url: "http://b".into(),
                health_path: "/health".into(),
            }],
            request_limits: None,
            max_script_instances: 8,
        }
    }

    #[test]
    fn path_based_routing_matches() {
        let tenants = vec![tenant("api", vec![], Some("/api/"))];
        let resolved = resolve_route(&tenants, "anyhost", "/api/foo").unwrap();
        assert_eq!(resolved.tenant_name, "api");
        assert_eq!(resolved.path_strip_prefix, "/api/");
        assert_eq!(strip_prefix("/api/foo", &resolved.path_strip_prefix), "/foo");
    }

    #[test]
    fn host_based_routing_matches_case_insensitively() {
        let tenants = vec![tenant("svc", vec!["svc.example.com"], None)];
        let resolved = resolve_route(&tenants, "SVC.Example.COM:8080", "/x").unwrap();
        assert_eq!(resolved.tenant_name, "svc");
        assert_eq!(resolved.path_strip_prefix, "");
    }

    #[test]
    fn hybrid_takes_priority_over_host_only_and_path_only() {
        let tenants = vec![
            tenant("host-only", vec!["shared.example.com"], None),
            tenant("path-only", vec![], Some("/shared/")),
            tenant(
                "hybrid",
                vec!["shared.example.com"],
                Some("/shared/"),
            ),
        ];
        let resolved = resolve_route(&tenants, "shared.example.com", "/shared/x").unwrap();
        assert_eq!(resolved.tenant_name, "hybrid");
    }

    #[test]
    fn no_match_returns_none() {
        let tenants = vec![tenant("api", vec![], Some("/api/"))];
        assert!(resolve_route(&tenants, "anyhost", "/other").is_none());
    }

    #[test]
    fn ties_within_priority_class_use_config_order() {
        let tenants = vec![
            tenant("first", vec![], Some("/api/")),
            tenant("second", vec![], Some("/api/")),
        ];
        let resolved = resolve_route(&tenants, "anyhost", "/api/x").unwrap();
        assert_eq!(resolved.tenant_name, "first");
    }
}
