//! Per-tenant compiled router snapshot (§3 "Router Snapshot", §4.8).
//!
//! Built once from a script set's pending registrations after the
//! registration instance finishes executing tenant scripts, then held behind
//! an [`arc_swap::ArcSwap`] by the owning [`crate::core::gateway::TenantRuntime`]
//! so reload can swap in a fresh snapshot atomically (§5 "Router snapshot:
//! read-only after construction; swap is via an atomic pointer exchange").
//!
//! A request path that matches no script route is not a 404 by itself: the
//! proxy director (`adapters::proxy`) falls through to plain reverse-proxying
//! against the tenant's backend pool for anything the router snapshot
//! doesn't claim. Only the script-registered surface lives here.
use std::collections::HashMap;

use matchit::Router as MatchitRouter;
use thiserror::Error;

use crate::scripting::primitives::{ErrorHandlerKind, PendingRegistration};

#[derive(Debug, Error)]
pub enum RouterBuildError {
    #[error("invalid route pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// One registered middleware, in declaration order. `pattern = None` means
/// global (applies to every script route); `Some(prefix)` scopes it to paths
/// starting with that prefix (§9 Open Questions: both styles are supported).
struct MiddlewareEntry {
    pattern: Option<String>,
    callback_id: u64,
}

/// Outcome of matching a request against a tenant's router snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    Matched {
        callback_id: u64,
        params: HashMap<String, String>,
    },
    /// No script route claims this path at all.
    NotFound,
    /// Some other method matches this exact path.
    MethodNotAllowed,
}

/// Translates the spec's `{name:.*}` catch-all wildcard syntax into
/// `matchit`'s native `{*name}` syntax; `{name}` single-segment params need
/// no translation since `matchit` already uses that form.
fn translate_pattern(pattern: &str) -> String {
    if let Some(suffix_idx) = pattern.find(":.*}") {
        if let Some(open_idx) = pattern[..suffix_idx].rfind('{') {
            let name = &pattern[open_idx + 1..suffix_idx];
            return format!(
                "{}{{*{}}}{}",
                &pattern[..open_idx],
                name,
                &pattern[suffix_idx + 4..]
            );
        }
    }
    pattern.to_string()
}

/// Immutable, read-only-at-serving-time routing table for one tenant's
/// script set (§4.8, §5). Constructed once per registration pass / reload.
#[derive(Default)]
pub struct RouterSnapshot {
    methods: HashMap<String, MatchitRouter<u64>>,
    middlewares: Vec<MiddlewareEntry>,
    error_handlers: HashMap<ErrorHandlerKind, u64>,
}

impl RouterSnapshot {
    /// Walks the pending registration list produced by the registration
    /// instance (§4.6, §4.8) and installs routes, middleware, and error
    /// handlers into a fresh snapshot.
    pub fn build(pending: &[PendingRegistration]) -> Result<Self, RouterBuildError> {
        let mut methods: HashMap<String, MatchitRouter<u64>> = HashMap::new();
        let mut middlewares = Vec::new();
        let mut error_handlers = HashMap::new();

        for entry in pending {
            match entry {
                PendingRegistration::Route {
                    method,
                    pattern,
                    callback_id,
                } => {
                    let translated = translate_pattern(pattern);
                    let router = methods.entry(method.clone()).or_default();
                    router
                        .insert(&translated, *callback_id)
                        .map_err(|err| RouterBuildError::InvalidPattern {
                            pattern: pattern.clone(),
                            message: err.to_string(),
                        })?;
                }
                PendingRegistration::Middleware {
                    pattern,
                    callback_id,
                } => {
                    middlewares.push(MiddlewareEntry {
                        pattern: pattern.clone(),
                        callback_id: *callback_id,
                    });
                }
                PendingRegistration::ErrorHandler { kind, callback_id } => {
                    error_handlers.insert(*kind, *callback_id);
                }
            }
        }

        Ok(Self {
            methods,
            middlewares,
            error_handlers,
        })
    }

    /// Matches `(method, path)` against the script-registered routes.
    pub fn route_match(&self, method: &str, path: &str) -> RouteMatch {
        let method = method.to_uppercase();

        if let Some(router) = self.methods.get(&method) {
            if let Ok(matched) = router.at(path) {
                let params = matched
                    .params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                return RouteMatch::Matched {
                    callback_id: *matched.value,
                    params,
                };
            }
        }

        let any_other_method_matches = self
            .methods
            .iter()
            .any(|(m, router)| m != &method && router.at(path).is_ok());

        if any_other_method_matches {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }

    /// Whether any script route claims `path` at all, under any method;
    /// used by the proxy director to decide script dispatch vs. plain
    /// reverse-proxying before it even knows the request's method.
    pub fn has_any_route_for(&self, path: &str) -> bool {
        self.methods.values().any(|router| router.at(path).is_ok())
    }

    /// Middleware applicable to `path`, in registration order (§4.7/§4.8).
    pub fn middlewares_for(&self, path: &str) -> Vec<u64> {
        self.middlewares
            .iter()
            .filter(|entry| match &entry.pattern {
                None => true,
                Some(prefix) => path.starts_with(prefix.as_str()),
            })
            .map(|entry| entry.callback_id)
            .collect()
    }

    pub fn error_handler(&self, kind: ErrorHandlerKind) -> Option<u64> {
        self.error_handlers.get(&kind).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, pattern: &str, callback_id: u64) -> PendingRegistration {
        PendingRegistration::Route {
            method: method.to_string(),
            pattern: pattern.to_string(),
            callback_id,
        }
    }

    #[test]
    fn matches_exact_and_parameterized_routes() {
        let snapshot = RouterSnapshot::build(&[
            route("GET", "/hello", 1),
            route("GET", "/users/{id}", 2),
        ])
        .unwrap();

        assert_eq!(
            snapshot.route_match("GET", "/hello"),
            RouteMatch::Matched {
                callback_id: 1,
                params: HashMap::new()
            }
        );

        match snapshot.route_match("GET", "/users/42") {
            RouteMatch::Matched { callback_id, params } => {
                assert_eq!(callback_id, 2);
                assert_eq!(params.get("id"), Some(&"42".to_string()));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn translates_catch_all_wildcard_syntax() {
        let snapshot = RouterSnapshot::build(&[route("GET", "/static/{path:.*}", 7)]).unwrap();
        match snapshot.route_match("GET", "/static/css/app.css") {
            RouteMatch::Matched { callback_id, params } => {
                assert_eq!(callback_id, 7);
                assert_eq!(params.get("path"), Some(&"css/app.css".to_string()));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn distinguishes_not_found_from_method_not_allowed() {
        let snapshot = RouterSnapshot::build(&[route("POST", "/widgets", 3)]).unwrap();
        assert_eq!(
            snapshot.route_match("GET", "/widgets"),
            RouteMatch::MethodNotAllowed
        );
        assert_eq!(
            snapshot.route_match("GET", "/nothing-here"),
            RouteMatch::NotFound
        );
    }

    #[test]
    fn middleware_applies_globally_or_by_prefix() {
        let pending = vec![
            PendingRegistration::Middleware {
                pattern: None,
                callback_id: 1,
            },
            PendingRegistration::Middleware {
                pattern: Some("/api/".to_string()),
                callback_id: 2,
            },
            route("GET", "/api/widgets", 3),
        ];
        let snapshot = RouterSnapshot::build(&pending).unwrap();

        assert_eq!(snapshot.middlewares_for("/api/widgets"), vec![1, 2]);
        assert_eq!(snapshot.middlewares_for("/other"), vec![1]);
    }

    #[test]
    fn error_handler_lookup_by_kind() {
        let pending = vec![PendingRegistration::ErrorHandler {
            kind: ErrorHandlerKind::NotFound,
            callback_id: 9,
        }];
        let snapshot = RouterSnapshot::build(&pending).unwrap();
        assert_eq!(snapshot.error_handler(ErrorHandlerKind::NotFound), Some(9));
        assert_eq!(
            snapshot.error_handler(ErrorHandlerKind::MethodNotAllowed),
            None
        );
    }

    #[test]
    fn has_any_route_for_ignores_method() {
        let snapshot = RouterSnapshot::build(&[route("POST", "/widgets", 1)]).unwrap();
        assert!(snapshot.has_any_route_for("/widgets"));
        assert!(!snapshot.has_any_route_for("/other"));
    }
}
