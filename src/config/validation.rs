use std::collections::HashSet;

use crate::config::models::{GatewayConfig, TenantConfig};

/// Validation result type alias.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types.
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{host}:{port}': {reason}")]
    InvalidListenAddress {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Duplicate tenant name: {name}")]
    DuplicateTenant { name: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Validates a fully parsed [`GatewayConfig`] against the structural rules of
/// §6 before the gateway begins serving traffic.
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.server.host, config.server.port) {
            errors.push(e);
        }

        if config.tenants.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "tenants".to_string(),
            });
        }

        let mut seen_names = HashSet::new();
        for tenant in &config.tenants {
            if !seen_names.insert(tenant.name.clone()) {
                errors.push(ValidationError::DuplicateTenant {
                    name: tenant.name.clone(),
                });
            }
            if let Err(mut tenant_errors) = Self::validate_tenant(tenant) {
                errors.append(&mut tenant_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_listen_address(host: &str, port: u16) -> ValidationResult<()> {
        if host.is_empty() {
            return Err(ValidationError::InvalidListenAddress {
                host: host.to_string(),
                port,
                reason: "host must not be empty".to_string(),
            });
        }
        if port == 0 {
            return Err(ValidationError::InvalidListenAddress {
                host: host.to_string(),
                port,
                reason: "port must be nonzero".to_string(),
            });
        }
        Ok(())
    }

    fn validate_tenant(tenant: &TenantConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if tenant.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "tenant.name".to_string(),
            });
        }

        for domain in &tenant.domains {
            if !domain.contains('.') || domain.chars().any(char::is_whitespace) {
                errors.push(ValidationError::InvalidField {
                    field: format!("tenant '{}' domain", tenant.name),
                    message: format!(
                        "domain '{domain}' must contain a dot and no whitespace"
                    ),
                });
            }
        }

        if let Some(prefix) = &tenant.path_prefix {
            if prefix == "/" || !prefix.starts_with('/') || !prefix.ends_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("tenant '{}' path_prefix", tenant.name),
                    message: "path_prefix must start and end with '/' and must not be '/' alone"
                        .to_string(),
                });
            }
        }

        if tenant.domains.is_empty() && tenant.path_prefix.is_none() {
            errors.push(ValidationError::InvalidField {
                field: format!("tenant '{}' selector", tenant.name),
                message: "tenant must configure at least one of domains or path_prefix"
                    .to_string(),
            });
        }

        if tenant.backends.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("tenant '{}' backends", tenant.name),
                message: "tenant must have at least one backend".to_string(),
            });
        }

        let mut seen_backend_names = HashSet::new();
        for backend in &tenant.backends {
            if !seen_backend_names.insert(backend.name.clone()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("tenant '{}' backend", tenant.name),
                    message: format!("duplicate backend name '{}'", backend.name),
                });
            }
            if let Err(e) = Self::validate_backend_url(&backend.url, &tenant.name, &backend.name)
            {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_backend_url(
        url_str: &str,
        tenant_name: &str,
        backend_name: &str,
    ) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: format!("tenant '{tenant_name}' backend '{backend_name}' url"),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }
                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: format!("tenant '{tenant_name}' backend '{backend_name}' url"),
                        message: "URL must have a valid host".to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: format!("tenant '{tenant_name}' backend '{backend_name}' url"),
                message: format!("invalid URL: {e}"),
            }),
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }
        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::BackendConfig;

    fn valid_tenant() -> TenantConfig {
        TenantConfig {
            name: "acme".into(),
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
        }
    }

    #[test]
    fn accepts_minimal_valid_config() {
        let config = GatewayConfig {
            tenants: vec![valid_tenant()],
            ..Default::default()
        };
        assert!(GatewayConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn rejects_empty_tenants() {
        let config = GatewayConfig::default();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_root_path_prefix() {
        let mut tenant = valid_tenant();
        tenant.path_prefix = Some("/".into());
        let config = GatewayConfig {
            tenants: vec![tenant],
            ..Default::default()
        };
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_tenant_without_backends() {
        let mut tenant = valid_tenant();
        tenant.backends.clear();
        let config = GatewayConfig {
            tenants: vec![tenant],
            ..Default::default()
        };
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_duplicate_tenant_names() {
        let config = GatewayConfig {
            tenants: vec![valid_tenant(), valid_tenant()],
            ..Default::default()
        };
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_domain_without_dot() {
        let mut tenant = valid_tenant();
        tenant.path_prefix = None;
        tenant.domains = vec!["localhost".into()];
        let config = GatewayConfig {
            tenants: vec![tenant],
            ..Default::default()
        };
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }
}
