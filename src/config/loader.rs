use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
/// Supports multiple formats (YAML, JSON, TOML, INI), detected by extension;
/// YAML is the default when the extension is unrecognized.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously.
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

/// Load configuration without validation (used by the `validate` CLI command,
/// which wants to report parse errors before checking semantic validity).
pub async fn load_config_unchecked(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_load_yaml_config() {
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 3000
tenants:
  - name: "acme"
    path_prefix: "/api/"
    backends:
      - name: "primary"
        url: "http://backend:8080"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].name, "acme");
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "server": { "host": "127.0.0.1", "port": 3000 },
  "tenants": [
    {
      "name": "acme",
      "path_prefix": "/api/",
      "backends": [{ "name": "primary", "url": "http://backend:8080" }]
    }
  ]
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.tenants.len(), 1);
    }
}
