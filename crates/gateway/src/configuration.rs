use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Address the gateway listens on.
    pub listen_addr: String,
    pub upstream: UpstreamConfig,
    /// Address of the shared counter store.
    pub shared_store_addr: String,
    /// Path of the relational database file.
    pub database_path: PathBuf,
    /// Only requests under this path prefix are metered.
    #[serde(default = "default_metered_prefix")]
    pub metered_prefix: String,
    /// Route templates of the fronted API, in `{param}` syntax. Requests
    /// matching no template are counted under an undefined route.
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// `host:port` of the upstream API.
    pub addr: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub sni: String,
}

fn default_metered_prefix() -> String {
    "/api".to_string()
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("failed to read gateway config: {e}"))?;
        let config: GatewayConfig =
            serde_yaml::from_str(&raw).map_err(|e| format!("failed to parse gateway config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr must not be empty".to_string());
        }
        if self.upstream.addr.is_empty() {
            return Err("upstream.addr must not be empty".to_string());
        }
        if self.shared_store_addr.is_empty() {
            return Err("shared_store_addr must not be empty".to_string());
        }
        if self.database_path.as_os_str().is_empty() {
            return Err("database_path must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_full_config() {
        let yaml = r#"
        listen_addr: 0.0.0.0:8080
        upstream:
          addr: 127.0.0.1:9001
        shared_store_addr: 127.0.0.1:6379
        database_path: /var/lib/gateway/api.db
        metered_prefix: /api
        routes:
          - "/api/v1/block/{hash}"
          - "/api/v1/foo"
        "#;

        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("parse config");
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.upstream.addr, "127.0.0.1:9001");
        assert!(!config.upstream.tls);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0], "/api/v1/block/{hash}");
        config.validate().expect("valid config");
    }

    #[test]
    fn metered_prefix_defaults_to_api() {
        let yaml = r#"
        listen_addr: 0.0.0.0:8080
        upstream:
          addr: 127.0.0.1:9001
        shared_store_addr: 127.0.0.1:6379
        database_path: api.db
        "#;

        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("parse config");
        assert_eq!(config.metered_prefix, "/api");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn validation_rejects_empty_upstream() {
        let yaml = r#"
        listen_addr: 0.0.0.0:8080
        upstream:
          addr: ""
        shared_store_addr: 127.0.0.1:6379
        database_path: api.db
        "#;

        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("parse config");
        assert!(config.validate().is_err());
    }
}
