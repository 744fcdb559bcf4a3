// Server configuration
//
// Everything the binary needs beyond the runtime limits: where to listen,
// which storage backend to open, which model provider to call.

use axum::http::HeaderValue;
use runloop_worker::RuntimeConfig;
use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";
pub const DEFAULT_LOG_FILTER: &str =
    "runloop_control_plane=debug,runloop_worker=debug,runloop_core=info,tower_http=debug";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// None selects the in-memory dev-mode store
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// None selects the local echo driver
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    /// Optional YAML/JSON file merged over the built-in price table
    pub price_table_path: Option<PathBuf>,
    /// Origins allowed by CORS; empty means same-origin only
    pub cors_allowed_origins: Vec<HeaderValue>,
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            database_url: None,
            database_max_connections: 10,
            openai_api_key: None,
            openai_base_url: None,
            price_table_path: None,
            cors_allowed_origins: Vec::new(),
            runtime: RuntimeConfig::default(),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: non_empty("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_base_url: non_empty("OPENAI_BASE_URL"),
            price_table_path: non_empty("PRICE_TABLE_PATH").map(PathBuf::from),
            cors_allowed_origins: non_empty("CORS_ALLOWED_ORIGINS")
                .map(|s| s.split(',').filter_map(|o| o.trim().parse().ok()).collect())
                .unwrap_or_default(),
            runtime: RuntimeConfig::from_env(),
        }
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    pub fn with_price_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.price_table_path = Some(path.into());
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_select_dev_mode() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert!(config.database_url.is_none());
        assert!(config.openai_api_key.is_none());
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::default()
            .with_bind_addr("127.0.0.1:0")
            .with_database_url("postgres://localhost/runloop")
            .with_price_table_path("/etc/runloop/prices.yaml");
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/runloop")
        );
        assert_eq!(
            config.price_table_path,
            Some(PathBuf::from("/etc/runloop/prices.yaml"))
        );
    }
}
