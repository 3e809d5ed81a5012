use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::ad_service::AdServiceConfig;

/// Top-level config loaded from `ad.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "./ads.db".to_string()
}

/// Write-path and replication tuning, in milliseconds where applicable.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_lock_key")]
    pub lock_key: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_retry_budget")]
    pub lock_retry_budget: u32,
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,
    #[serde(default = "default_read_batch")]
    pub read_batch: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_run_attempts")]
    pub run_attempts: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            lock_key: default_lock_key(),
            stream_name: default_stream_name(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_retry_budget: default_lock_retry_budget(),
            read_block_ms: default_read_block_ms(),
            read_batch: default_read_batch(),
            request_timeout_ms: default_request_timeout_ms(),
            run_attempts: default_run_attempts(),
        }
    }
}

fn default_lock_key() -> String {
    "lock:ad".to_string()
}

fn default_stream_name() -> String {
    "ad".to_string()
}

fn default_lock_ttl_ms() -> u64 {
    100
}

fn default_lock_retry_budget() -> u32 {
    10
}

fn default_read_block_ms() -> u64 {
    3000
}

fn default_read_batch() -> usize {
    10
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_run_attempts() -> u32 {
    5
}

impl ServiceConfig {
    pub fn to_service_config(&self) -> AdServiceConfig {
        AdServiceConfig {
            lock_key: self.lock_key.clone(),
            stream_name: self.stream_name.clone(),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_retry_budget: self.lock_retry_budget,
            read_block: Duration::from_millis(self.read_block_ms),
            read_batch: self.read_batch,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            run_attempts: self.run_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpiryConfig {
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_tuning() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8080);
        let svc = cfg.service.to_service_config();
        assert_eq!(svc.lock_key, "lock:ad");
        assert_eq!(svc.lock_ttl, Duration::from_millis(100));
        assert_eq!(svc.lock_retry_budget, 10);
        assert_eq!(svc.read_block, Duration::from_secs(3));
        assert_eq!(svc.read_batch, 10);
        assert_eq!(svc.request_timeout, Duration::from_secs(3));
        assert_eq!(svc.run_attempts, 5);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9090

            [service]
            request_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.service.request_timeout_ms, 500);
        assert_eq!(cfg.service.lock_retry_budget, 10);
        assert_eq!(cfg.database.path, "./ads.db");
    }
}
