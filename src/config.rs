// src/config.rs
use crate::error::{MazurkaError, MazurkaResult};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    0
}

fn default_pool_min() -> usize {
    2
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_acquire_timeout_ms() -> u64 {
    5000
}

/// Server configuration, loaded from a JSON file. Every field has a
/// default, so an empty object (or a missing file handled by the caller)
/// yields a usable config.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory for static file serving; empty disables it.
    #[serde(default)]
    pub static_root: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Worker threads; 0 means one per logical CPU.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_pool_min")]
    pub pool_min_size: usize,

    #[serde(default = "default_pool_max")]
    pub pool_max_size: usize,

    #[serde(default = "default_pool_acquire_timeout_ms")]
    pub pool_acquire_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_root: String::new(),
            log_level: default_log_level(),
            workers: default_workers(),
            pool_min_size: default_pool_min(),
            pool_max_size: default_pool_max(),
            pool_acquire_timeout_ms: default_pool_acquire_timeout_ms(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> MazurkaResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            MazurkaError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| MazurkaError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.static_root, "");
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_partial_override() {
        let config: Config =
            serde_json::from_str(r#"{"port": 8080, "log_level": "debug", "workers": 3}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        match Config::load("/definitely/not/here.json") {
            Err(MazurkaError::Config(msg)) => assert!(msg.contains("cannot read")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_invalid_json_is_config_error() {
        let dir = std::env::temp_dir();
        let path = dir.join("mazurka_config_test_invalid.json");
        std::fs::write(&path, "not json at all").unwrap();
        match Config::load(&path) {
            Err(MazurkaError::Config(msg)) => assert!(msg.contains("cannot parse")),
            other => panic!("expected Config error, got {:?}", other),
        }
        let _ = std::fs::remove_file(&path);
    }
}
