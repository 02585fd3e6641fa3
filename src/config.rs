use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineConfig;

/// Server settings, read from `PEWLEDGER_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub lock_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "pewledger".into(),
            max_connections: 256,
            metrics_port: None,
            lock_timeout: Duration::from_millis(2000),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw:?}");
            None
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&lookup, "PEWLEDGER_PORT").unwrap_or(defaults.port),
            bind: lookup("PEWLEDGER_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("PEWLEDGER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("PEWLEDGER_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "PEWLEDGER_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_connections),
            metrics_port: parsed(&lookup, "PEWLEDGER_METRICS_PORT"),
            lock_timeout: parsed(&lookup, "PEWLEDGER_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: self.lock_timeout,
            ..EngineConfig::default()
        }
    }
}
