//! Configuration for Capstan clients.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAPSTAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/capstan/config.toml
//!   3. ~/.config/capstan/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration. Values only — the client consumes these as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Comma-separated `host[:port]` list. Port defaults to 4730.
    pub servers: String,
    /// Per-call timeout in milliseconds. -1 = wait forever.
    pub timeout_ms: i64,
    /// Function-name prefix. Empty = no prefixing.
    pub namespace: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            timeout_ms: -1,
            namespace: String::new(),
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("capstan")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl ClientConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ClientConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAPSTAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Apply CAPSTAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAPSTAN_SERVERS") {
            self.servers = v;
        }
        if let Ok(v) = std::env::var("CAPSTAN_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("CAPSTAN_NAMESPACE") {
            self.namespace = v;
        }
    }
}
