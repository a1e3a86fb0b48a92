//! Configuration system for btroute.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BTROUTE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/btroute/config.toml
//!   3. ~/.config/btroute/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::ProtocolKind;
use crate::wire::CONTROL_SERVICE_NAME;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrouteConfig {
    pub control: ControlConfig,
    pub scan: ScanConfig,
    pub search: SearchConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control service port. 0 = allocated by the link layer.
    pub port: u16,
    /// Name the control service is advertised under.
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Port probed to confirm a scanned device is really in range.
    pub probe_port: u16,
    pub probe_kind: ProtocolKind,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Upper bound on waiting for forwarded requests to be answered.
    pub timeout_ms: u64,
    /// Upper bound on opening a control connection to a neighbor.
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Per-direction pump buffer in bytes.
    pub buffer_size: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: 0,
            service_name: CONTROL_SERVICE_NAME.to_string(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            // Service discovery channel: every powered adapter accepts here.
            probe_port: 1,
            probe_kind: ProtocolKind::SegmentOriented,
            probe_timeout_ms: 3_000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { buffer_size: 4096 }
    }
}

impl ScanConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("btroute")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BtrouteConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            BtrouteConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file with no env overrides applied.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BTROUTE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BtrouteConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BTROUTE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BTROUTE_CONTROL__PORT") {
            if let Ok(p) = v.parse() {
                self.control.port = p;
            }
        }
        if let Ok(v) = std::env::var("BTROUTE_SEARCH__TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.search.timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("BTROUTE_SCAN__PROBE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.scan.probe_timeout_ms = ms;
            }
        }
    }
}
