//! Configuration types for Tapedeck

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::key::KeySpec;
use crate::network::{parse_base_url, MAX_CONNECTIONS};
use crate::storage::LookupScope;
use crate::{Result, TapedeckError};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Always forward upstream and overwrite the recording
    Record,
    /// Serve only from recordings; a miss is a 424
    Replay,
    /// Replay when a recording exists, otherwise record
    RecordOnce,
}

impl Mode {
    /// Whether this mode may contact the upstream
    #[must_use]
    pub fn uses_upstream(self) -> bool {
        !matches!(self, Self::Replay)
    }

    /// Config and CLI spelling
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Replay => "replay",
            Self::RecordOnce => "record_once",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TapedeckError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "record" => Ok(Self::Record),
            "replay" => Ok(Self::Replay),
            "record_once" | "record-once" => Ok(Self::RecordOnce),
            other => Err(TapedeckError::Config(format!(
                "Unknown mode '{other}' (expected record, replay or record_once)"
            ))),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode
    pub mode: Mode,
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Upstream base URL; required unless replaying
    #[serde(default)]
    pub upstream: Option<String>,
    /// Root directory of the recording store
    pub store_root: PathBuf,
    /// Which request parts identify a recording
    #[serde(default)]
    pub key: KeySpec,
    /// Response headers removed before sending and storing
    #[serde(default)]
    pub strip_headers: Vec<String>,
    /// Keep the `date` header instead of stripping it
    #[serde(default)]
    pub disable_default_header_processors: bool,
    /// Where lookup searches for a fingerprint
    #[serde(default)]
    pub lookup_scope: LookupScope,
    /// Compare stored key bytes on lookup
    #[serde(default)]
    pub verify_key: bool,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable
    Pretty,
    /// One JSON object per event
    Json,
    /// Single-line human readable
    #[default]
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive such as `info` or `tapedeck=debug`; `RUST_LOG` wins
    #[serde(default)]
    pub level: Option<String>,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
        }
    }
}

impl Config {
    /// Configuration with defaults for everything but mode and store
    #[must_use]
    pub fn new(mode: Mode, store_root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            listen: default_listen(),
            upstream: None,
            store_root: store_root.into(),
            key: KeySpec::default(),
            strip_headers: Vec::new(),
            disable_default_header_processors: false,
            lookup_scope: LookupScope::default(),
            verify_key: false,
            logging: LoggingConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TapedeckError::Config(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns error if the text is not a valid configuration
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TapedeckError::Config(format!("Failed to parse config: {e}")))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        match (&self.upstream, self.mode.uses_upstream()) {
            (Some(upstream), _) => {
                parse_base_url(upstream)?;
            }
            (None, true) => {
                return Err(TapedeckError::Config(format!(
                    "An upstream URL is required in {} mode",
                    self.mode
                )));
            }
            (None, false) => {}
        }

        if self.mode == Mode::Replay && !self.store_root.is_dir() {
            return Err(TapedeckError::Config(format!(
                "Store root does not exist: {}",
                self.store_root.display()
            )));
        }

        if self.limits.max_connections == 0 {
            return Err(TapedeckError::Config(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.key.is_empty() {
            return Err(TapedeckError::Config(
                "Key selects no request parts; every request would share one recording"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
