//! kiln.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::version::{ApiVersion, CURRENT_API_VERSION, MIN_API_VERSION};

/// Default bound on frames queued between a build and a slow client.
pub const DEFAULT_PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub build: BuildSettings,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 2375)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Version assumed when the request path carries none.
    pub default_version: ApiVersion,
    pub min_version: ApiVersion,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_version: CURRENT_API_VERSION,
            min_version: MIN_API_VERSION,
        }
    }
}

/// Settings for the streaming build endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Allow progress to flow before the upload finishes. When false,
    /// progress is held until the request body has been received.
    pub full_duplex: bool,
    /// Frames queued toward the client before backend writes block. Also
    /// caps the frames held during a half-duplex upload.
    pub progress_buffer: usize,
    /// Cancel builds that run longer than this.
    pub timeout_secs: Option<u64>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            full_duplex: true,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
            timeout_secs: None,
        }
    }
}

impl BuildSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Parent directory for the spool directory. The spool directory
    /// itself is removed when the daemon exits.
    pub spool_dir: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.progress_buffer == 0 {
            return Err(ConfigError::Invalid(
                "build.progress_buffer must be at least 1".to_string(),
            ));
        }
        if self.api.default_version > CURRENT_API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "api.default_version {} is newer than the newest supported version {}",
                self.api.default_version, CURRENT_API_VERSION
            )));
        }
        if self.api.min_version > self.api.default_version {
            return Err(ConfigError::Invalid(format!(
                "api.min_version {} is newer than api.default_version {}",
                self.api.min_version, self.api.default_version
            )));
        }
        if self.build.timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "build.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
