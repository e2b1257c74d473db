//! Control plane configuration file.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working local setup. CLI flags and environment variables override the file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use rampart_compiler::CompileOptions;
use rampart_registry::RetryPolicy;
use serde::Deserialize;
use serde_json::Value;

use crate::release::DispatcherConfig;

/// Errors raised while loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub listen: SocketAddr,
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub registry: RegistrySection,
    pub dispatcher: DispatcherSection,
    pub compiler: CompilerSection,
    pub log: LogSection,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9090)),
            database_url: None,
            max_connections: 10,
            registry: RegistrySection::default(),
            dispatcher: DispatcherSection::default(),
            compiler: CompilerSection::default(),
            log: LogSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySection {
    /// Used when a data plane has no key prefix of its own.
    pub key_prefix: String,
    pub retry: RetryPolicy,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            key_prefix: "/rampart".into(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherSection {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub lease_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            batch_size: 32,
            lease_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompilerSection {
    /// Gateway-wide plugin metadata, keyed by plugin name.
    pub plugin_metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
        }
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl ControlConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str, path: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Load from a file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_toml(&content, &display)
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if let Some(level) = overrides.log_level {
            self.log.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.log.format = format;
        }
        self
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.dispatcher.poll_interval_ms),
            batch_size: self.dispatcher.batch_size.max(1),
            lease: Duration::from_secs(self.dispatcher.lease_secs),
            retry: self.registry.retry,
        }
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            plugin_metadata: self.compiler.plugin_metadata.clone(),
        }
    }
}
