//! Configuration rows the compiler consumes.
//!
//! These mirror what the configuration store hands over at release time:
//! the stage as it is now, the immutable resource version, and the bindings
//! that attach plugins and access strategies to the stage and its resources.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version written by the current resource version generator.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0";

/// Load balancing algorithm of a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalance {
    #[default]
    Roundrobin,
    WeightedRoundrobin,
    Chash,
}

impl LoadBalance {
    pub fn as_str(&self) -> &'static str {
        match self {
            // weighted round robin is plain roundrobin with weights on the nodes
            LoadBalance::Roundrobin | LoadBalance::WeightedRoundrobin => "roundrobin",
            LoadBalance::Chash => "chash",
        }
    }
}

/// One host of a backend, e.g. `{scheme: https, host: "api.example.com:8443"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHost {
    pub scheme: String,
    pub host: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

/// A backend service configured on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageBackend {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub load_balance: LoadBalance,
    /// Upstream timeout in seconds.
    pub timeout: u32,
    pub hosts: Vec<BackendHost>,
}

/// The stage being released, as currently configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub backends: Vec<StageBackend>,
}

impl StageConfig {
    pub fn backend(&self, id: Uuid) -> Option<&StageBackend> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// Proxy kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Http,
    Mock,
    #[serde(other)]
    Unsupported,
}

/// Proxy settings of an HTTP resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxyConfig {
    pub backend_id: Uuid,
    pub method: String,
    pub path: String,
    /// Overrides the backend timeout when set (seconds).
    #[serde(default)]
    pub timeout: Option<u32>,
}

/// Proxy snapshot stored in a resource version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySnapshot {
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Authentication requirements of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAuth {
    #[serde(default)]
    pub app_verified_required: bool,
    #[serde(default)]
    pub auth_verified_required: bool,
    #[serde(default)]
    pub resource_perm_required: bool,
}

/// A plugin config bound to a resource when the version was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSnapshot {
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// YAML body of the plugin config.
    pub config: String,
}

/// One resource inside a resource version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: Uuid,
    pub name: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub match_subpath: bool,
    #[serde(default)]
    pub enable_websocket: bool,
    /// Names of stages this resource is disabled on.
    #[serde(default)]
    pub disabled_stages: Vec<String>,
    pub proxy: ProxySnapshot,
    #[serde(default)]
    pub auth: ResourceAuth,
    #[serde(default)]
    pub plugins: Vec<PluginSnapshot>,
}

impl ResourceSnapshot {
    pub fn is_disabled_on(&self, stage: &str) -> bool {
        self.disabled_stages.iter().any(|s| s == stage)
    }

    /// The HTTP proxy config, or `None` for non-HTTP resources.
    pub fn http_proxy(&self) -> Result<Option<HttpProxyConfig>, serde_json::Error> {
        match self.proxy.proxy_type {
            ProxyType::Http => serde_json::from_value(self.proxy.config.clone()).map(Some),
            ProxyType::Mock | ProxyType::Unsupported => Ok(None),
        }
    }
}

/// Immutable snapshot of every resource of a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersionData {
    pub id: Uuid,
    pub version: String,
    pub schema_version: String,
    #[serde(default)]
    pub resources: Vec<ResourceSnapshot>,
}

impl ResourceVersionData {
    pub fn is_current_schema(&self) -> bool {
        self.schema_version == CURRENT_SCHEMA_VERSION
    }
}

/// A plugin config bound to the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundPlugin {
    pub plugin_type: String,
    pub config: String,
}

/// A legacy access strategy bound to the stage or a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundAccessStrategy {
    pub strategy_type: String,
    pub config: serde_json::Value,
}

/// A named, free-text list of IPs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpGroup {
    pub id: Uuid,
    pub name: String,
    pub ips: String,
}

/// Identifies the generation being written, surfaced by the version probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMarker {
    pub publish_id: Uuid,
    pub published_at: DateTime<Utc>,
}

/// Everything needed to compile one stage of one gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInput {
    pub gateway: String,
    pub stage: StageConfig,
    pub resource_version: ResourceVersionData,
    /// Stage-scoped plugin configs, in binding order.
    #[serde(default)]
    pub stage_plugins: Vec<BoundPlugin>,
    /// Stage-scoped access strategies, in binding order.
    #[serde(default)]
    pub stage_strategies: Vec<BoundAccessStrategy>,
    /// Backend-scoped plugin configs; these replace a stage plugin of the same type.
    #[serde(default)]
    pub backend_plugins: BTreeMap<Uuid, Vec<BoundPlugin>>,
    /// Resource-scoped access strategies, in binding order.
    #[serde(default)]
    pub resource_strategies: BTreeMap<Uuid, Vec<BoundAccessStrategy>>,
    #[serde(default)]
    pub ip_groups: BTreeMap<Uuid, IpGroup>,
    pub marker: ReleaseMarker,
}
