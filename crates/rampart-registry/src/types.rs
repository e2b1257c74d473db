//! Typed resource objects consumed by the data plane.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::{ResourceKind, TypedResource};

/// A plugin attached to a service or route, kept in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub config: serde_json::Value,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

/// Connect/send/read timeouts in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTimeout {
    pub connect: u32,
    pub send: u32,
    pub read: u32,
}

impl RouteTimeout {
    /// The same value for all three phases.
    pub fn uniform(seconds: u32) -> Self {
        Self {
            connect: seconds,
            send: seconds,
            read: seconds,
        }
    }
}

/// One upstream host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamNode {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    #[serde(default)]
    pub priority: i32,
}

/// Upstream definition embedded in a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// Load balancing algorithm, e.g. `roundrobin`.
    #[serde(rename = "type")]
    pub lb_type: String,
    pub scheme: String,
    pub nodes: Vec<UpstreamNode>,
    pub timeout: RouteTimeout,
}

/// A backend service of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub upstream: Upstream,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl TypedResource for Service {
    const KIND: ResourceKind = ResourceKind::Service;

    fn resource_id(&self) -> &str {
        &self.id
    }
}

/// A routable endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
    pub uris: Vec<String>,
    pub methods: Vec<String>,
    /// Absent for routes answered entirely by plugins (mocks, probes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default)]
    pub enable_websocket: bool,
    #[serde(default)]
    pub priority: i32,
    /// Overrides the service upstream timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<RouteTimeout>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl Route {
    /// Find an attached plugin by name.
    pub fn plugin(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

impl TypedResource for Route {
    const KIND: ResourceKind = ResourceKind::Route;

    fn resource_id(&self) -> &str {
        &self.id
    }
}

/// Gateway-wide plugin configuration (e.g. a log format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// The plugin name doubles as the id.
    pub id: String,
    pub config: serde_json::Value,
}

impl TypedResource for PluginMetadata {
    const KIND: ResourceKind = ResourceKind::PluginMetadata;

    fn resource_id(&self) -> &str {
        &self.id
    }
}
