//! Registry keys and the untyped resource wire form.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RegistryError;

/// The kinds of objects a data plane consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Service,
    Route,
    PluginMetadata,
}

impl ResourceKind {
    /// Every kind, in the order a data plane should load them.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::PluginMetadata,
        ResourceKind::Service,
        ResourceKind::Route,
    ];

    /// Key segment used for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "services",
            ResourceKind::Route => "routes",
            ResourceKind::PluginMetadata => "plugin_metadatas",
        }
    }

    /// Parse a key segment.
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "services" => Some(ResourceKind::Service),
            "routes" => Some(ResourceKind::Route),
            "plugin_metadatas" => Some(ResourceKind::PluginMetadata),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub kind: ResourceKind,
    pub id: String,
    pub body: serde_json::Value,
}

/// The gateway+stage prefix a registry instance is confined to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryScope {
    key_prefix: String,
    gateway: String,
    stage: String,
}

impl RegistryScope {
    pub fn new(
        key_prefix: impl Into<String>,
        gateway: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        let key_prefix: String = key_prefix.into();
        Self {
            key_prefix: key_prefix.trim_end_matches('/').to_string(),
            gateway: gateway.into(),
            stage: stage.into(),
        }
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// `{key_prefix}/{gateway}/{stage}/`
    pub fn prefix(&self) -> String {
        format!("{}/{}/{}/", self.key_prefix, self.gateway, self.stage)
    }

    /// `{key_prefix}/{gateway}/{stage}/{type}/{id}`
    pub fn key(&self, kind: ResourceKind, id: &str) -> String {
        format!("{}{}/{}", self.prefix(), kind.as_str(), id)
    }

    /// Split a key under this prefix back into kind and id.
    pub fn parse_key(&self, key: &str) -> Option<(ResourceKind, String)> {
        let rest = key.strip_prefix(&self.prefix())?;
        let (kind, id) = rest.split_once('/')?;
        Some((ResourceKind::parse(kind)?, id.to_string()))
    }
}

impl std::fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// A strongly typed registry resource.
pub trait TypedResource: Serialize + DeserializeOwned {
    const KIND: ResourceKind;

    fn resource_id(&self) -> &str;

    fn to_object(&self) -> Result<ResourceObject, RegistryError> {
        Ok(ResourceObject {
            kind: Self::KIND,
            id: self.resource_id().to_string(),
            body: serde_json::to_value(self)?,
        })
    }

    fn from_object(object: &ResourceObject) -> Result<Self, RegistryError> {
        if object.kind != Self::KIND {
            return Err(RegistryError::KindMismatch {
                expected: Self::KIND.as_str(),
                found: object.kind.as_str(),
            });
        }
        Ok(serde_json::from_value(object.body.clone())?)
    }
}
