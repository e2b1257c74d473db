//! Plugin type codes and their convertors.
//!
//! Every plugin config reaches the compiler as a YAML body tagged with a type
//! code. [`PluginType`] is the closed set of codes the registry understands;
//! looking up anything else fails with [`CompileError::UnknownPluginType`].

pub mod cors;
pub mod header;
pub mod ip;
pub mod rate_limit;
mod simple;

use std::fmt;
use std::str::FromStr;

use rampart_registry::PluginEntry;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CompileError;

/// Name of the synthetic plugin carrying resource identity and auth flags.
pub const RESOURCE_CONTEXT_PLUGIN: &str = "bk-resource-context";
/// Name of the synthetic plugin carrying gateway/stage names and vars.
pub const STAGE_CONTEXT_PLUGIN: &str = "bk-stage-context";
/// Name of the synthetic plugin rewriting the upstream method and path.
pub const PROXY_REWRITE_PLUGIN: &str = "bk-proxy-rewrite";

/// Plugin types a plugin config can be bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginType {
    HeaderRewrite,
    Cors,
    IpRestriction,
    RateLimit,
    Mock,
    VerifiedUserExemptedApps,
    StatusRewrite,
}

impl PluginType {
    pub const ALL: [PluginType; 7] = [
        PluginType::HeaderRewrite,
        PluginType::Cors,
        PluginType::IpRestriction,
        PluginType::RateLimit,
        PluginType::Mock,
        PluginType::VerifiedUserExemptedApps,
        PluginType::StatusRewrite,
    ];

    /// The wire code, e.g. `bk-cors`.
    pub fn code(&self) -> &'static str {
        match self {
            PluginType::HeaderRewrite => "bk-header-rewrite",
            PluginType::Cors => "bk-cors",
            PluginType::IpRestriction => "bk-ip-restriction",
            PluginType::RateLimit => "bk-rate-limit",
            PluginType::Mock => "bk-mock",
            PluginType::VerifiedUserExemptedApps => "bk-verified-user-exempted-apps",
            PluginType::StatusRewrite => "bk-status-rewrite",
        }
    }

    pub fn parse(code: &str) -> Result<Self, CompileError> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| CompileError::UnknownPluginType(code.to_string()))
    }

    /// Convert a YAML plugin config into the normalized registry config.
    pub fn convert(&self, yaml: &str) -> Result<ConvertedPlugin, CompileError> {
        let config = match self {
            PluginType::HeaderRewrite => header::convert(parse_yaml(*self, yaml)?)?,
            PluginType::Cors => cors::convert(parse_yaml::<cors::CorsConfig>(*self, yaml)?.into())?,
            PluginType::IpRestriction => ip::convert_plugin(parse_yaml(*self, yaml)?)?,
            PluginType::RateLimit => rate_limit::convert(parse_yaml(*self, yaml)?)?,
            PluginType::Mock => simple::convert_mock(parse_yaml(*self, yaml)?)?,
            PluginType::VerifiedUserExemptedApps => {
                simple::convert_exempted_apps(parse_yaml(*self, yaml)?)?
            }
            PluginType::StatusRewrite => simple::convert_status_rewrite(yaml)?,
        };
        Ok(ConvertedPlugin {
            plugin_type: *self,
            config,
        })
    }
}

impl FromStr for PluginType {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A plugin ready to be attached to a service or route.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedPlugin {
    pub plugin_type: PluginType,
    pub config: Value,
}

impl ConvertedPlugin {
    pub fn type_code(&self) -> &'static str {
        self.plugin_type.code()
    }

    pub fn into_entry(self) -> PluginEntry {
        PluginEntry::new(self.plugin_type.code(), self.config)
    }
}

/// Parse a plugin YAML body; an empty body is treated as an empty mapping.
pub(crate) fn parse_yaml<T: DeserializeOwned>(
    plugin: PluginType,
    yaml: &str,
) -> Result<T, CompileError> {
    let body = if yaml.trim().is_empty() { "{}" } else { yaml };
    serde_yaml::from_str(body).map_err(|e| CompileError::invalid(plugin.code(), e.to_string()))
}
