//! Legacy access strategies, translated into the plugins that replaced them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CompileError;
use crate::model::IpGroup;
use crate::plugin::cors::{self, CorsRules};
use crate::plugin::ip::{self, IpListMode};
use crate::plugin::rate_limit::{self, Rate, RateLimitConfig};
use crate::plugin::{ConvertedPlugin, PluginType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessStrategyType {
    IpAccessControl,
    RateLimit,
    UserVerifiedUnrequiredApps,
    ErrorStatusCode200,
    Cors,
}

impl AccessStrategyType {
    pub const ALL: [AccessStrategyType; 5] = [
        AccessStrategyType::IpAccessControl,
        AccessStrategyType::RateLimit,
        AccessStrategyType::UserVerifiedUnrequiredApps,
        AccessStrategyType::ErrorStatusCode200,
        AccessStrategyType::Cors,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            AccessStrategyType::IpAccessControl => "ip_access_control",
            AccessStrategyType::RateLimit => "rate_limit",
            AccessStrategyType::UserVerifiedUnrequiredApps => "user_verified_unrequired_apps",
            AccessStrategyType::ErrorStatusCode200 => "error_status_code_200",
            AccessStrategyType::Cors => "cors",
        }
    }

    pub fn parse(code: &str) -> Result<Self, CompileError> {
        Self::ALL
            .into_iter()
            .find(|t| t.code() == code)
            .ok_or_else(|| CompileError::UnknownAccessStrategyType(code.to_string()))
    }

    /// The plugin type this strategy is emitted as.
    pub fn plugin_type(&self) -> PluginType {
        match self {
            AccessStrategyType::IpAccessControl => PluginType::IpRestriction,
            AccessStrategyType::RateLimit => PluginType::RateLimit,
            AccessStrategyType::UserVerifiedUnrequiredApps => PluginType::VerifiedUserExemptedApps,
            AccessStrategyType::ErrorStatusCode200 => PluginType::StatusRewrite,
            AccessStrategyType::Cors => PluginType::Cors,
        }
    }

    /// Convert a strategy config; IP groups are looked up by id.
    pub fn convert(
        &self,
        config: &Value,
        ip_groups: &BTreeMap<Uuid, IpGroup>,
    ) -> Result<ConvertedPlugin, CompileError> {
        let plugin_type = self.plugin_type();
        let config = match self {
            AccessStrategyType::IpAccessControl => {
                let c: IpAccessControl = self.parse_config(config)?;
                let mut contents = Vec::with_capacity(c.ip_group_list.len() + 1);
                for id in &c.ip_group_list {
                    let group = ip_groups.get(id).ok_or(CompileError::MissingIpGroup(*id))?;
                    contents.push(group.ips.as_str());
                }
                if let Some(extra) = &c.ip_content {
                    contents.push(extra.as_str());
                }
                ip::render(c.mode, ip::merge_ip_contents(contents)?)
            }
            AccessStrategyType::RateLimit => {
                let c: LegacyRateLimit = self.parse_config(config)?;
                let rates = c
                    .rates
                    .into_iter()
                    .map(|(app, rate)| (app, vec![rate]))
                    .collect();
                rate_limit::convert(RateLimitConfig { rates })?
            }
            AccessStrategyType::UserVerifiedUnrequiredApps => {
                let c: UnrequiredApps = self.parse_config(config)?;
                let apps: Vec<Value> = c
                    .bk_app_code_list
                    .iter()
                    .map(|code| {
                        serde_json::json!({
                            "bk_app_code": code,
                            "dimension": "api",
                            "resource_ids": [],
                        })
                    })
                    .collect();
                serde_json::json!({ "exempted_apps": apps })
            }
            AccessStrategyType::ErrorStatusCode200 => serde_json::json!({}),
            AccessStrategyType::Cors => {
                let c: LegacyCors = self.parse_config(config)?;
                cors::convert(CorsRules {
                    origins: c.allow_origins,
                    origin_regexes: c.allow_origins_by_regex,
                    methods: c.allow_methods,
                    headers: c.allow_headers,
                    expose_headers: c.expose_headers,
                    max_age: c.max_age,
                    allow_credential: c.allow_credentials,
                })?
            }
        };
        Ok(ConvertedPlugin {
            plugin_type,
            config,
        })
    }

    fn parse_config<T: DeserializeOwned>(&self, config: &Value) -> Result<T, CompileError> {
        serde_json::from_value(config.clone())
            .map_err(|e| CompileError::invalid(self.code(), e.to_string()))
    }
}

impl FromStr for AccessStrategyType {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AccessStrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Deserialize)]
struct IpAccessControl {
    #[serde(rename = "type")]
    mode: IpListMode,
    #[serde(default)]
    ip_group_list: Vec<Uuid>,
    #[serde(default)]
    ip_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyRateLimit {
    rates: BTreeMap<String, Rate>,
}

#[derive(Debug, Deserialize)]
struct UnrequiredApps {
    #[serde(default)]
    bk_app_code_list: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyCors {
    allow_origins: Vec<String>,
    allow_origins_by_regex: Vec<String>,
    allow_methods: Vec<String>,
    allow_headers: Vec<String>,
    expose_headers: Vec<String>,
    max_age: Option<u32>,
    allow_credentials: bool,
}
