//! Plugins whose configs pass through with light validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::header::canonical_header_key;
use super::{parse_yaml, PluginType};
use crate::error::CompileError;

#[derive(Debug, Clone, Deserialize)]
pub struct MockConfig {
    #[serde(default = "default_status")]
    pub response_status: u16,
    #[serde(default)]
    pub response_example: String,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
}

fn default_status() -> u16 {
    200
}

pub fn convert_mock(config: MockConfig) -> Result<Value, CompileError> {
    if !(100..=599).contains(&config.response_status) {
        return Err(CompileError::invalid(
            PluginType::Mock.code(),
            format!("status {} is not an HTTP status", config.response_status),
        ));
    }
    let headers: BTreeMap<String, String> = config
        .response_headers
        .into_iter()
        .map(|(k, v)| (canonical_header_key(&k), v))
        .collect();
    Ok(json!({
        "response_status": config.response_status,
        "response_example": config.response_example,
        "response_headers": headers,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemptionDimension {
    Api,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExemptedApp {
    pub bk_app_code: String,
    pub dimension: ExemptionDimension,
    #[serde(default)]
    pub resource_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExemptedAppsConfig {
    #[serde(default)]
    pub exempted_apps: Vec<ExemptedApp>,
}

pub fn convert_exempted_apps(config: ExemptedAppsConfig) -> Result<Value, CompileError> {
    let plugin = PluginType::VerifiedUserExemptedApps.code();
    for app in &config.exempted_apps {
        if app.bk_app_code.trim().is_empty() {
            return Err(CompileError::invalid(plugin, "bk_app_code must not be empty"));
        }
        if app.dimension == ExemptionDimension::Resource && app.resource_ids.is_empty() {
            return Err(CompileError::invalid(
                plugin,
                format!("app '{}' is exempted per resource but lists none", app.bk_app_code),
            ));
        }
    }
    Ok(serde_json::to_value(config)?)
}

/// `bk-status-rewrite` takes no options; the body only has to be valid YAML.
pub fn convert_status_rewrite(yaml: &str) -> Result<Value, CompileError> {
    let _: serde_yaml::Value = parse_yaml(PluginType::StatusRewrite, yaml)?;
    Ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_defaults_and_header_keys() {
        let out = PluginType::Mock
            .convert("response_example: ok\nresponse_headers:\n  content-type: text/plain\n")
            .unwrap();
        assert_eq!(out.config["response_status"], 200);
        assert_eq!(out.config["response_headers"]["Content-Type"], "text/plain");
    }

    #[test]
    fn mock_rejects_bad_status() {
        assert!(PluginType::Mock.convert("response_status: 42\n").is_err());
    }

    #[test]
    fn exempted_apps_per_resource_need_ids() {
        let yaml = "exempted_apps:\n  - bk_app_code: app1\n    dimension: resource\n";
        assert!(PluginType::VerifiedUserExemptedApps.convert(yaml).is_err());

        let yaml = "exempted_apps:\n  - bk_app_code: app1\n    dimension: api\n";
        let out = PluginType::VerifiedUserExemptedApps.convert(yaml).unwrap();
        assert_eq!(out.config["exempted_apps"][0]["dimension"], "api");
    }
}
