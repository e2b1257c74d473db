//! Rows the control plane reads and writes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rampart_compiler::{ResourceSnapshot, ResourceVersionData, StageBackend, StageConfig};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::StoreError;
use crate::binding::BindingSource;
use crate::release::TriggerSource;

/// Implements `as_str`, `FromStr` and `Display` for a text-backed enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Lifecycle status shared by gateways, stages and data planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Inactive,
}

text_enum!(Status { Active => "active", Inactive => "inactive" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: Uuid,
    pub name: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub backends: Vec<StageBackend>,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn to_config(&self) -> StageConfig {
        StageConfig {
            id: self.id,
            name: self.name.clone(),
            vars: self.vars.clone(),
            backends: self.backends.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub version: String,
    pub schema_version: String,
    pub resources: Vec<ResourceSnapshot>,
    pub created_at: DateTime<Utc>,
}

impl ResourceVersion {
    pub fn to_data(&self) -> ResourceVersionData {
        ResourceVersionData {
            id: self.id,
            version: self.version.clone(),
            schema_version: self.schema_version.clone(),
            resources: self.resources.clone(),
        }
    }
}

/// Where a data plane's registry lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum RegistryBackendConfig {
    /// Process-local registry, one per data plane.
    Memory,
    /// `registry_resources` table in a PostgreSQL database.
    Postgres {
        url: String,
        /// Separates data planes sharing one database; defaults to the data plane id.
        #[serde(default)]
        namespace: Option<Uuid>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPlane {
    pub id: Uuid,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub is_recommend: bool,
    pub key_prefix: String,
    pub registry: RegistryBackendConfig,
    pub created_at: DateTime<Utc>,
}

/// The resource version currently published on a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    pub resource_version_id: Uuid,
    pub comment: String,
    pub operator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Doing,
    Success,
    Failure,
}

text_enum!(HistoryStatus {
    Doing => "doing",
    Success => "success",
    Failure => "failure",
});

impl HistoryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Doing)
    }
}

/// Audit record of one release attempt against one data plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseHistory {
    /// Time-ordered (v7), so a larger id is a later attempt.
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    /// Absent for revocations.
    pub resource_version_id: Option<Uuid>,
    /// Absent when no data plane was bound.
    pub data_plane_id: Option<Uuid>,
    pub source: TriggerSource,
    pub status: HistoryStatus,
    pub operator: String,
    pub comment: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Last history successfully applied to a data plane for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPlaneReleaseState {
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    pub data_plane_id: Uuid,
    pub release_history_id: Uuid,
    pub resource_version_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// What a plugin or access strategy is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Stage,
    Resource,
    BackendService,
}

text_enum!(ScopeType {
    Stage => "stage",
    Resource => "resource",
    BackendService => "backend_service",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub name: String,
    pub plugin_type: String,
    /// YAML body.
    pub config: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginBinding {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub scope_type: ScopeType,
    pub scope_id: Uuid,
    pub config_id: Uuid,
    pub plugin_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessStrategy {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub name: String,
    pub strategy_type: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessStrategyBinding {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub scope_type: ScopeType,
    pub scope_id: Uuid,
    pub access_strategy_id: Uuid,
    pub strategy_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpGroup {
    pub id: Uuid,
    pub gateway_id: Uuid,
    pub name: String,
    pub ips: String,
}

impl IpGroup {
    pub fn to_compiler(&self) -> rampart_compiler::IpGroup {
        rampart_compiler::IpGroup {
            id: self.id,
            name: self.name.clone(),
            ips: self.ips.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Compile the release and sync it.
    Rollout,
    /// Sync an empty set.
    Revoke,
}

text_enum!(JobKind { Rollout => "rollout", Revoke => "revoke" });

/// A deferred registry write, committed with the history it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub gateway_id: Uuid,
    pub stage_id: Uuid,
    pub data_plane_id: Uuid,
    pub release_history_id: Uuid,
    pub attempt_id: Uuid,
    pub resource_version_id: Option<Uuid>,
    pub operator: String,
    pub comment: String,
    /// Failed runs so far.
    pub attempts: u32,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// How a commit treats the stage's release pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum PointerChange {
    Keep,
    Upsert(Release),
    Remove { gateway_id: Uuid, stage_id: Uuid },
}

/// Everything written by one release call, in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseCommit {
    pub pointer: PointerChange,
    pub histories: Vec<ReleaseHistory>,
    pub jobs: Vec<OutboxJob>,
}

impl ReleaseCommit {
    /// Audit rows only.
    pub fn histories(histories: Vec<ReleaseHistory>) -> Self {
        Self {
            pointer: PointerChange::Keep,
            histories,
            jobs: Vec::new(),
        }
    }
}

/// Binding rows to upsert and delete for one source, in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingChanges {
    pub gateway_id: Uuid,
    pub source: BindingSource,
    pub scope_type: ScopeType,
    /// Bound to the source, replacing any binding of the same type.
    pub upsert: Vec<Uuid>,
    /// Unbound from the source.
    pub delete: Vec<Uuid>,
    /// Type codes of the other source kind that produce the same plugin.
    pub conflicting_codes: Vec<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip() {
        for s in [ScopeType::Stage, ScopeType::Resource, ScopeType::BackendService] {
            assert_eq!(s.as_str().parse::<ScopeType>().unwrap(), s);
        }
        assert_eq!("failure".parse::<HistoryStatus>().unwrap(), HistoryStatus::Failure);
        assert!("paused".parse::<HistoryStatus>().is_err());
    }

    #[test]
    fn registry_config_is_tagged() {
        let config: RegistryBackendConfig = serde_json::from_value(serde_json::json!({
            "backend": "postgres",
            "url": "postgres://localhost/registry"
        }))
        .unwrap();
        assert_eq!(
            config,
            RegistryBackendConfig::Postgres {
                url: "postgres://localhost/registry".into(),
                namespace: None
            }
        );
    }

    #[test]
    fn only_doing_is_open() {
        assert!(!HistoryStatus::Doing.is_terminal());
        assert!(HistoryStatus::Success.is_terminal());
    }
}
