//! What triggers a release and how each trigger is carried out.

use serde::{Deserialize, Serialize};

/// The event that caused a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    VersionPublish,
    GatewayEnable,
    GatewayDisable,
    GatewayDelete,
    StageEnable,
    StageDisable,
    StageDelete,
    StageUpdate,
    BackendUpdate,
    PluginBind,
    PluginUpdate,
    PluginUnbind,
    LabelUpdate,
    CliSync,
}

impl TriggerSource {
    pub const ALL: [TriggerSource; 14] = [
        TriggerSource::VersionPublish,
        TriggerSource::GatewayEnable,
        TriggerSource::GatewayDisable,
        TriggerSource::GatewayDelete,
        TriggerSource::StageEnable,
        TriggerSource::StageDisable,
        TriggerSource::StageDelete,
        TriggerSource::StageUpdate,
        TriggerSource::BackendUpdate,
        TriggerSource::PluginBind,
        TriggerSource::PluginUpdate,
        TriggerSource::PluginUnbind,
        TriggerSource::LabelUpdate,
        TriggerSource::CliSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::VersionPublish => "version_publish",
            TriggerSource::GatewayEnable => "gateway_enable",
            TriggerSource::GatewayDisable => "gateway_disable",
            TriggerSource::GatewayDelete => "gateway_delete",
            TriggerSource::StageEnable => "stage_enable",
            TriggerSource::StageDisable => "stage_disable",
            TriggerSource::StageDelete => "stage_delete",
            TriggerSource::StageUpdate => "stage_update",
            TriggerSource::BackendUpdate => "backend_update",
            TriggerSource::PluginBind => "plugin_bind",
            TriggerSource::PluginUpdate => "plugin_update",
            TriggerSource::PluginUnbind => "plugin_unbind",
            TriggerSource::LabelUpdate => "label_update",
            TriggerSource::CliSync => "cli_sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn policy(&self) -> ReleasePolicy {
        match self {
            TriggerSource::GatewayDisable | TriggerSource::StageDisable => {
                ReleasePolicy::RevokeOnDisable
            }
            TriggerSource::GatewayDelete | TriggerSource::StageDelete => {
                ReleasePolicy::RevokeOnDelete
            }
            _ => ReleasePolicy::RollingUpdate,
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the orchestrator reacts to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    /// Re-release the current pointer of every affected stage.
    RollingUpdate,
    /// Clear the registry, keep the pointer for a later enable.
    RevokeOnDisable,
    /// Clear the registry and drop the pointer.
    RevokeOnDelete,
}

impl ReleasePolicy {
    pub fn is_revoke(&self) -> bool {
        !matches!(self, ReleasePolicy::RollingUpdate)
    }
}
