use thiserror::Error;
use uuid::Uuid;

/// Errors produced while converting configuration into registry objects.
#[derive(Debug, Error)]
pub enum CompileError {
    /// No convertor exists for this plugin type code.
    #[error("unknown plugin type: {0}")]
    UnknownPluginType(String),

    /// No convertor exists for this access strategy type code.
    #[error("unknown access strategy type: {0}")]
    UnknownAccessStrategyType(String),

    /// A plugin or strategy configuration could not be parsed or is out of range.
    #[error("invalid {plugin} config: {reason}")]
    InvalidPluginConfig { plugin: String, reason: String },

    /// An IP list entry is neither an address nor a CIDR block.
    #[error("invalid IP entry: {0}")]
    InvalidIpEntry(String),

    /// An access strategy references an IP group that does not exist.
    #[error("IP group {0} not found")]
    MissingIpGroup(Uuid),

    /// The resource version was generated with an older schema.
    #[error(
        "resource version schema {0} is no longer supported, regenerate the resource version and release again"
    )]
    LegacySchema(String),

    /// A proxy path references a stage variable the stage does not define.
    #[error("resource '{resource}' uses undefined stage variable '{var}'")]
    UndefinedStageVar { resource: String, var: String },

    /// A resource proxies to a backend the stage does not configure.
    #[error("resource '{resource}' references backend {backend_id} which is not configured on the stage")]
    MissingBackend { resource: String, backend_id: Uuid },

    /// A stage backend cannot be turned into an upstream.
    #[error("backend '{backend}' is invalid: {reason}")]
    InvalidBackend { backend: String, reason: String },

    /// The same plugin type is bound twice on one scope.
    #[error("plugin '{plugin}' is bound more than once on {scope}")]
    DuplicatePlugin { scope: String, plugin: String },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Registry object encoding error.
    #[error(transparent)]
    Registry(#[from] rampart_registry::RegistryError),
}

impl CompileError {
    pub(crate) fn invalid(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::InvalidPluginConfig {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}
