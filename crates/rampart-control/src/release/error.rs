//! Errors of the release pipeline.

use rampart_compiler::CompileError;
use rampart_registry::RegistryError;
use uuid::Uuid;

use crate::db::{ScopeType, StoreError};

/// Why a release, revoke or binding call was refused or failed.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Bad input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("gateway {0} has no active data plane")]
    NoActiveDataPlane(Uuid),

    #[error("resource version uses legacy schema '{0}', regenerate it before releasing")]
    LegacySchema(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// A scope would hold a plugin config and an access strategy of the same plugin type.
    #[error("{scope_type} {scope_id} already has a {existing} binding producing plugin {plugin_type}")]
    BindingConflict {
        scope_type: ScopeType,
        scope_id: Uuid,
        plugin_type: String,
        existing: &'static str,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Compile(CompileError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReleaseError {
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        ReleaseError::NotFound { kind, id }
    }

    /// Domain errors that are recorded as a failed attempt rather than propagated.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ReleaseError::Validation(_)
                | ReleaseError::NoActiveDataPlane(_)
                | ReleaseError::LegacySchema(_)
                | ReleaseError::NotFound { .. }
        )
    }

    /// Whether a rollout failing with this error should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            ReleaseError::Registry(e) => e.is_transient(),
            ReleaseError::Store(StoreError::Database(_)) => true,
            _ => false,
        }
    }
}

/// Compile errors found while validating keep their kind.
impl From<CompileError> for ReleaseError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::LegacySchema(version) => ReleaseError::LegacySchema(version),
            CompileError::Registry(e) => ReleaseError::Registry(e),
            other => ReleaseError::Compile(other),
        }
    }
}
