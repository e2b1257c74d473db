use thiserror::Error;

/// Errors produced by registry backends.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store could not be reached. Nothing was applied.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The same key appeared twice in one sync generation.
    #[error("duplicate registry key in sync input: {0}")]
    DuplicateKey(String),

    /// A stored object did not have the kind the caller asked for.
    #[error("expected a {expected} object, found {found}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// Encoding or decoding a resource body failed.
    #[error("resource codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Non-transient backend failure.
    #[error("registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Unavailable(_))
    }
}
