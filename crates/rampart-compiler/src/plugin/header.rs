//! `bk-header-rewrite` normalization.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::CompileError;

const PLUGIN: &str = "bk-header-rewrite";

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderKey {
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeaderRewriteConfig {
    pub set: Vec<HeaderValue>,
    pub remove: Vec<HeaderKey>,
}

/// `x-request-ID ` becomes `X-Request-Id`.
pub fn canonical_header_key(key: &str) -> String {
    key.trim()
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn checked_key(raw: &str) -> Result<String, CompileError> {
    let key = canonical_header_key(raw);
    if key.is_empty() {
        return Err(CompileError::invalid(PLUGIN, "header key must not be empty"));
    }
    Ok(key)
}

pub fn convert(config: HeaderRewriteConfig) -> Result<Value, CompileError> {
    let mut set = Map::new();
    for header in &config.set {
        // later entries win
        set.insert(checked_key(&header.key)?, json!(header.value));
    }

    let mut remove: Vec<String> = Vec::new();
    for header in &config.remove {
        let key = checked_key(&header.key)?;
        if !remove.contains(&key) {
            remove.push(key);
        }
    }

    Ok(json!({ "set": set, "remove": remove }))
}
