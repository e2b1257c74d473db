//! CORS normalization.
//!
//! Origins containing `*` cannot be matched literally by the data plane, so a
//! single wildcard origin turns the whole origin set into anchored regexes.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::CompileError;

const PLUGIN: &str = "bk-cors";
/// Allow-all token understood by the data plane even with credentials.
pub const ALLOW_ALL: &str = "**";
/// Value that matches no origin, used when only regexes apply.
pub const NO_ORIGIN: &str = "null";
pub const DEFAULT_MAX_AGE: u32 = 86400;

/// `bk-cors` plugin config as written by users.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allow_origins: String,
    pub allow_origins_by_regex: Vec<String>,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub max_age: Option<u32>,
    pub allow_credential: bool,
}

/// Normalized CORS input shared by the plugin and the legacy strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorsRules {
    pub origins: Vec<String>,
    pub origin_regexes: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub expose_headers: Vec<String>,
    pub max_age: Option<u32>,
    pub allow_credential: bool,
}

impl From<CorsConfig> for CorsRules {
    fn from(c: CorsConfig) -> Self {
        CorsRules {
            origins: split_list(&c.allow_origins),
            origin_regexes: c.allow_origins_by_regex,
            methods: split_list(&c.allow_methods),
            headers: split_list(&c.allow_headers),
            expose_headers: split_list(&c.expose_headers),
            max_age: c.max_age,
            allow_credential: c.allow_credential,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Turn a wildcard origin into an anchored regex.
pub fn origin_to_regex(origin: &str) -> String {
    let mut out = String::with_capacity(origin.len() + 8);
    out.push('^');
    for c in origin.chars() {
        match c {
            '.' | '-' | '[' | ']' => {
                out.push('\\');
                out.push(c);
            }
            '*' => out.push_str(".*"),
            _ => out.push(c),
        }
    }
    out.push('$');
    out
}

fn render_list(items: &[String], allow_credential: bool, default: &str) -> String {
    if items.is_empty() {
        return default.to_string();
    }
    if items.iter().any(|i| i == "*") {
        return if allow_credential { ALLOW_ALL } else { "*" }.to_string();
    }
    items.join(",")
}

/// Render the registry config for a set of CORS rules.
pub fn convert(rules: CorsRules) -> Result<Value, CompileError> {
    let origins = dedup(rules.origins);
    let mut regexes = dedup(rules.origin_regexes);

    let allow_origins = if origins.len() == 1 && origins[0] == "*" {
        ALLOW_ALL.to_string()
    } else if origins.iter().any(|o| o.contains('*')) {
        let promoted: Vec<String> = origins.iter().map(|o| origin_to_regex(o)).collect();
        regexes = dedup(promoted.into_iter().chain(regexes).collect());
        NO_ORIGIN.to_string()
    } else if origins.is_empty() {
        NO_ORIGIN.to_string()
    } else {
        origins.join(",")
    };

    for re in &regexes {
        regex_lite::Regex::new(re)
            .map_err(|e| CompileError::invalid(PLUGIN, format!("origin regex '{re}': {e}")))?;
    }

    let mut config = Map::new();
    config.insert("allow_origins".into(), json!(allow_origins));
    if !regexes.is_empty() {
        config.insert("allow_origins_by_regex".into(), json!(regexes));
    }
    config.insert(
        "allow_methods".into(),
        json!(render_list(&dedup(rules.methods), rules.allow_credential, "*")),
    );
    config.insert(
        "allow_headers".into(),
        json!(render_list(&dedup(rules.headers), rules.allow_credential, "*")),
    );
    let expose = dedup(rules.expose_headers);
    if !expose.is_empty() {
        config.insert(
            "expose_headers".into(),
            json!(render_list(&expose, rules.allow_credential, "")),
        );
    }
    config.insert(
        "max_age".into(),
        json!(rules.max_age.unwrap_or(DEFAULT_MAX_AGE)),
    );
    config.insert("allow_credential".into(), json!(rules.allow_credential));
    Ok(Value::Object(config))
}
