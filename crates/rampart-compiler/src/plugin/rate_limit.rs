//! `bk-rate-limit` validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CompileError;

const PLUGIN: &str = "bk-rate-limit";
/// Key applied to apps without an explicit rate.
pub const DEFAULT_APP_KEY: &str = "__default";
/// Periods (seconds) the data plane can count over.
pub const ALLOWED_PERIODS: [u32; 4] = [1, 60, 3600, 86400];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub tokens: u64,
    pub period: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// App code (or `__default`) to its rates.
    #[serde(default)]
    pub rates: BTreeMap<String, Vec<Rate>>,
}

pub fn convert(config: RateLimitConfig) -> Result<Value, CompileError> {
    if config.rates.is_empty() {
        return Err(CompileError::invalid(PLUGIN, "at least one rate is required"));
    }
    for (app, rates) in &config.rates {
        if app.trim().is_empty() {
            return Err(CompileError::invalid(PLUGIN, "app code must not be empty"));
        }
        for rate in rates {
            if rate.tokens == 0 {
                return Err(CompileError::invalid(
                    PLUGIN,
                    format!("tokens for '{app}' must be positive"),
                ));
            }
            if !ALLOWED_PERIODS.contains(&rate.period) {
                return Err(CompileError::invalid(
                    PLUGIN,
                    format!(
                        "period {} for '{app}' must be one of {ALLOWED_PERIODS:?}",
                        rate.period
                    ),
                ));
            }
        }
    }
    Ok(serde_json::to_value(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str) -> RateLimitConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn valid_rates_pass_through() {
        let out = convert(parse(
            "rates:\n  __default:\n    - tokens: 100\n      period: 60\n  app-a:\n    - tokens: 5\n      period: 1\n",
        ))
        .unwrap();
        assert_eq!(out["rates"]["__default"], json!([{ "tokens": 100, "period": 60 }]));
        assert_eq!(out["rates"]["app-a"][0]["period"], 1);
    }

    #[test]
    fn odd_period_is_rejected() {
        let err = convert(parse("rates:\n  __default:\n    - tokens: 1\n      period: 30\n"))
            .unwrap_err();
        assert!(err.to_string().contains("period 30"));
    }

    #[test]
    fn zero_tokens_is_rejected() {
        assert!(convert(parse("rates:\n  a:\n    - tokens: 0\n      period: 1\n")).is_err());
    }

    #[test]
    fn empty_rates_are_rejected() {
        assert!(convert(RateLimitConfig::default()).is_err());
    }
}
