//! IP list parsing for `bk-ip-restriction`.
//!
//! IP lists are free text: one or more entries per line separated by
//! whitespace, with `#` starting a comment. Entries are single addresses or
//! CIDR blocks, IPv4 or IPv6.

use std::net::IpAddr;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::CompileError;

const PLUGIN: &str = "bk-ip-restriction";
/// Emitted in place of an empty list; never matches a real client.
pub const UNMATCHABLE_IP: &str = "255.255.255.255";

/// Whether listed IPs are allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpListMode {
    Allow,
    Deny,
}

impl IpListMode {
    fn config_key(&self) -> &'static str {
        match self {
            IpListMode::Allow => "whitelist",
            IpListMode::Deny => "blacklist",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IpRestrictionConfig {
    pub whitelist: Option<String>,
    pub blacklist: Option<String>,
}

/// Check a single address or CIDR block.
pub fn validate_entry(entry: &str) -> Result<(), CompileError> {
    let invalid = || CompileError::InvalidIpEntry(entry.to_string());
    let (addr, prefix) = match entry.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (entry, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Parse free text into entries, keeping the first occurrence of each.
pub fn parse_ip_content(content: &str, into: &mut Vec<String>) -> Result<(), CompileError> {
    for line in content.lines() {
        let line = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        };
        for entry in line.split_whitespace() {
            validate_entry(entry)?;
            if !into.iter().any(|e| e == entry) {
                into.push(entry.to_string());
            }
        }
    }
    Ok(())
}

/// Merge several free-text lists in order.
pub fn merge_ip_contents<'a>(
    contents: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<String>, CompileError> {
    let mut entries = Vec::new();
    for content in contents {
        parse_ip_content(content, &mut entries)?;
    }
    Ok(entries)
}

/// Registry config for a list; an empty list becomes the unmatchable sentinel.
pub fn render(mode: IpListMode, mut entries: Vec<String>) -> Value {
    if entries.is_empty() {
        entries.push(UNMATCHABLE_IP.to_string());
    }
    json!({ mode.config_key(): entries })
}

pub fn convert_plugin(config: IpRestrictionConfig) -> Result<Value, CompileError> {
    let (mode, content) = match (config.whitelist, config.blacklist) {
        (Some(list), None) => (IpListMode::Allow, list),
        (None, Some(list)) => (IpListMode::Deny, list),
        _ => {
            return Err(CompileError::invalid(
                PLUGIN,
                "exactly one of whitelist or blacklist is required",
            ))
        }
    };
    Ok(render(mode, merge_ip_contents([content.as_str()])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_duplicates_are_dropped() {
        let entries = merge_ip_contents([
            "# office\n10.0.0.1 10.0.0.0/24  # inline\n\n10.0.0.1\n",
            "::1\n2001:db8::/32",
        ])
        .unwrap();
        assert_eq!(entries, vec!["10.0.0.1", "10.0.0.0/24", "::1", "2001:db8::/32"]);
    }

    #[test]
    fn invalid_entries_are_rejected() {
        for bad in ["10.0.0.256", "10.0.0.0/33", "::1/129", "host.local", "1.2.3.4/x"] {
            assert!(
                matches!(validate_entry(bad), Err(CompileError::InvalidIpEntry(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn empty_list_becomes_sentinel() {
        let out = render(IpListMode::Allow, merge_ip_contents(["# nothing\n"]).unwrap());
        assert_eq!(out, json!({ "whitelist": ["255.255.255.255"] }));
    }

    #[test]
    fn plugin_needs_exactly_one_list() {
        let both = IpRestrictionConfig {
            whitelist: Some("1.1.1.1".into()),
            blacklist: Some("2.2.2.2".into()),
        };
        assert!(convert_plugin(both).is_err());
        assert!(convert_plugin(IpRestrictionConfig::default()).is_err());

        let deny = IpRestrictionConfig {
            whitelist: None,
            blacklist: Some("2.2.2.2\n".into()),
        };
        assert_eq!(convert_plugin(deny).unwrap(), json!({ "blacklist": ["2.2.2.2"] }));
    }
}
