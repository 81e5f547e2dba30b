//! Egress rule set: host allow-list, signing policy, and MCP header
//! injection rules.
//!
//! Rules are immutable snapshots swapped atomically on admin updates;
//! request handlers read the current snapshot once per request and
//! never see a half-applied update.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hostname pattern: exact (`pypi.org`), wildcard subdomain
/// (`*.amazonaws.com`), or wildcard suffix (`bedrock-runtime.*`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.trim().to_ascii_lowercase())
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if let Some(suffix) = self.0.strip_prefix("*.") {
            // `*.amazonaws.com` matches subdomains, not the apex.
            return host.ends_with(&format!(".{suffix}"));
        }
        if let Some(prefix) = self.0.strip_suffix(".*") {
            return host == prefix || host.starts_with(&format!("{prefix}."));
        }
        host == self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Ordered allow-list of host patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowList {
    patterns: Vec<HostPattern>,
}

impl AllowList {
    pub fn new(patterns: Vec<HostPattern>) -> Self {
        Self { patterns }
    }

    /// Parse a comma-separated pattern list from configuration.
    pub fn from_csv(csv: &str) -> Self {
        Self {
            patterns: csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(HostPattern::new)
                .collect(),
        }
    }

    pub fn allows(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }
}

/// One MCP header-injection rule: requests whose URL starts with
/// `url_prefix` get `headers` merged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpHeaderRule {
    pub url_prefix: String,
    pub headers: HashMap<String, String>,
}

/// Complete egress policy for one proxy instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub allow: AllowList,
    /// Hosts matching any of these patterns get SigV4 signing.
    pub signing_hosts: Vec<HostPattern>,
    /// Ordered header-injection rules; longest matching prefix wins.
    pub mcp_rules: Vec<McpHeaderRule>,
}

impl RuleSet {
    pub fn new(allow: AllowList, signing_hosts: Vec<HostPattern>) -> Self {
        Self {
            allow,
            signing_hosts,
            mcp_rules: Vec::new(),
        }
    }

    /// Build from the comma-separated configuration strings.
    pub fn from_config(domain_whitelist: &str, signing_hosts: &str) -> Self {
        Self {
            allow: AllowList::from_csv(domain_whitelist),
            signing_hosts: signing_hosts
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(HostPattern::new)
                .collect(),
            mcp_rules: Vec::new(),
        }
    }

    pub fn requires_signing(&self, host: &str) -> bool {
        self.signing_hosts.iter().any(|p| p.matches(host))
    }

    /// Longest-prefix match over the full request URL.
    pub fn mcp_headers_for(&self, url: &str) -> Option<&McpHeaderRule> {
        self.mcp_rules
            .iter()
            .filter(|rule| url.starts_with(&rule.url_prefix))
            .max_by_key(|rule| rule.url_prefix.len())
    }
}
