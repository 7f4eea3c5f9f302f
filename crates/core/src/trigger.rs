//! Ingestion triggers and the allow-lists that gate them.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SluiceError;

/// Integration kind (`jira`, `github`, `snyk`, ...). Stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationType(String);

impl IntegrationType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntegrationType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Desired ingestion schedule for one integration, owned by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionTrigger {
    pub trigger_id: String,
    pub tenant_id: String,
    pub integration_id: String,
    pub trigger_type: IntegrationType,
    /// Polling frequency in minutes. Zero or negative disables the trigger.
    pub frequency: i32,
}

impl IngestionTrigger {
    pub fn is_enabled(&self) -> bool {
        self.frequency > 0
    }

    pub fn whitelist_key(&self) -> WhitelistEntry {
        WhitelistEntry::new(&self.tenant_id, &self.integration_id)
    }
}

// ── Whitelists ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub tenant_id: String,
    pub integration_id: String,
}

impl WhitelistEntry {
    pub fn new(tenant_id: &str, integration_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            integration_id: integration_id.to_string(),
        }
    }

    /// Parse one `tenant::integration` entry.
    pub fn parse(raw: &str) -> Result<Self, SluiceError> {
        let (tenant, integration) = raw
            .trim()
            .split_once("::")
            .ok_or_else(|| SluiceError::InvalidWhitelistEntry(raw.to_string()))?;
        let (tenant, integration) = (tenant.trim(), integration.trim());
        if tenant.is_empty() || integration.is_empty() {
            return Err(SluiceError::InvalidWhitelistEntry(raw.to_string()));
        }
        Ok(Self::new(tenant, integration))
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.tenant_id, self.integration_id)
    }
}

/// Parse a comma-separated `tenant::integration` list.
///
/// Blank items are ignored; malformed items are logged and skipped.
pub fn parse_integration_whitelist(raw: &str) -> HashSet<WhitelistEntry> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match WhitelistEntry::parse(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(entry = item, error = %e, "skipping malformed whitelist entry");
                None
            }
        })
        .collect()
}

/// Parse a comma-separated trigger-type list.
pub fn parse_trigger_type_whitelist(raw: &str) -> HashSet<IntegrationType> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(IntegrationType::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_type_is_normalized() {
        assert_eq!(IntegrationType::new(" GitHub "), IntegrationType::new("github"));
        assert_eq!(IntegrationType::from("JIRA").as_str(), "jira");
    }

    #[test]
    fn parses_whitelist_entries() {
        let set = parse_integration_whitelist("1::i1, 2::i2,,bad, ::x");
        assert_eq!(set.len(), 2);
        assert!(set.contains(&WhitelistEntry::new("1", "i1")));
        assert!(set.contains(&WhitelistEntry::new("2", "i2")));
    }

    #[test]
    fn entry_display_round_trips() {
        let entry = WhitelistEntry::new("acme", "42");
        assert_eq!(WhitelistEntry::parse(&entry.to_string()).unwrap(), entry);
    }

    #[test]
    fn non_positive_frequency_disables_trigger() {
        let mut trigger = IngestionTrigger {
            trigger_id: "t".into(),
            tenant_id: "acme".into(),
            integration_id: "1".into(),
            trigger_type: "jira".into(),
            frequency: 0,
        };
        assert!(!trigger.is_enabled());
        trigger.frequency = -10;
        assert!(!trigger.is_enabled());
        trigger.frequency = 15;
        assert!(trigger.is_enabled());
    }

    #[test]
    fn trigger_type_whitelist_lowercases() {
        let set = parse_trigger_type_whitelist("Jira, github");
        assert!(set.contains(&IntegrationType::new("jira")));
        assert!(set.contains(&IntegrationType::new("github")));
    }
}
