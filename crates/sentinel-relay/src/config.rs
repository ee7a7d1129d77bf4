//! Pipeline configuration.
//!
//! Loaded from an optional YAML file:
//!
//! ```yaml
//! certstream: { enable: true, topics: [zdns], accept_update_types: [PrecertLogEntry] }
//! zdns:       { enable: true, ipv4: true, ipv6: false, tiers: [4hr, 24hr] }
//! zgrab:      { enable: true, tiers: [4hr, 8hr] }
//! monitor:    { storage: ".", name: "sentinel-stats", results: "sentinel-results" }
//! ```
//!
//! Missing sections leave their stage disabled.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Re-scan tier. Each tier is one reschedule delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "4hr")]
    FourHour,
    #[serde(rename = "8hr")]
    EightHour,
    #[serde(rename = "24hr")]
    TwentyFourHour,
}

impl Tier {
    /// Reschedule delay in seconds.
    pub const fn delay_secs(self) -> i64 {
        match self {
            Self::FourHour => 4 * 3600,
            Self::EightHour => 8 * 3600,
            Self::TwentyFourHour => 24 * 3600,
        }
    }

    /// Label used in topic and counter names.
    pub const fn label(self) -> &'static str {
        match self {
            Self::FourHour => "4hr",
            Self::EightHour => "8hr",
            Self::TwentyFourHour => "24hr",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn default_tiers() -> Vec<Tier> {
    vec![Tier::FourHour]
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub certstream: CertstreamConfig,
    pub zdns: ZdnsConfig,
    pub zgrab: ZgrabConfig,
    pub monitor: MonitorConfig,
}

/// Certificate intake stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertstreamConfig {
    pub enable: bool,
    /// Topics every relayed domain is published to.
    pub topics: Vec<String>,
    /// Certificate log entry types to relay. Empty relays every type.
    pub accept_update_types: Vec<String>,
}

impl Default for CertstreamConfig {
    fn default() -> Self {
        Self {
            enable: false,
            topics: vec!["zdns".to_string()],
            accept_update_types: vec!["PrecertLogEntry".to_string()],
        }
    }
}

/// DNS resolution stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZdnsConfig {
    pub enable: bool,
    /// Fan out IPv4 addresses to the probe tool.
    pub ipv4: bool,
    /// Fan out IPv6 addresses to the probe tool.
    pub ipv6: bool,
    pub tiers: Vec<Tier>,
}

impl Default for ZdnsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            ipv4: true,
            ipv6: false,
            tiers: default_tiers(),
        }
    }
}

/// Network probe stages.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZgrabConfig {
    pub enable: bool,
    pub tiers: Vec<Tier>,
}

impl Default for ZgrabConfig {
    fn default() -> Self {
        Self {
            enable: false,
            tiers: default_tiers(),
        }
    }
}

/// Store locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Directory holding both stores.
    pub storage: PathBuf,
    /// Counter store directory name.
    pub name: String,
    /// Result log directory name.
    pub results: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            storage: PathBuf::from("."),
            name: "sentinel-stats".to_string(),
            results: "sentinel-results".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML configuration text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check tier lists and topic names.
    pub fn validate(&self) -> Result<()> {
        if self.zdns.enable {
            validate_tiers("zdns", &self.zdns.tiers)?;
        }
        if self.zgrab.enable {
            validate_tiers("zgrab", &self.zgrab.tiers)?;
        }
        if self.certstream.enable && self.certstream.topics.is_empty() {
            return Err(Error::Config(
                "certstream.topics must name at least one topic".to_string(),
            ));
        }
        Ok(())
    }

    /// Enable every stage with default settings.
    pub fn all_enabled() -> Self {
        let mut config = Self::default();
        config.certstream.enable = true;
        config.zdns.enable = true;
        config.zgrab.enable = true;
        config
    }

    /// Counter store directory.
    pub fn counters_path(&self) -> PathBuf {
        self.monitor.storage.join(&self.monitor.name)
    }

    /// Result log directory.
    pub fn results_path(&self) -> PathBuf {
        self.monitor.storage.join(&self.monitor.results)
    }
}

fn validate_tiers(section: &str, tiers: &[Tier]) -> Result<()> {
    if tiers.is_empty() {
        return Err(Error::Config(format!("{section}.tiers must not be empty")));
    }
    let mut seen = HashSet::new();
    for tier in tiers {
        if !seen.insert(tier) {
            return Err(Error::Config(format!("{section}.tiers lists {tier} twice")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_delays() {
        assert_eq!(Tier::FourHour.delay_secs(), 14400);
        assert_eq!(Tier::EightHour.delay_secs(), 28800);
        assert_eq!(Tier::TwentyFourHour.delay_secs(), 86400);
        assert_eq!(Tier::TwentyFourHour.to_string(), "24hr");
    }

    #[test]
    fn test_full_yaml() {
        let config = PipelineConfig::from_yaml_str(
            r#"
certstream:
  enable: true
  topics: [zdns, zdns_backup]
zdns:
  enable: true
  ipv6: true
  tiers: [4hr, 24hr]
zgrab:
  enable: true
  tiers: [4hr, 8hr]
monitor:
  storage: /var/lib/sentinel
"#,
        )
        .unwrap();

        assert!(config.certstream.enable);
        assert_eq!(config.certstream.topics, vec!["zdns", "zdns_backup"]);
        assert_eq!(config.certstream.accept_update_types, vec!["PrecertLogEntry"]);
        assert!(config.zdns.ipv4);
        assert!(config.zdns.ipv6);
        assert_eq!(config.zdns.tiers, vec![Tier::FourHour, Tier::TwentyFourHour]);
        assert_eq!(config.zgrab.tiers, vec![Tier::FourHour, Tier::EightHour]);
        assert_eq!(
            config.counters_path(),
            PathBuf::from("/var/lib/sentinel/sentinel-stats")
        );
        assert_eq!(
            config.results_path(),
            PathBuf::from("/var/lib/sentinel/sentinel-results")
        );
    }

    #[test]
    fn test_missing_sections_are_disabled() {
        let config = PipelineConfig::from_yaml_str("zgrab: { enable: true }").unwrap();
        assert!(!config.certstream.enable);
        assert!(!config.zdns.enable);
        assert!(config.zgrab.enable);
        assert_eq!(config.zgrab.tiers, vec![Tier::FourHour]);
        assert_eq!(config.counters_path(), PathBuf::from("./sentinel-stats"));
    }

    #[test]
    fn test_rejects_bad_tiers() {
        let err = PipelineConfig::from_yaml_str("zdns: { enable: true, tiers: [] }").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err =
            PipelineConfig::from_yaml_str("zdns: { enable: true, tiers: [4hr, 4hr] }").unwrap_err();
        assert!(err.to_string().contains("twice"));

        let err = PipelineConfig::from_yaml_str("zgrab: { tiers: [2hr] }").unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = PipelineConfig::from_yaml_str(
            "zdns: { enable: true, topics: [zdns_4hr, zdns_24hr] }",
        )
        .unwrap_err();
        assert!(err.to_string().contains("topics"));

        assert!(PipelineConfig::from_yaml_str("zmap: { enable: true }").is_err());
        assert!(PipelineConfig::from_yaml_str("monitor: { storage: /tmp, db: x }").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.yaml");
        std::fs::write(&path, "certstream: { enable: true }\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert!(config.certstream.enable);

        assert!(PipelineConfig::load(dir.path().join("missing.yaml")).is_err());
    }
}
