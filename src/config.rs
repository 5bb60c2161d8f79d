use crate::policy_store::PolicyAction;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub database_path: String,
    pub policy_cache_size: usize,
    pub threat_retention_days: i64,
    pub storage: StorageConfig,
    pub fail_safe: FailSafeConfig,
    pub anomaly: AnomalyConfig,
    pub frequency: FrequencyConfig,
    pub phishing: PhishingConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            database_path: "sentinel/policy_graph.db".to_string(),
            policy_cache_size: 1000,
            threat_retention_days: 30,
            storage: StorageConfig::default(),
            fail_safe: FailSafeConfig::default(),
            anomaly: AnomalyConfig::default(),
            frequency: FrequencyConfig::default(),
            phishing: PhishingConfig::default(),
        }
    }
}

impl SentinelConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: SentinelConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Falls back to defaults when the file is missing or unreadable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!(
                    "Using default Sentinel configuration ({}): {:#}",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.retry.max_attempts == 0 {
            anyhow::bail!("storage.retry.max_attempts must be at least 1");
        }
        if self.frequency.sample_size < 2 {
            anyhow::bail!("frequency.sample_size must be at least 2");
        }
        if !(0.0..=1.0).contains(&self.phishing.detection_threshold) {
            anyhow::bail!("phishing.detection_threshold must be within [0, 1]");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub lock_timeout_ms: u64,
    /// Idle read-only connections kept open for lookups on file-backed stores.
    pub reader_connections: usize,
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 250,
            reader_connections: 4,
            retry: RetryConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }
}

/// Actions applied while the policy store cannot be trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailSafeConfig {
    pub download_action: PolicyAction,
    pub credential_action: PolicyAction,
    pub navigation_action: PolicyAction,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            download_action: PolicyAction::Quarantine,
            credential_action: PolicyAction::WarnUser,
            navigation_action: PolicyAction::WarnUser,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub hidden_ratio_weight: f64,
    pub hidden_ratio_floor: f64,
    pub hidden_ratio_band: f64,
    pub hidden_ratio_noise: f64,
    pub field_count_weight: f64,
    pub field_count_floor: usize,
    pub field_count_mid: usize,
    pub field_count_high: usize,
    pub field_count_noise: f64,
    pub action_domain_weight: f64,
    pub action_domain_noise: f64,
    pub action_domain_max_length: usize,
    pub suspicious_action_keywords: Vec<String>,
    /// Top-level labels that mark an action host as suspicious.
    pub suspicious_action_tlds: Vec<String>,
    pub frequency_weight: f64,
    pub frequency_noise: f64,
    pub escalation_threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            hidden_ratio_weight: 0.3,
            hidden_ratio_floor: 0.3,
            hidden_ratio_band: 0.5,
            hidden_ratio_noise: 0.5,
            field_count_weight: 0.2,
            field_count_floor: 15,
            field_count_mid: 25,
            field_count_high: 50,
            field_count_noise: 0.7,
            action_domain_weight: 0.3,
            action_domain_noise: 0.5,
            action_domain_max_length: 40,
            suspicious_action_keywords: [
                "data-collect",
                "analytics",
                "tracking",
                "logger",
                "harvester",
                "phishing",
                "fake-",
                "scam",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            suspicious_action_tlds: ["tk", "ml", "ga", "cf", "gq"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            frequency_weight: 0.2,
            frequency_noise: 0.8,
            escalation_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConfig {
    pub max_timestamps: usize,
    pub window_seconds: u64,
    pub sample_size: usize,
    pub burst_interval_ms: u64,
    pub rapid_interval_ms: u64,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            max_timestamps: 10,
            window_seconds: 5,
            sample_size: 4,
            burst_interval_ms: 1000,
            rapid_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhishingConfig {
    pub detection_threshold: f64,
    pub max_typo_distance: usize,
    pub min_subdomains_for_abuse: usize,
    /// Shannon entropy (bits per character) above which a name looks generated.
    pub entropy_threshold: f64,
    /// Domain names shorter than this many characters are flagged.
    pub min_domain_name_length: usize,
}

impl Default for PhishingConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.3,
            max_typo_distance: 3,
            min_subdomains_for_abuse: 3,
            entropy_threshold: 3.5,
            min_domain_name_length: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
database_path: /tmp/sentinel.db
fail_safe:
  download_action: block
anomaly:
  hidden_ratio_noise: 0.4
"#;
        let config: SentinelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database_path, "/tmp/sentinel.db");
        assert_eq!(config.fail_safe.download_action, PolicyAction::Block);
        assert_eq!(config.fail_safe.credential_action, PolicyAction::WarnUser);
        assert_eq!(config.anomaly.hidden_ratio_noise, 0.4);
        assert_eq!(config.anomaly.hidden_ratio_weight, 0.3);
        assert_eq!(config.frequency.max_timestamps, 10);
    }

    #[test]
    fn test_load_from_file_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.yaml");
        SentinelConfig::default().to_file(&path).unwrap();

        let loaded = SentinelConfig::load(&path).unwrap();
        assert_eq!(loaded.storage.lock_timeout_ms, 250);
        assert_eq!(loaded.phishing.max_typo_distance, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage:\n  retry:\n    max_attempts: 0").unwrap();
        assert!(SentinelConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_download_fail_safe_defaults_to_quarantine() {
        let config = SentinelConfig::default();
        assert_eq!(config.fail_safe.download_action, PolicyAction::Quarantine);
        assert_eq!(config.fail_safe.navigation_action, PolicyAction::WarnUser);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = SentinelConfig::load_or_default("/nonexistent/sentinel.yaml");
        assert_eq!(config.policy_cache_size, 1000);
    }
}
