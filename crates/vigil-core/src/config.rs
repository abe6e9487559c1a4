use crate::breaker::BreakerSettings;
use crate::error::{Result, VigilError};
use crate::freshness::FreshnessSla;
use crate::paths;
use crate::task::{RetryPolicy, ScheduledTask};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// How long a claim holds a task; must outlive the adapter timeout.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Running attempts older than this are failed on startup.
    #[serde(default = "default_recovery_max_age_secs")]
    pub recovery_max_age_secs: u64,
    #[serde(default = "default_expected_interval_hours")]
    pub expected_interval_hours: u64,
}

fn default_tick_secs() -> u64 {
    30
}

fn default_lease_secs() -> u64 {
    300
}

fn default_workers() -> usize {
    1
}

fn default_recovery_max_age_secs() -> u64 {
    3600
}

fn default_expected_interval_hours() -> u64 {
    24
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            lease_secs: default_lease_secs(),
            workers: default_workers(),
            recovery_max_age_secs: default_recovery_max_age_secs(),
            expected_interval_hours: default_expected_interval_hours(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn lease(&self) -> Duration {
        Duration::seconds(self.lease_secs as i64)
    }

    pub fn recovery_max_age(&self) -> Duration {
        Duration::seconds(self.recovery_max_age_secs as i64)
    }
}

// ---------------------------------------------------------------------------
// IntegrationSettings
// ---------------------------------------------------------------------------

/// Resilience settings for one integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSettings {
    #[serde(default = "default_true")]
    pub retry_enabled: bool,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub backoff_clamp_jitter: bool,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_reset_ms")]
    pub circuit_breaker_reset_ms: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_expected_interval_hours")]
    pub expected_interval_hours: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_reset_ms() -> u64 {
    600_000
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            max_retry_attempts: default_max_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_clamp_jitter: false,
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_reset_ms: default_breaker_reset_ms(),
            timeout_seconds: default_timeout_seconds(),
            expected_interval_hours: default_expected_interval_hours(),
        }
    }
}

impl IntegrationSettings {
    pub fn breaker(&self) -> BreakerSettings {
        BreakerSettings {
            threshold: self.circuit_breaker_threshold,
            reset_interval: Duration::milliseconds(self.circuit_breaker_reset_ms as i64),
            ..BreakerSettings::default()
        }
    }

    /// Retry policy stamped on tasks created for this integration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn expected_interval(&self) -> Duration {
        Duration::hours(self.expected_interval_hours.max(1) as i64)
    }
}

/// Per-integration overrides; unset fields fall back to `defaults`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_clamp_jitter: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_reset_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_interval_hours: Option<u64>,
}

impl SettingsOverrides {
    pub fn apply(&self, base: &IntegrationSettings) -> IntegrationSettings {
        IntegrationSettings {
            retry_enabled: self.retry_enabled.unwrap_or(base.retry_enabled),
            max_retry_attempts: self.max_retry_attempts.unwrap_or(base.max_retry_attempts),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(base.backoff_base_ms),
            backoff_max_ms: self.backoff_max_ms.unwrap_or(base.backoff_max_ms),
            backoff_clamp_jitter: self
                .backoff_clamp_jitter
                .unwrap_or(base.backoff_clamp_jitter),
            circuit_breaker_threshold: self
                .circuit_breaker_threshold
                .unwrap_or(base.circuit_breaker_threshold),
            circuit_breaker_reset_ms: self
                .circuit_breaker_reset_ms
                .unwrap_or(base.circuit_breaker_reset_ms),
            timeout_seconds: self.timeout_seconds.unwrap_or(base.timeout_seconds),
            expected_interval_hours: self
                .expected_interval_hours
                .unwrap_or(base.expected_interval_hours),
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderSpec / IntegrationConfig
// ---------------------------------------------------------------------------

/// How to reach an integration's provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSpec {
    /// Calls an HTTP endpoint; a 2xx response is a successful sync.
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        /// Environment variable holding a bearer token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_env: Option<String>,
    },
    /// Always returns the same result. Useful for smoke tests and demos.
    Fixed {
        #[serde(default)]
        items: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub provider: ProviderSpec,
    #[serde(flatten)]
    pub overrides: SettingsOverrides,
}

// ---------------------------------------------------------------------------
// AlertingConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default = "default_true")]
    pub alert_on_recovery: bool,
    /// 0 disables escalation.
    #[serde(default = "default_escalation_after_hours")]
    pub escalation_after_hours: u64,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub escalation_recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

fn default_escalation_after_hours() -> u64 {
    24
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            alert_on_recovery: true,
            escalation_after_hours: default_escalation_after_hours(),
            recipients: Vec::new(),
            escalation_recipients: Vec::new(),
            webhook_url: None,
        }
    }
}

impl AlertingConfig {
    pub fn escalation_after(&self) -> Option<Duration> {
        (self.escalation_after_hours > 0)
            .then(|| Duration::hours(self.escalation_after_hours as i64))
    }
}

// ---------------------------------------------------------------------------
// FreshnessConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    #[serde(default = "default_freshness_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub default_sla: FreshnessSla,
}

fn default_freshness_interval_secs() -> u64 {
    3600
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_freshness_interval_secs(),
            default_sla: FreshnessSla::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: IntegrationSettings,
    #[serde(default)]
    pub integrations: HashMap<String, IntegrationConfig>,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub freshness: FreshnessConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            scheduler: SchedulerConfig::default(),
            defaults: IntegrationSettings::default(),
            integrations: HashMap::new(),
            alerting: AlertingConfig::default(),
            freshness: FreshnessConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(VigilError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn integration(&self, id: &str) -> Result<&IntegrationConfig> {
        self.integrations
            .get(id)
            .ok_or_else(|| VigilError::UnknownIntegration(id.to_string()))
    }

    /// Effective settings for `id`. Unknown integrations get the defaults.
    pub fn settings_for(&self, id: &str) -> IntegrationSettings {
        match self.integrations.get(id) {
            Some(i) => i.overrides.apply(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.scheduler.tick_secs == 0 {
            warnings.push(ConfigWarning::error("scheduler.tick_secs must be > 0"));
        }
        if self.scheduler.workers == 0 {
            warnings.push(ConfigWarning::error("scheduler.workers must be > 0"));
        }

        check_settings("defaults", &self.defaults, self.scheduler.lease_secs, &mut warnings);

        let mut ids: Vec<&String> = self.integrations.keys().collect();
        ids.sort();
        for id in ids {
            if paths::validate_id(id).is_err() {
                warnings.push(ConfigWarning::error(format!(
                    "integration id '{id}' must be lowercase alphanumeric with hyphens"
                )));
            }
            let integration = &self.integrations[id];
            if let ProviderSpec::Http { url, .. } = &integration.provider {
                if url.trim().is_empty() {
                    warnings.push(ConfigWarning::error(format!(
                        "integration '{id}' has an empty provider url"
                    )));
                }
            }
            let effective = integration.overrides.apply(&self.defaults);
            check_settings(
                &format!("integrations.{id}"),
                &effective,
                self.scheduler.lease_secs,
                &mut warnings,
            );
        }

        if self.alerting.escalation_after_hours > 0 && self.alerting.escalation_recipients.is_empty()
        {
            warnings.push(ConfigWarning::warning(
                "escalation is enabled but alerting.escalation_recipients is empty",
            ));
        }

        let sla = &self.freshness.default_sla;
        if sla.max_age_days == 0 {
            warnings.push(ConfigWarning::error("freshness.default_sla.max_age_days must be > 0"));
        }
        if sla.warning_days > sla.critical_days || sla.critical_days > sla.max_age_days {
            warnings.push(ConfigWarning::warning(format!(
                "freshness.default_sla thresholds out of order: warning {} / critical {} / max {}",
                sla.warning_days, sla.critical_days, sla.max_age_days
            )));
        }

        warnings
    }

    /// Tasks that reference integrations missing from the config.
    pub fn validate_tasks(&self, tasks: &[ScheduledTask]) -> Vec<ConfigWarning> {
        tasks
            .iter()
            .filter(|t| !self.integrations.contains_key(&t.integration_id))
            .map(|t| {
                ConfigWarning::error(format!(
                    "task {} references unknown integration '{}'",
                    t.id, t.integration_id
                ))
            })
            .collect()
    }
}

fn check_settings(
    scope: &str,
    s: &IntegrationSettings,
    lease_secs: u64,
    warnings: &mut Vec<ConfigWarning>,
) {
    if s.circuit_breaker_threshold == 0 {
        warnings.push(ConfigWarning::error(format!(
            "{scope}.circuit_breaker_threshold must be > 0"
        )));
    }
    if s.timeout_seconds == 0 {
        warnings.push(ConfigWarning::error(format!("{scope}.timeout_seconds must be > 0")));
    }
    if s.backoff_base_ms > s.backoff_max_ms {
        warnings.push(ConfigWarning::warning(format!(
            "{scope}: backoff_base_ms ({}) exceeds backoff_max_ms ({})",
            s.backoff_base_ms, s.backoff_max_ms
        )));
    }
    if s.timeout_seconds >= lease_secs {
        warnings.push(ConfigWarning::warning(format!(
            "{scope}: timeout_seconds ({}) is not below scheduler.lease_secs ({lease_secs}); \
             a slow attempt can outlive its claim",
            s.timeout_seconds
        )));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn http(url: &str) -> IntegrationConfig {
        IntegrationConfig {
            provider: ProviderSpec::Http {
                url: url.to_string(),
                method: default_method(),
                headers: BTreeMap::new(),
                token_env: None,
            },
            overrides: SettingsOverrides::default(),
        }
    }

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.alerting.escalation_recipients = vec!["oncall@example.com".into()];
        cfg.integrations.insert("github".into(), http("https://api.example.com/sync"));
        cfg
    }

    #[test]
    fn empty_yaml_gets_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.scheduler.tick_secs, 30);
        assert_eq!(cfg.defaults.circuit_breaker_threshold, 5);
        assert_eq!(cfg.defaults.circuit_breaker_reset_ms, 600_000);
        assert_eq!(cfg.defaults.timeout_seconds, 30);
        assert!(cfg.alerting.alert_on_recovery);
        assert_eq!(cfg.freshness.default_sla.max_age_days, 90);
    }

    #[test]
    fn overrides_flatten_into_integration() {
        let yaml = r#"
integrations:
  jira:
    provider:
      type: http
      url: https://jira.example.com/api/sync
    circuit_breaker_threshold: 2
    retry_enabled: false
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let s = cfg.settings_for("jira");
        assert_eq!(s.circuit_breaker_threshold, 2);
        assert!(!s.retry_enabled);
        assert_eq!(s.backoff_base_ms, 1000);
        assert_eq!(cfg.settings_for("missing"), cfg.defaults);
    }

    #[test]
    fn fixed_provider_yaml_tagged() {
        let spec = ProviderSpec::Fixed {
            items: 3,
            error_code: Some(503),
            error_message: Some("maintenance".into()),
        };
        let yaml = serde_yaml::to_string(&spec).unwrap();
        assert!(yaml.contains("type: fixed"));
        let parsed: ProviderSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cfg = valid();
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert!(loaded.integrations.contains_key("github"));
    }

    #[test]
    fn load_without_init_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(VigilError::NotInitialized)
        ));
    }

    #[test]
    fn validate_valid_config_no_warnings() {
        assert!(valid().validate().is_empty());
    }

    #[test]
    fn validate_flags_bad_thresholds() {
        let mut cfg = valid();
        cfg.defaults.circuit_breaker_threshold = 0;
        cfg.defaults.backoff_base_ms = 500_000;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("defaults.circuit_breaker_threshold")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("backoff_base_ms")));
    }

    #[test]
    fn validate_flags_missing_escalation_recipients() {
        let mut cfg = valid();
        cfg.alerting.escalation_recipients.clear();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("escalation_recipients")));
        cfg.alerting.escalation_after_hours = 0;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn validate_tasks_flags_unknown_integration() {
        let cfg = valid();
        let ok = ScheduledTask::new(
            "github",
            None,
            crate::task::Frequency::Hourly,
            RetryPolicy::default(),
            Utc::now(),
        );
        let orphan = ScheduledTask::new(
            "salesforce",
            None,
            crate::task::Frequency::Hourly,
            RetryPolicy::default(),
            Utc::now(),
        );
        let warnings = cfg.validate_tasks(&[ok, orphan]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("salesforce"));
    }
}
