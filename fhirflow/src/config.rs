//! Pipeline configuration.
//!
//! Loaded from TOML or JSON, then adjusted from `FHIRFLOW_*` environment
//! variables:
//!
//! | variable | field |
//! |---|---|
//! | `FHIRFLOW_MAX_CONCURRENCY` | `max_concurrency` (`0` or `unbounded` clears the cap) |
//! | `FHIRFLOW_STAGE_TIMEOUT_SECONDS` | `stage_timeout_seconds` |
//! | `FHIRFLOW_LOG` | `logging.filter` |
//! | `FHIRFLOW_LOG_JSON` | `logging.json` |

use crate::core::{ErrorKind, StageName};
use crate::errors::ConfigError;
use crate::pipeline::{BackoffStrategy, JitterStrategy, RetryPolicy, RetryRule, StageChain};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Filter used when none is configured.
pub const DEFAULT_LOG_FILTER: &str = "fhirflow=info";

/// Logging setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// One configured retry rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRuleConfig {
    /// Stage the rule applies to.
    pub stage: StageName,
    /// Error kind names the rule covers.
    pub error_kinds: Vec<ErrorKind>,
    /// Maximum retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    /// Base delay for the backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Delay cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
    /// Use the stage's backoff hint when present.
    #[serde(default)]
    pub honor_backoff_hint: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryRuleConfig {
    /// Converts into a policy rule.
    #[must_use]
    pub fn to_rule(&self) -> RetryRule {
        let mut rule = RetryRule::new(self.error_kinds.iter().cloned())
            .with_max_retries(self.max_retries)
            .with_base_delay_ms(self.base_delay_ms)
            .with_max_delay_ms(self.max_delay_ms)
            .with_backoff(self.backoff)
            .with_jitter(self.jitter)
            .with_backoff_hint(self.honor_backoff_hint);
        if let Some(initial) = self.initial_delay_ms {
            rule = rule.with_initial_delay_ms(initial);
        }
        rule
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum items processed at once; unbounded when unset.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Timeout of a single stage invocation in seconds.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: f64,
    /// Stage order.
    #[serde(default)]
    pub chain: StageChain,
    /// Keep the built-in Persist rate-limit rule.
    #[serde(default = "default_true")]
    pub default_retry_rules: bool,
    /// Additional retry rules; they take precedence over the built-in rule.
    #[serde(default)]
    pub retry_rules: Vec<RetryRuleConfig>,
    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_stage_timeout() -> f64 {
    300.0
}

const fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            stage_timeout_seconds: default_stage_timeout(),
            chain: StageChain::default(),
            default_retry_rules: true,
            retry_rules: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency cap.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Sets the stage timeout.
    #[must_use]
    pub fn with_stage_timeout_seconds(mut self, seconds: f64) -> Self {
        self.stage_timeout_seconds = seconds;
        self
    }

    /// Adds a retry rule.
    #[must_use]
    pub fn with_retry_rule(mut self, rule: RetryRuleConfig) -> Self {
        self.retry_rules.push(rule);
        self
    }

    /// Parses a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a JSON document.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a file; `.toml` and `.json` select the format.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Loads `path` and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_path(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies `FHIRFLOW_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FHIRFLOW_MAX_CONCURRENCY") {
            let value = value.trim();
            self.max_concurrency = if value == "0" || value.eq_ignore_ascii_case("unbounded") {
                None
            } else {
                Some(value.parse().map_err(|_| {
                    ConfigError::invalid(
                        "FHIRFLOW_MAX_CONCURRENCY",
                        format!("not a count: {value}"),
                    )
                })?)
            };
        }

        if let Some(value) = lookup("FHIRFLOW_STAGE_TIMEOUT_SECONDS") {
            self.stage_timeout_seconds = value.trim().parse().map_err(|_| {
                ConfigError::invalid(
                    "FHIRFLOW_STAGE_TIMEOUT_SECONDS",
                    format!("not a number: {value}"),
                )
            })?;
        }

        if let Some(value) = lookup("FHIRFLOW_LOG") {
            self.logging.filter = value;
        }

        if let Some(value) = lookup("FHIRFLOW_LOG_JSON") {
            self.logging.json = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        self.validate()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::invalid(
                "max_concurrency",
                "must be greater than zero",
            ));
        }
        if !self.stage_timeout_seconds.is_finite() || self.stage_timeout_seconds <= 0.0 {
            return Err(ConfigError::invalid(
                "stage_timeout_seconds",
                "must be a positive number of seconds",
            ));
        }
        if let Some(rule) = self.retry_rules.iter().find(|r| r.error_kinds.is_empty()) {
            return Err(ConfigError::invalid(
                "retry_rules",
                format!("rule for stage {} names no error kinds", rule.stage),
            ));
        }
        Ok(())
    }

    /// The stage timeout as a duration.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.stage_timeout_seconds)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_stage_timeout()))
    }

    /// Builds the retry table: configured rules first, then the built-in rule.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = if self.default_retry_rules {
            RetryPolicy::default()
        } else {
            RetryPolicy::empty()
        };

        for rule in self.retry_rules.iter().rev() {
            policy.prepend_rule(rule.stage, rule.to_rule());
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RetryDecision;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    const TOML: &str = r#"
max_concurrency = 8
stage_timeout_seconds = 30

[logging]
filter = "fhirflow=debug"
json = true

[[retry_rules]]
stage = "convert"
error_kinds = ["ConverterError"]
max_retries = 2
base_delay_ms = 250
backoff = "linear"
"#;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrency, None);
        assert_eq!(config.stage_timeout(), Duration::from_secs(300));
        assert_eq!(config.chain, StageChain::default());
        assert_eq!(config.logging.filter, "fhirflow=info");
    }

    #[test]
    fn test_from_toml_str() {
        let config = PipelineConfig::from_toml_str(TOML).unwrap();
        assert_eq!(config.max_concurrency, Some(8));
        assert_eq!(config.stage_timeout(), Duration::from_secs(30));
        assert!(config.logging.json);
        assert_eq!(config.retry_rules.len(), 1);
        assert_eq!(config.retry_rules[0].backoff, BackoffStrategy::Linear);
        assert_eq!(config.retry_rules[0].error_kinds, vec![ErrorKind::Converter]);
    }

    #[test]
    fn test_retry_policy_keeps_default_rule() {
        let policy = PipelineConfig::from_toml_str(TOML).unwrap().retry_policy();
        assert_eq!(
            policy.should_retry(StageName::Convert, 2, &ErrorKind::Converter),
            RetryDecision::Retry(Duration::from_millis(500))
        );
        assert_eq!(
            policy.should_retry(
                StageName::Persist,
                1,
                &ErrorKind::HealthLakePostTooManyRequests
            ),
            RetryDecision::Retry(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_configured_rule_overrides_default() {
        let config = PipelineConfig::default().with_retry_rule(RetryRuleConfig {
            stage: StageName::Persist,
            error_kinds: vec![ErrorKind::HealthLakePostTooManyRequests],
            max_retries: 1,
            initial_delay_ms: None,
            base_delay_ms: 10,
            max_delay_ms: 10,
            backoff: BackoffStrategy::Constant,
            jitter: JitterStrategy::None,
            honor_backoff_hint: false,
        });
        let policy = config.retry_policy();
        let kind = ErrorKind::HealthLakePostTooManyRequests;
        assert_eq!(
            policy.should_retry(StageName::Persist, 1, &kind),
            RetryDecision::Retry(Duration::from_millis(10))
        );
        assert_eq!(
            policy.should_retry(StageName::Persist, 2, &kind),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_from_json_str_with_chain() {
        let config = PipelineConfig::from_json_str(
            r#"{"chain": ["validate", "deduplicate", "persist"], "default_retry_rules": false}"#,
        )
        .unwrap();
        assert_eq!(config.chain.stages().len(), 3);
        assert_eq!(
            config.retry_policy().should_retry(
                StageName::Persist,
                1,
                &ErrorKind::HealthLakePostTooManyRequests
            ),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(PipelineConfig::from_toml_str("max_concurrency = 0").is_err());
        assert!(PipelineConfig::from_toml_str("stage_timeout_seconds = -1.0").is_err());
        assert!(PipelineConfig::from_json_str(r#"{"chain": ["persist"]}"#).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FHIRFLOW_MAX_CONCURRENCY", "4"),
            ("FHIRFLOW_STAGE_TIMEOUT_SECONDS", "2.5"),
            ("FHIRFLOW_LOG", "fhirflow=trace"),
            ("FHIRFLOW_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.stage_timeout(), Duration::from_millis(2500));
        assert_eq!(config.logging.filter, "fhirflow=trace");
        assert!(config.logging.json);

        config
            .apply_overrides(|key| {
                (key == "FHIRFLOW_MAX_CONCURRENCY").then(|| "unbounded".to_string())
            })
            .unwrap();
        assert_eq!(config.max_concurrency, None);
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "FHIRFLOW_MAX_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("FHIRFLOW_MAX_CONCURRENCY"));
    }

    #[test]
    fn test_from_path_picks_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("pipeline.toml");
        std::fs::File::create(&toml_path)
            .unwrap()
            .write_all(TOML.as_bytes())
            .unwrap();
        assert_eq!(
            PipelineConfig::from_path(&toml_path).unwrap().max_concurrency,
            Some(8)
        );

        let json_path = dir.path().join("pipeline.json");
        std::fs::write(&json_path, r#"{"max_concurrency": 2}"#).unwrap();
        assert_eq!(
            PipelineConfig::from_path(&json_path).unwrap().max_concurrency,
            Some(2)
        );

        let yaml_path = dir.path().join("pipeline.yaml");
        std::fs::write(&yaml_path, "max_concurrency: 2").unwrap();
        assert!(matches!(
            PipelineConfig::from_path(&yaml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            PipelineConfig::from_path(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
