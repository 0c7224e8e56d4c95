//! Scalar pipeline settings and their environment overrides

use super::ConfigError;
use crate::batch::SubmitterConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Every tunable knob, with the defaults the pipelines assume
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Minimum relevance (1-5) a work unit needs to survive filtering
    pub relevance_threshold: u8,
    /// Probability of asking for reasoning with a stance score
    pub reasoning_rate: f64,
    pub max_batch_size: usize,
    pub poll_interval: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_timeout: Option<Duration>,
    pub filter_model: String,
    pub score_model: String,
    pub temperature: f32,
    /// Fuzzy score needed to resolve a name without asking
    pub fuzzy_acceptance: f64,
    pub database_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 4,
            reasoning_rate: 0.10,
            max_batch_size: 10_000,
            poll_interval: Duration::from_secs(30),
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            poll_timeout: None,
            filter_model: "gpt-4o-mini".to_string(),
            score_model: "gpt-4o".to_string(),
            temperature: 0.3,
            fuzzy_acceptance: 0.90,
            database_path: PathBuf::from("knesset.db"),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value,
                reason: e.to_string(),
            }),
    }
}

impl PipelineConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse("RELEVANCE_THRESHOLD", lookup("RELEVANCE_THRESHOLD"))? {
            config.relevance_threshold = v;
        }
        if let Some(v) = parse("REASONING_SAMPLE_RATE", lookup("REASONING_SAMPLE_RATE"))? {
            config.reasoning_rate = v;
        }
        if let Some(v) = parse("BATCH_SIZE", lookup("BATCH_SIZE"))? {
            config.max_batch_size = v;
        }
        if let Some(secs) = parse::<u64>("BATCH_POLL_INTERVAL", lookup("BATCH_POLL_INTERVAL"))? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>("BATCH_POLL_TIMEOUT", lookup("BATCH_POLL_TIMEOUT"))? {
            config.poll_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(v) = parse("RETRY_ATTEMPTS", lookup("RETRY_ATTEMPTS"))? {
            config.retry_attempts = v;
        }
        if let Some(v) = lookup("FILTER_MODEL_NAME").filter(|v| !v.trim().is_empty()) {
            config.filter_model = v.trim().to_string();
        }
        if let Some(v) = lookup("SCORE_MODEL_NAME").filter(|v| !v.trim().is_empty()) {
            config.score_model = v.trim().to_string();
        }
        if let Some(v) = lookup("DATABASE_PATH").filter(|v| !v.trim().is_empty()) {
            config.database_path = PathBuf::from(v.trim());
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipelines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=5).contains(&self.relevance_threshold) {
            return Err(ConfigError::OutOfRange(format!(
                "relevance threshold {} is outside 1..=5",
                self.relevance_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.reasoning_rate) {
            return Err(ConfigError::OutOfRange(format!(
                "reasoning rate {} is outside [0, 1]",
                self.reasoning_rate
            )));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::OutOfRange("batch size must be positive".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::OutOfRange("retry attempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn submitter(&self) -> SubmitterConfig {
        SubmitterConfig {
            max_batch_size: self.max_batch_size,
            poll_interval: self.poll_interval,
            retry_attempts: self.retry_attempts,
            retry_backoff: self.retry_backoff,
            poll_timeout: self.poll_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.relevance_threshold, 4);
        assert_eq!(config.max_batch_size, 10_000);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn environment_overrides_apply() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("RELEVANCE_THRESHOLD", "3"),
            ("REASONING_SAMPLE_RATE", "0.5"),
            ("BATCH_SIZE", "500"),
            ("BATCH_POLL_INTERVAL", "5"),
            ("SCORE_MODEL_NAME", "gpt-4.1"),
            ("FILTER_MODEL_NAME", "  "),
        ]))
        .unwrap();

        assert_eq!(config.relevance_threshold, 3);
        assert_eq!(config.reasoning_rate, 0.5);
        assert_eq!(config.submitter().max_batch_size, 500);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.score_model, "gpt-4.1");
        assert_eq!(config.filter_model, "gpt-4o-mini");
    }

    #[test]
    fn unparseable_value_names_the_key() {
        let err = PipelineConfig::from_lookup(lookup(&[("BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(PipelineConfig::from_lookup(lookup(&[("REASONING_SAMPLE_RATE", "1.5")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("RELEVANCE_THRESHOLD", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("BATCH_SIZE", "0")])).is_err());
    }
}
