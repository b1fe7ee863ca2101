//! # Configuration
//!
//! Layered settings for the framework: built-in defaults, then an optional
//! file, then `RESILIENCE__<SECTION>__<KEY>` environment variables (a `.env`
//! file is honoured). Every section can also be read on its own from an
//! existing `config::Config`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::intelligence::{HealthWeights, IntelligenceConfig};
use crate::logging::LoggingConfig;
use crate::result::QualityPolicy;
use crate::retry::RetryConfig;
use crate::types::{ErrorKind, Result};

/// Prefix of environment variables read by [`FrameworkConfig::load`]
pub const ENV_PREFIX: &str = "RESILIENCE";

/// All framework settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    pub logging: LoggingConfig,
    pub retry: RetryConfig,
    pub intelligence: IntelligenceConfig,
    pub quality: QualityPolicy,
}

impl FrameworkConfig {
    /// Loads defaults, then `path` if given, then the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = Self::try_from(builder.build()?)?;
        debug!(
            file = ?path,
            max_attempts = loaded.retry.max_attempts,
            quality_window = loaded.intelligence.quality_window,
            "Framework configuration loaded"
        );
        Ok(loaded)
    }
}

impl TryFrom<config::Config> for FrameworkConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            logging: LoggingConfig::try_from(cfg.clone())?,
            retry: RetryConfig::try_from(cfg.clone())?,
            intelligence: IntelligenceConfig::try_from(cfg.clone())?,
            quality: QualityPolicy::try_from(cfg)?,
        })
    }
}

impl TryFrom<config::Config> for RetryConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = RetryConfig::default();

        if let Ok(max_attempts) = cfg.get::<u32>("retry.max_attempts") {
            base.max_attempts = max_attempts;
        }
        if let Ok(base_delay_ms) = cfg.get::<u64>("retry.base_delay_ms") {
            base.base_delay_ms = base_delay_ms;
        }
        if let Ok(multiplier) = cfg.get::<f64>("retry.multiplier") {
            base.multiplier = multiplier;
        }
        if let Ok(max_delay_ms) = cfg.get::<u64>("retry.max_delay_ms") {
            base.max_delay_ms = max_delay_ms;
        }
        if let Ok(jitter_factor) = cfg.get::<f64>("retry.jitter_factor") {
            base.jitter_factor = jitter_factor;
        }
        if let Ok(kinds) = cfg.get::<Vec<ErrorKind>>("retry.retryable_kinds") {
            base.retryable_kinds = kinds;
        }
        if let Ok(record_metrics) = cfg.get::<bool>("retry.record_metrics") {
            base.record_metrics = record_metrics;
        }

        Ok(base.normalized())
    }
}

impl TryFrom<config::Config> for IntelligenceConfig {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = IntelligenceConfig::default();

        if let Ok(quality_window) = cfg.get::<usize>("intelligence.quality_window") {
            base.quality_window = quality_window;
        }
        if let Ok(outcome_window) = cfg.get::<usize>("intelligence.outcome_window") {
            base.outcome_window = outcome_window;
        }
        if let Ok(pattern_threshold) = cfg.get::<usize>("intelligence.pattern_threshold") {
            base.pattern_threshold = pattern_threshold;
        }
        if let Ok(weights) = cfg.get::<HealthWeights>("intelligence.weights") {
            base.weights = weights;
        }
        if let Ok(ratio) = cfg.get::<f64>("intelligence.dominant_kind_ratio") {
            base.dominant_kind_ratio = ratio;
        }
        if let Ok(threshold) = cfg.get::<f64>("intelligence.attention_threshold") {
            base.attention_threshold = threshold;
        }
        if let Ok(threshold) = cfg.get::<f64>("intelligence.healthy_threshold") {
            base.healthy_threshold = threshold;
        }
        if let Ok(listed) = cfg.get::<usize>("intelligence.lowest_entities_listed") {
            base.lowest_entities_listed = listed;
        }
        if let Ok(record_metrics) = cfg.get::<bool>("intelligence.record_metrics") {
            base.record_metrics = record_metrics;
        }

        Ok(base)
    }
}

impl TryFrom<config::Config> for QualityPolicy {
    type Error = config::ConfigError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let mut base = QualityPolicy::default();

        if let Ok(penalty) = cfg.get::<f64>("quality.error_penalty") {
            base.error_penalty = penalty;
        }
        if let Ok(penalty) = cfg.get::<f64>("quality.warning_penalty") {
            base.warning_penalty = penalty;
        }

        Ok(base)
    }
}
