use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ChurnWatchError;
use crate::scoring::RiskRules;

/// Secrets and environment-specific values. Tunables live in [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub anthropic_api_key: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable is required")?,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            config_path: std::env::var("CHURNWATCH_CONFIG").ok().map(PathBuf::from),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let n = val.char_indices().nth(5).map(|(i, _)| i).unwrap_or(val.len());
            format!("{}...({} chars)", &val[..n], val.len())
        }

        let database_host = self
            .database_url
            .rsplit('@')
            .next()
            .unwrap_or("<unparsed>");

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: ...@{}", database_host);
        tracing::info!(
            "  ANTHROPIC_API_KEY: {}",
            self.anthropic_api_key
                .as_deref()
                .map(preview)
                .unwrap_or_else(|| "<not set>".to_string())
        );
        tracing::info!(
            "  CHURNWATCH_CONFIG: {}",
            self.config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<defaults>".to_string())
        );
    }
}

/// TOML-backed pipeline tunables. Every field has a default, so an absent
/// file (or an empty one) runs with the stock constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub scoring: ScoringConfig,
    pub actions: ActionsConfig,
    pub startup: StartupConfig,
}

impl PipelineConfig {
    /// Load from `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                toml::from_str::<PipelineConfig>(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.flush_size == 0 {
            return Err(invalid("ingest.flush_size must be at least 1"));
        }
        if self.ingest.flush_interval.is_zero() {
            return Err(invalid("ingest.flush_interval must be positive"));
        }
        if self.scoring.window.is_zero() || self.scoring.cadence.is_zero() {
            return Err(invalid("scoring.window and scoring.cadence must be positive"));
        }
        if self.actions.generation_timeout.is_zero() {
            return Err(invalid("actions.generation_timeout must be positive"));
        }
        if self.actions.cooldown.is_zero() {
            return Err(invalid("actions.cooldown must be positive"));
        }
        self.ingest.store_retry.validate("ingest.store_retry")?;
        self.startup.connect.validate("startup.connect")?;
        self.scoring
            .rules
            .validate()
            .map_err(|e| invalid(format!("scoring.rules: {e}")))?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    ChurnWatchError::Config(message.into()).into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Combined buffered events that force a flush.
    pub flush_size: usize,
    /// Maximum time between flushes while events are buffered.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    pub store_retry: RetryConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_size: 500,
            flush_interval: Duration::from_secs(5),
            store_retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid(format!("{section}.max_attempts must be at least 1")));
        }
        if self.base_delay > self.max_delay {
            return Err(invalid(format!("{section}.base_delay must not exceed max_delay")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// Trailing span of raw events that feed one aggregate.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Time between recomputation cycles.
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
    pub rules: RiskRules,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 3600),
            cadence: Duration::from_secs(5 * 60),
            rules: RiskRules::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionsConfig {
    /// Minimum spacing between two actions for the same entity.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Hard cap on generation calls per cycle. Excess is deferred, not dropped.
    pub max_per_cycle: u64,
    #[serde(with = "humantime_serde")]
    pub generation_timeout: Duration,
    pub model: String,
    /// A cycle lock older than this is considered abandoned.
    #[serde(with = "humantime_serde")]
    pub lock_stale_after: Duration,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(7 * 24 * 3600),
            max_per_cycle: 50,
            generation_timeout: Duration::from_secs(30),
            model: "claude-haiku-4-5-20251001".to_string(),
            lock_stale_after: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupConfig {
    /// Readiness retry for the store at process start.
    pub connect: RetryConfig,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            connect: RetryConfig {
                max_attempts: 30,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}
