pub mod config;
pub mod error;
pub mod scoring;
pub mod text;
pub mod types;

pub use config::{
    ActionsConfig, AppConfig, IngestConfig, PipelineConfig, RetryConfig, ScoringConfig,
    StartupConfig,
};
pub use error::ChurnWatchError;
pub use scoring::{RiskFeatures, RiskRules, RiskScore};
pub use types::*;
