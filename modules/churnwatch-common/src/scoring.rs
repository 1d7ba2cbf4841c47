//! Churn risk scoring.
//!
//! Five independent conditions, each contributing a fixed weight when it
//! holds. The weighted sum is clamped to [0, 1] and bucketed into a
//! [`RiskClass`]. All arithmetic happens once, in integer basis points, so the
//! numeric score and the class label can never disagree and repeated runs over
//! the same counters produce identical output.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::RiskClass;

const FULL_SCALE_BP: u32 = 10_000;

/// Score in basis points (0..=10_000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RiskScore(u32);

impl RiskScore {
    pub const ZERO: RiskScore = RiskScore(0);
    pub const MAX: RiskScore = RiskScore(FULL_SCALE_BP);

    pub fn from_basis_points(bp: u32) -> Self {
        Self(bp.min(FULL_SCALE_BP))
    }

    /// Nearest basis point, clamped to [0, 1].
    pub fn from_f64(value: f64) -> Self {
        Self(to_basis_points(value))
    }

    pub fn basis_points(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / f64::from(FULL_SCALE_BP)
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.as_f64())
    }
}

fn to_basis_points(value: f64) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let bp = (value * f64::from(FULL_SCALE_BP)).round();
    if bp >= f64::from(FULL_SCALE_BP) {
        FULL_SCALE_BP
    } else {
        bp as u32
    }
}

/// The counters a score is derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskFeatures {
    pub wire_out_total: f64,
    pub support_cases: i64,
    pub avg_sentiment: f64,
    pub error_count: i64,
    pub active_days: i64,
}

/// Thresholds, weights and class boundaries. Defaults are uncalibrated
/// constants carried over as-is; there is no training signal for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RiskRules {
    /// Wire-out volume strictly above this adds `wire_out_weight`.
    pub wire_out_threshold: f64,
    pub wire_out_weight: f64,
    /// Support cases strictly above this adds `support_cases_weight`.
    pub support_cases_threshold: i64,
    pub support_cases_weight: f64,
    /// Average sentiment strictly below this adds `sentiment_weight`.
    pub sentiment_threshold: f64,
    pub sentiment_weight: f64,
    /// Error count strictly above this adds `error_count_weight`.
    pub error_count_threshold: i64,
    pub error_count_weight: f64,
    /// Active days strictly below this adds `active_days_weight`.
    pub active_days_threshold: i64,
    pub active_days_weight: f64,
    /// Sentiment assumed when an entity has no support cases in the window.
    pub default_sentiment: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for RiskRules {
    fn default() -> Self {
        Self {
            wire_out_threshold: 5000.0,
            wire_out_weight: 0.25,
            support_cases_threshold: 2,
            support_cases_weight: 0.20,
            sentiment_threshold: 0.4,
            sentiment_weight: 0.20,
            error_count_threshold: 5,
            error_count_weight: 0.15,
            active_days_threshold: 5,
            active_days_weight: 0.20,
            default_sentiment: 0.5,
            high_threshold: 0.7,
            medium_threshold: 0.4,
        }
    }
}

impl RiskRules {
    /// Score and classify in one pass.
    pub fn assess(&self, features: &RiskFeatures) -> (RiskScore, RiskClass) {
        let score = self.score(features);
        (score, self.classify(score))
    }

    pub fn score(&self, features: &RiskFeatures) -> RiskScore {
        let conditions = [
            (
                features.wire_out_total > self.wire_out_threshold,
                self.wire_out_weight,
            ),
            (
                features.support_cases > self.support_cases_threshold,
                self.support_cases_weight,
            ),
            (
                features.avg_sentiment < self.sentiment_threshold,
                self.sentiment_weight,
            ),
            (
                features.error_count > self.error_count_threshold,
                self.error_count_weight,
            ),
            (
                features.active_days < self.active_days_threshold,
                self.active_days_weight,
            ),
        ];

        let total: u32 = conditions
            .iter()
            .filter(|(holds, _)| *holds)
            .map(|(_, weight)| to_basis_points(*weight))
            .sum();

        RiskScore::from_basis_points(total)
    }

    pub fn classify(&self, score: RiskScore) -> RiskClass {
        if score.basis_points() >= to_basis_points(self.high_threshold) {
            RiskClass::High
        } else if score.basis_points() >= to_basis_points(self.medium_threshold) {
            RiskClass::Medium
        } else {
            RiskClass::Low
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let weights = [
            ("wire_out_weight", self.wire_out_weight),
            ("support_cases_weight", self.support_cases_weight),
            ("sentiment_weight", self.sentiment_weight),
            ("error_count_weight", self.error_count_weight),
            ("active_days_weight", self.active_days_weight),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("{name} must be a non-negative number, got {weight}"));
            }
        }
        if !(0.0..=1.0).contains(&self.medium_threshold)
            || !(0.0..=1.0).contains(&self.high_threshold)
        {
            return Err("class thresholds must lie in [0, 1]".to_string());
        }
        if self.medium_threshold > self.high_threshold {
            return Err(format!(
                "medium_threshold ({}) must not exceed high_threshold ({})",
                self.medium_threshold, self.high_threshold
            ));
        }
        Ok(())
    }
}
