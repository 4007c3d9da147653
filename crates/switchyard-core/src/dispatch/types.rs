//! Types for adaptive provider dispatch
//!
//! This module defines the requests, handles, and outcome reports exchanged
//! between callers and the dispatcher, plus the flat per-provider snapshot
//! record used by persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::circuit::CircuitState;

/// Priority hint attached to a dispatch request.
///
/// Only consulted to break exploitation ties in the scorer; it never
/// bypasses the circuit or quota gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Balance cost and speed
    #[default]
    Balanced,
    /// Prefer the cheapest provider on ties
    Cost,
    /// Prefer the fastest observed provider on ties
    Speed,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::Cost => write!(f, "cost"),
            Self::Speed => write!(f, "speed"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "cost" => Ok(Self::Cost),
            "speed" => Ok(Self::Speed),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// A unit of work awaiting provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Priority tier the work belongs to
    pub tier: String,
    /// Estimated token cost, used for the quota gate
    pub estimated_tokens: u64,
    /// Optional tie-breaking hint
    pub priority: Option<Priority>,
    /// Advisory deadline, passed through to the handle and never enforced
    pub deadline: Option<DateTime<Utc>>,
}

impl DispatchRequest {
    /// Create a request for a tier with an estimated token cost
    pub fn new(tier: impl Into<String>, estimated_tokens: u64) -> Self {
        Self {
            tier: tier.into(),
            estimated_tokens,
            priority: None,
            deadline: None,
        }
    }

    /// Set the priority hint
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the advisory deadline
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Handle identifying one in-flight dispatch.
///
/// Issued by `Dispatcher::select` and consumed exactly once by
/// `Dispatcher::report_outcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchHandle {
    /// Unique handle id
    pub id: Uuid,
    /// The provider chosen for this dispatch
    pub provider_id: String,
    /// Tier the work was requested for
    pub tier: String,
    /// Token estimate carried over from the request
    pub estimated_tokens: u64,
    /// Advisory deadline carried over from the request
    pub deadline: Option<DateTime<Utc>>,
    /// When the selection was made
    pub issued_at: DateTime<Utc>,
}

/// Observed result of executing a dispatched unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Provider that executed the work
    pub provider_id: String,
    /// Tier the work was dispatched under
    pub tier: String,
    /// Whether the call succeeded
    pub success: bool,
    /// Tokens actually consumed (counted against the quota)
    pub tokens_consumed: u64,
    /// Observed latency in milliseconds
    pub latency_ms: u64,
    /// Optional quality signal in [0, 1]
    pub quality: Option<f64>,
    /// Optional failure description, forwarded to the circuit breaker log
    pub error: Option<String>,
}

impl Outcome {
    /// Create a successful outcome
    pub fn success(provider_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            tier: tier.into(),
            success: true,
            tokens_consumed: 0,
            latency_ms: 0,
            quality: None,
            error: None,
        }
    }

    /// Create a failed outcome
    pub fn failure(provider_id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(provider_id, tier)
        }
    }

    /// Set the consumed token count
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_consumed = tokens;
        self
    }

    /// Set the observed latency
    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    /// Set the quality signal, clamped to [0, 1]
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality.clamp(0.0, 1.0));
        self
    }

    /// Attach a failure description
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Reward signal for the learning update.
    ///
    /// Full success is worth 1.0; a success carrying a quality signal below
    /// 1.0 is treated as degraded and scaled into [0, 0.5); failure costs 0.5.
    pub fn reward(&self) -> f64 {
        if !self.success {
            return -0.5;
        }
        match self.quality {
            Some(q) if q < 1.0 => 0.5 * q,
            _ => 1.0,
        }
    }
}

/// Flat per-provider record persisted by a snapshot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    /// Stable provider id
    pub id: String,
    /// Tiers the provider belongs to
    pub tiers: Vec<String>,
    /// Score per tier, each in [0, 100]
    pub scores: HashMap<String, f64>,
    /// Daily token quota limit
    pub quota_limit: u64,
    /// Tokens consumed in the current window
    pub quota_used: u64,
    /// When the quota window resets
    pub quota_reset_at: DateTime<Utc>,
    /// Circuit breaker state
    pub circuit_state: CircuitState,
    /// Consecutive failure count
    pub consecutive_failures: u32,
}

/// Per-tier call statistics for one provider, in-memory only
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStats {
    /// Average observed latency in milliseconds (online mean)
    pub avg_latency_ms: f64,
    /// Number of latency observations
    pub latency_samples: u64,
    /// Successful outcome reports
    pub successes: u64,
    /// Failed outcome reports
    pub failures: u64,
}

impl TierStats {
    /// Total reported outcomes
    pub fn total_calls(&self) -> u64 {
        self.successes + self.failures
    }

    /// Fraction of reported outcomes that succeeded
    pub fn success_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            return 0.0;
        }
        self.successes as f64 / total as f64
    }

    /// Fold one latency observation into the running mean
    pub(crate) fn observe_latency(&mut self, latency_ms: u64) {
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let deadline = Utc::now();
        let request = DispatchRequest::new("fast", 250)
            .with_priority(Priority::Speed)
            .with_deadline(deadline);

        assert_eq!(request.tier, "fast");
        assert_eq!(request.estimated_tokens, 250);
        assert_eq!(request.priority, Some(Priority::Speed));
        assert_eq!(request.deadline, Some(deadline));
    }

    #[test]
    fn priority_parse() {
        assert_eq!("balanced".parse::<Priority>().unwrap(), Priority::Balanced);
        assert_eq!("COST".parse::<Priority>().unwrap(), Priority::Cost);
        assert!("accuracy-first".parse::<Priority>().is_err());
    }

    #[test]
    fn reward_full_success() {
        let outcome = Outcome::success("p1", "fast");
        assert_eq!(outcome.reward(), 1.0);

        // An explicit perfect quality signal still counts as full success
        let outcome = Outcome::success("p1", "fast").with_quality(1.0);
        assert_eq!(outcome.reward(), 1.0);
    }

    #[test]
    fn reward_degraded_success_scales_with_quality() {
        let outcome = Outcome::success("p1", "fast").with_quality(0.6);
        assert!((outcome.reward() - 0.3).abs() < f64::EPSILON);

        let outcome = Outcome::success("p1", "fast").with_quality(0.0);
        assert_eq!(outcome.reward(), 0.0);
    }

    #[test]
    fn reward_failure() {
        let outcome = Outcome::failure("p1", "fast").with_error("timeout");
        assert_eq!(outcome.reward(), -0.5);
    }

    #[test]
    fn quality_is_clamped() {
        let outcome = Outcome::success("p1", "fast").with_quality(3.5);
        assert_eq!(outcome.quality, Some(1.0));

        let outcome = Outcome::success("p1", "fast").with_quality(-0.2);
        assert_eq!(outcome.quality, Some(0.0));
    }

    #[test]
    fn tier_stats_online_mean() {
        let mut stats = TierStats::default();
        stats.observe_latency(100);
        stats.observe_latency(300);

        assert!((stats.avg_latency_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats.latency_samples, 2);
    }

    #[test]
    fn tier_stats_success_rate() {
        let stats = TierStats {
            successes: 8,
            failures: 2,
            ..Default::default()
        };
        assert!((stats.success_rate() - 0.8).abs() < f64::EPSILON);
        assert_eq!(stats.total_calls(), 10);

        assert_eq!(TierStats::default().success_rate(), 0.0);
    }
}
