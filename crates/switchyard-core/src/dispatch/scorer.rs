//! ε-greedy selection and Q-value updates over provider scores
//!
//! The score a provider carries for a tier is the Q-value of a stateless
//! single-step Q-learning policy, kept in [0, 100]. Selection explores a
//! uniformly random eligible candidate with probability ε (decayed per
//! decision down to a floor) and otherwise exploits the highest score.
//! Outcome rewards fold in with `Q <- Q + α·(reward - Q)`.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::events::{DispatchEvent, DispatchObserver};
use super::registry::ProviderRegistry;
use super::types::{Outcome, Priority};
use crate::config::LearningConfig;
use crate::error::{Error, Result};

/// One selection decision
#[derive(Debug, Clone)]
pub struct Selection {
    /// The chosen provider
    pub provider_id: String,
    /// The provider's score at selection time
    pub score: f64,
    /// Whether this was an exploration (vs exploitation) choice
    pub explored: bool,
}

/// Result of folding one outcome into a provider's score
#[derive(Debug, Clone, Copy)]
pub struct ScoreUpdate {
    pub previous: f64,
    pub current: f64,
}

struct ExploreState {
    epsilon: f64,
    rng: StdRng,
}

/// ε-greedy scorer over registry-held Q-values
pub struct AdaptiveScorer {
    registry: Arc<ProviderRegistry>,
    config: LearningConfig,
    state: Mutex<ExploreState>,
    observer: Option<Arc<dyn DispatchObserver>>,
}

impl AdaptiveScorer {
    pub fn new(registry: Arc<ProviderRegistry>, config: LearningConfig) -> Self {
        let epsilon = config.epsilon;
        Self {
            registry,
            config,
            state: Mutex::new(ExploreState {
                epsilon,
                rng: StdRng::from_entropy(),
            }),
            observer: None,
        }
    }

    /// Create a scorer with a fixed seed (for reproducibility in tests)
    pub fn with_seed(registry: Arc<ProviderRegistry>, config: LearningConfig, seed: u64) -> Self {
        let epsilon = config.epsilon;
        Self {
            registry,
            config,
            state: Mutex::new(ExploreState {
                epsilon,
                rng: StdRng::seed_from_u64(seed),
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The exploration rate the next decision will use
    pub fn current_epsilon(&self) -> f64 {
        self.lock_state().epsilon
    }

    /// Pick one provider from an eligible candidate list.
    ///
    /// Ties on score are broken by the priority hint (cost for
    /// `Priority::Cost`, observed latency otherwise), then by id.
    pub fn pick(&self, tier: &str, candidates: &[String], priority: Priority) -> Result<Selection> {
        if candidates.is_empty() {
            return Err(Error::NoEligibleProvider(tier.to_string()));
        }

        let explore = {
            let mut state = self.lock_state();
            let roll: f64 = state.rng.gen_range(0.0..1.0);
            let explore = roll < state.epsilon;
            state.epsilon = (state.epsilon * self.config.epsilon_decay).max(self.config.epsilon_min);
            explore
        };

        if explore {
            let index = {
                let mut state = self.lock_state();
                state.rng.gen_range(0..candidates.len())
            };
            let provider_id = candidates[index].clone();
            let score = self.score_for(&provider_id, tier)?;
            debug!(provider = %provider_id, tier = %tier, score, "exploring candidate");
            return Ok(Selection {
                provider_id,
                score,
                explored: true,
            });
        }

        let mut best: Option<(String, f64, f64)> = None;
        for provider_id in candidates {
            let provider = self.registry.get(provider_id)?;
            let score = provider.score(tier).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Provider '{}' has no score for tier '{}'",
                    provider_id, tier
                ))
            })?;
            let tie_metric = match priority {
                Priority::Cost => provider.cost_per_call(),
                Priority::Speed | Priority::Balanced => {
                    provider.avg_latency_ms(tier).unwrap_or(f64::INFINITY)
                }
            };

            let replace = match &best {
                None => true,
                Some((best_id, best_score, best_metric)) => {
                    if score != *best_score {
                        score > *best_score
                    } else if tie_metric != *best_metric {
                        tie_metric < *best_metric
                    } else {
                        provider_id < best_id
                    }
                }
            };

            if replace {
                best = Some((provider_id.clone(), score, tie_metric));
            }
        }

        // Candidates are non-empty, so best is always set
        let (provider_id, score, _) = best.ok_or_else(|| {
            Error::NoEligibleProvider(tier.to_string())
        })?;
        debug!(provider = %provider_id, tier = %tier, score, "exploiting best candidate");
        Ok(Selection {
            provider_id,
            score,
            explored: false,
        })
    }

    /// Fold a reported outcome into the provider's score for its tier
    pub fn apply(&self, outcome: &Outcome) -> Result<ScoreUpdate> {
        self.apply_with_lookahead(outcome, None)
    }

    /// Q-update with an optional next-state estimate.
    ///
    /// The baseline dispatch problem is stateless, so `next_max_q` is
    /// normally `None` and the rule collapses to `Q + α·(reward - Q)`.
    /// Callers that model a genuine multi-step context can pass the best
    /// next-state Q-value and γ is applied to it.
    pub fn apply_with_lookahead(
        &self,
        outcome: &Outcome,
        next_max_q: Option<f64>,
    ) -> Result<ScoreUpdate> {
        let reward = outcome.reward() * 100.0;
        let target = reward + next_max_q.map_or(0.0, |q| self.config.gamma * q);
        let alpha = self.config.alpha;

        let update = self
            .registry
            .with_provider(&outcome.provider_id, |p| -> Result<ScoreUpdate> {
                let previous = p.score(&outcome.tier).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Provider '{}' has no score for tier '{}'",
                        outcome.provider_id, outcome.tier
                    ))
                })?;
                let current = (previous + alpha * (target - previous)).clamp(0.0, 100.0);
                p.set_score(&outcome.tier, current)?;
                p.record_outcome_stats(&outcome.tier, outcome.success, outcome.latency_ms);
                Ok(ScoreUpdate { previous, current })
            })??;

        debug!(
            provider = %outcome.provider_id,
            tier = %outcome.tier,
            previous = update.previous,
            current = update.current,
            success = outcome.success,
            "applied outcome to score"
        );

        if let Some(observer) = &self.observer {
            observer.on_event(&DispatchEvent::ScoreUpdated {
                provider_id: outcome.provider_id.clone(),
                tier: outcome.tier.clone(),
                previous: update.previous,
                current: update.current,
            });
        }

        Ok(update)
    }

    fn score_for(&self, provider_id: &str, tier: &str) -> Result<f64> {
        self.registry.get(provider_id)?.score(tier).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Provider '{}' has no score for tier '{}'",
                provider_id, tier
            ))
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ExploreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
