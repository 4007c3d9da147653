//! Tier fallback resolution
//!
//! Walks a tier's static preference order and keeps only providers that
//! pass both the circuit gate and the quota gate. An empty result is an
//! error, never a silent empty list - callers base their retry/backoff
//! policy on the distinction.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::circuit::CircuitSupervisor;
use super::quota::QuotaTracker;
use super::registry::ProviderRegistry;
use crate::error::{Error, Result};

/// Produces the ordered candidate list for one dispatch
pub struct FallbackResolver {
    registry: Arc<ProviderRegistry>,
    quota: QuotaTracker,
    circuit: CircuitSupervisor,
    /// Cap on the candidate list; `None` keeps every eligible provider
    max_candidates: Option<usize>,
}

impl FallbackResolver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        quota: QuotaTracker,
        circuit: CircuitSupervisor,
    ) -> Self {
        Self {
            registry,
            quota,
            circuit,
            max_candidates: None,
        }
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = Some(max);
        self
    }

    /// Currently eligible providers for a tier, in fallback order.
    ///
    /// Eligible means the circuit admits requests AND the quota window can
    /// absorb `tokens_needed`. The list never repeats a provider.
    pub fn resolve(&self, tier: &str, tokens_needed: u64) -> Result<Vec<String>> {
        self.resolve_at(tier, tokens_needed, Utc::now())
    }

    pub fn resolve_at(
        &self,
        tier: &str,
        tokens_needed: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let order = self.registry.list_by_tier(tier)?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for provider_id in order {
            if !seen.insert(provider_id.clone()) {
                continue;
            }

            if !self.circuit.is_available_at(&provider_id, now)? {
                debug!(provider = %provider_id, tier = %tier, "skipping provider, circuit open");
                continue;
            }

            if !self.quota.has_capacity_at(&provider_id, tokens_needed, now)? {
                debug!(
                    provider = %provider_id,
                    tier = %tier,
                    tokens_needed,
                    "skipping provider, quota exhausted"
                );
                continue;
            }

            candidates.push(provider_id);

            if let Some(max) = self.max_candidates {
                if candidates.len() >= max {
                    break;
                }
            }
        }

        if candidates.is_empty() {
            return Err(Error::NoEligibleProvider(tier.to_string()));
        }

        Ok(candidates)
    }
}
