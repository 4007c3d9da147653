//! Provider registry - the shared records behind every dispatch decision
//!
//! One `Provider` record per backend holds the per-tier scores, quota
//! counters, observed statistics, and the circuit breaker. The registry is
//! the only mutable shared state in the crate; it is passed explicitly to
//! every component and guarded by a single lock so that check-then-act
//! sequences stay atomic.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Days, Duration, TimeZone, Utc};
use tracing::{info, warn};

use super::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use super::types::{ProviderSnapshot, TierStats};
use crate::config::Config;
use crate::error::{Error, Result};

/// A single backend provider's live record
#[derive(Debug, Clone)]
pub struct Provider {
    id: String,
    tiers: Vec<String>,
    cost_per_call: f64,
    /// Score per tier, the Q-value of the learning policy, always in [0, 100]
    scores: HashMap<String, f64>,
    /// Per-tier call statistics, in-memory only
    stats: HashMap<String, TierStats>,
    quota_limit: u64,
    quota_used: u64,
    quota_reset_at: DateTime<Utc>,
    pub(crate) circuit: CircuitBreaker,
}

impl Provider {
    fn new(
        id: String,
        tiers: Vec<String>,
        initial_score: f64,
        cost_per_call: f64,
        quota_limit: u64,
        circuit_config: CircuitConfig,
        now: DateTime<Utc>,
    ) -> Self {
        let score = initial_score.clamp(0.0, 100.0);
        let scores = tiers.iter().map(|t| (t.clone(), score)).collect();
        let stats = tiers.iter().map(|t| (t.clone(), TierStats::default())).collect();

        Self {
            id,
            tiers,
            cost_per_call,
            scores,
            stats,
            quota_limit,
            quota_used: 0,
            quota_reset_at: next_daily_reset(now),
            circuit: CircuitBreaker::new(circuit_config, now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tiers this provider belongs to, derived from the tier tables
    pub fn tiers(&self) -> &[String] {
        &self.tiers
    }

    pub fn cost_per_call(&self) -> f64 {
        self.cost_per_call
    }

    /// Current score for a tier, `None` if the provider is not a member
    pub fn score(&self, tier: &str) -> Option<f64> {
        self.scores.get(tier).copied()
    }

    /// Call statistics for a tier
    pub fn tier_stats(&self, tier: &str) -> Option<&TierStats> {
        self.stats.get(tier)
    }

    /// Average observed latency for a tier, `None` before any observation
    pub fn avg_latency_ms(&self, tier: &str) -> Option<f64> {
        self.stats
            .get(tier)
            .filter(|s| s.latency_samples > 0)
            .map(|s| s.avg_latency_ms)
    }

    pub fn quota_limit(&self) -> u64 {
        self.quota_limit
    }

    pub fn quota_used(&self) -> u64 {
        self.quota_used
    }

    pub fn quota_remaining(&self) -> u64 {
        self.quota_limit.saturating_sub(self.quota_used)
    }

    pub fn quota_reset_at(&self) -> DateTime<Utc> {
        self.quota_reset_at
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Set the score for a tier the provider belongs to, clamped to [0, 100]
    pub(crate) fn set_score(&mut self, tier: &str, score: f64) -> Result<()> {
        match self.scores.get_mut(tier) {
            Some(slot) => {
                *slot = score.clamp(0.0, 100.0);
                Ok(())
            }
            None => Err(Error::InvalidInput(format!(
                "Provider '{}' is not a member of tier '{}'",
                self.id, tier
            ))),
        }
    }

    /// Fold an outcome into the per-tier statistics
    pub(crate) fn record_outcome_stats(&mut self, tier: &str, success: bool, latency_ms: u64) {
        if let Some(stats) = self.stats.get_mut(tier) {
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            if latency_ms > 0 {
                stats.observe_latency(latency_ms);
            }
        }
    }

    /// Zero the usage counter and advance the reset time when due.
    ///
    /// The reset time only ever moves forward, in whole-day steps, so the
    /// schedule stays monotonic even across several missed windows.
    pub(crate) fn reset_quota_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.quota_reset_at {
            return false;
        }
        self.quota_used = 0;
        while self.quota_reset_at <= now {
            self.quota_reset_at += Duration::days(1);
        }
        true
    }

    /// Count consumed tokens, rejecting without mutation on overrun
    pub(crate) fn consume(&mut self, tokens: u64) -> Result<u64> {
        let remaining = self.quota_remaining();
        if tokens > remaining {
            return Err(Error::QuotaExceeded {
                provider: self.id.clone(),
                requested: tokens,
                remaining,
            });
        }
        self.quota_used += tokens;
        Ok(self.quota_remaining())
    }

    /// Overwrite the quota counters, used when restoring persisted state
    pub(crate) fn force_quota(&mut self, used: u64, reset_at: DateTime<Utc>) {
        self.quota_used = used.min(self.quota_limit);
        self.quota_reset_at = reset_at;
    }

    fn to_snapshot(&self) -> ProviderSnapshot {
        ProviderSnapshot {
            id: self.id.clone(),
            tiers: self.tiers.clone(),
            scores: self.scores.clone(),
            quota_limit: self.quota_limit,
            quota_used: self.quota_used,
            quota_reset_at: self.quota_reset_at,
            circuit_state: self.circuit.state(),
            consecutive_failures: self.circuit.consecutive_failures(),
        }
    }
}

/// First daily reset boundary strictly after `now` (UTC midnight)
fn next_daily_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Days::new(1);
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(naive) => Utc.from_utc_datetime(&naive),
        None => now + Duration::days(1),
    }
}

/// Registry of provider records and tier preference tables.
///
/// Tier tables are immutable after construction; provider records mutate
/// continuously as outcomes are reported.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Provider>>,
    /// Tier name -> ordered, de-duplicated provider preference list
    tiers: HashMap<String, Vec<String>>,
    circuit_config: CircuitConfig,
}

impl ProviderRegistry {
    /// Build a registry from validated configuration.
    ///
    /// Tier membership is derived from the tier tables; duplicate entries
    /// within one table are dropped, keeping the first occurrence.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_at(config, Utc::now())
    }

    pub(crate) fn from_config_at(config: &Config, now: DateTime<Utc>) -> Result<Self> {
        let mut tiers: HashMap<String, Vec<String>> = HashMap::new();
        let mut membership: HashMap<String, Vec<String>> = HashMap::new();

        for tier in &config.tiers {
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            for id in &tier.providers {
                if !config.providers.iter().any(|p| &p.id == id) {
                    return Err(Error::Config(format!(
                        "Tier '{}' references unknown provider '{}'",
                        tier.name, id
                    )));
                }
                if seen.insert(id.clone()) {
                    order.push(id.clone());
                    membership
                        .entry(id.clone())
                        .or_default()
                        .push(tier.name.clone());
                }
            }
            tiers.insert(tier.name.clone(), order);
        }

        let mut providers = HashMap::new();
        for entry in &config.providers {
            let provider_tiers = membership.remove(&entry.id).unwrap_or_default();
            providers.insert(
                entry.id.clone(),
                Provider::new(
                    entry.id.clone(),
                    provider_tiers,
                    entry.initial_score,
                    entry.cost_per_call,
                    entry.daily_quota_tokens,
                    config.circuit.clone(),
                    now,
                ),
            );
        }

        Ok(Self {
            providers: RwLock::new(providers),
            tiers,
            circuit_config: config.circuit.clone(),
        })
    }

    /// Get a copy of a provider record
    pub fn get(&self, provider_id: &str) -> Result<Provider> {
        self.read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| Error::UnknownProvider(provider_id.to_string()))
    }

    /// Providers configured for a tier, in static preference order
    pub fn list_by_tier(&self, tier: &str) -> Result<Vec<String>> {
        self.tiers
            .get(tier)
            .cloned()
            .ok_or_else(|| Error::UnknownTier(tier.to_string()))
    }

    /// All configured tier names, sorted
    pub fn tier_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tiers.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered provider ids, sorted
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Set the score for a (provider, tier) pair, clamped to [0, 100]
    pub fn update_score(&self, provider_id: &str, tier: &str, score: f64) -> Result<()> {
        self.with_provider(provider_id, |p| p.set_score(tier, score))?
    }

    /// Serializable state of every provider, sorted by id
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        let guard = self.read();
        let mut snaps: Vec<ProviderSnapshot> = guard.values().map(Provider::to_snapshot).collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        snaps
    }

    /// Apply persisted state onto configured providers.
    ///
    /// Quota limits stay as configured; scores, usage counters, reset
    /// times, and circuit state come from the snapshot. Records for ids
    /// that are no longer configured are skipped. Returns the number of
    /// providers updated.
    pub fn restore(&self, snapshots: &[ProviderSnapshot]) -> usize {
        let now = Utc::now();
        let mut guard = self.write();
        let mut applied = 0;

        for snap in snapshots {
            let Some(provider) = guard.get_mut(&snap.id) else {
                warn!(provider = %snap.id, "snapshot references unknown provider, skipping");
                continue;
            };

            for (tier, score) in &snap.scores {
                if provider.scores.contains_key(tier) {
                    provider.scores.insert(tier.clone(), score.clamp(0.0, 100.0));
                }
            }
            provider.force_quota(snap.quota_used, snap.quota_reset_at);
            provider.circuit = CircuitBreaker::restore(
                self.circuit_config.clone(),
                snap.circuit_state,
                snap.consecutive_failures,
                now,
            );
            applied += 1;
        }

        info!(applied, total = snapshots.len(), "restored provider state from snapshot");
        applied
    }

    /// Run a closure against a provider record under the write lock.
    ///
    /// Every check-then-act pair in the crate goes through this single
    /// hold so concurrent dispatches cannot both claim the last unit of
    /// quota or race a circuit transition.
    pub(crate) fn with_provider<R>(
        &self,
        provider_id: &str,
        f: impl FnOnce(&mut Provider) -> R,
    ) -> Result<R> {
        let mut guard = self.write();
        let provider = guard
            .get_mut(provider_id)
            .ok_or_else(|| Error::UnknownProvider(provider_id.to_string()))?;
        Ok(f(provider))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Provider>> {
        self.providers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Provider>> {
        self.providers.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_ids())
            .field("tiers", &self.tier_names())
            .finish()
    }
}
