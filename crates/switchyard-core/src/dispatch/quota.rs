//! Daily token quota tracking with lazy reset
//!
//! Budgets renew on a daily schedule checked on access, not by a timer.
//! `consume` re-validates under the registry lock, so the usual
//! `has_capacity` -> `consume` sequence cannot let two concurrent
//! dispatches share the last tokens of a window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::registry::ProviderRegistry;
use crate::error::Result;

/// Registry-backed quota operations
pub struct QuotaTracker {
    registry: Arc<ProviderRegistry>,
}

impl QuotaTracker {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Whether the provider can absorb `tokens_needed` in the current window
    pub fn has_capacity(&self, provider_id: &str, tokens_needed: u64) -> Result<bool> {
        self.has_capacity_at(provider_id, tokens_needed, Utc::now())
    }

    pub fn has_capacity_at(
        &self,
        provider_id: &str,
        tokens_needed: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.registry.with_provider(provider_id, |p| {
            p.reset_quota_if_due(now);
            p.quota_remaining() >= tokens_needed
        })
    }

    /// Count consumed tokens against the provider's window.
    ///
    /// Rejects with `QuotaExceeded` without mutating state if the request
    /// would overrun the limit. Returns the tokens remaining afterwards.
    pub fn consume(&self, provider_id: &str, tokens_used: u64) -> Result<u64> {
        self.consume_at(provider_id, tokens_used, Utc::now())
    }

    pub fn consume_at(
        &self,
        provider_id: &str,
        tokens_used: u64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let remaining = self.registry.with_provider(provider_id, |p| {
            if p.reset_quota_if_due(now) {
                debug!(provider = %p.id(), next_reset = %p.quota_reset_at(), "quota window reset");
            }
            p.consume(tokens_used)
        })??;

        Ok(remaining)
    }

    /// Run the lazy reset check without consuming anything
    pub fn reset_if_due(&self, provider_id: &str) -> Result<()> {
        self.registry.with_provider(provider_id, |p| {
            p.reset_quota_if_due(Utc::now());
        })
    }
}
