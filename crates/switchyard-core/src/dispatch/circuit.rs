//! Circuit breaker for provider fault isolation
//!
//! Each provider carries a three-state breaker: repeated failures open it,
//! a cooldown lets a limited number of trial requests through, and trial
//! successes close it again. The open-to-half-open transition happens
//! lazily on the next availability check rather than on a timer.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::events::{DispatchEvent, DispatchObserver};
use super::registry::ProviderRegistry;
use crate::error::Result;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, testing if the provider recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("Unknown circuit state: {}", s)),
        }
    }
}

/// Tunables for the per-provider circuit state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to wait before letting trial requests through
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Consecutive half-open successes required to close again
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Per-provider circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Failure count while closed
    consecutive_failures: u32,
    /// Success count while half-open
    half_open_successes: u32,
    last_transition: DateTime<Utc>,
    config: CircuitConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_transition: now,
            config,
        }
    }

    /// Rebuild a breaker from persisted state.
    ///
    /// The transition timestamp is not part of the at-rest schema, so a
    /// restored Open circuit restarts its recovery cooldown from `now`.
    pub(crate) fn restore(
        config: CircuitConfig,
        state: CircuitState,
        consecutive_failures: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state,
            consecutive_failures,
            half_open_successes: 0,
            last_transition: now,
            config,
        }
    }

    /// Current state without the lazy open-to-half-open check
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether requests may be routed to this provider.
    ///
    /// Performs the lazy Open -> HalfOpen transition as a side effect once
    /// the recovery timeout has elapsed.
    pub fn is_available_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CircuitState::Open {
            let elapsed = now - self.last_transition;
            if elapsed >= Duration::seconds(self.config.recovery_timeout_secs as i64) {
                self.half_open(now);
            }
        }

        self.state != CircuitState::Open
    }

    /// Record a failed call
    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during the trial window reopens the circuit
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful call
    pub fn record_success_at(&mut self, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.close(now);
                }
            }
            CircuitState::Open => {
                // Successes cannot be observed while calls are rejected
            }
        }
    }

    /// Force the circuit back to Closed, clearing all counters.
    ///
    /// This is the only sanctioned way to override the state machine.
    pub fn force_reset(&mut self, now: DateTime<Utc>) {
        self.close(now);
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.last_transition = now;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
    }

    fn half_open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::HalfOpen;
        self.last_transition = now;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Closed;
        self.last_transition = now;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
    }
}

/// Registry-backed circuit operations shared by the resolver and dispatcher.
///
/// All methods are O(1) reads/writes on the provider record; transitions
/// are reported to the injected observer.
pub struct CircuitSupervisor {
    registry: Arc<ProviderRegistry>,
    observer: Option<Arc<dyn DispatchObserver>>,
}

impl CircuitSupervisor {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Whether the provider's circuit currently admits requests
    pub fn is_available(&self, provider_id: &str) -> Result<bool> {
        self.is_available_at(provider_id, Utc::now())
    }

    pub fn is_available_at(&self, provider_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let (available, transition) = self.registry.with_provider(provider_id, |p| {
            let before = p.circuit.state();
            let available = p.circuit.is_available_at(now);
            let after = p.circuit.state();
            (available, (before != after).then_some((before, after)))
        })?;

        if let Some((from, to)) = transition {
            debug!(provider = %provider_id, %from, %to, "circuit entered trial window");
            self.emit_transition(provider_id, from, to);
        }

        Ok(available)
    }

    pub fn record_success(&self, provider_id: &str) -> Result<()> {
        self.record_success_at(provider_id, Utc::now())
    }

    pub fn record_success_at(&self, provider_id: &str, now: DateTime<Utc>) -> Result<()> {
        let transition = self.registry.with_provider(provider_id, |p| {
            let before = p.circuit.state();
            p.circuit.record_success_at(now);
            let after = p.circuit.state();
            (before != after).then_some((before, after))
        })?;

        if let Some((from, to)) = transition {
            debug!(provider = %provider_id, %from, %to, "circuit recovered");
            self.emit_transition(provider_id, from, to);
        }

        Ok(())
    }

    pub fn record_failure(&self, provider_id: &str, reason: &str) -> Result<()> {
        self.record_failure_at(provider_id, reason, Utc::now())
    }

    pub fn record_failure_at(
        &self,
        provider_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (transition, failures) = self.registry.with_provider(provider_id, |p| {
            let before = p.circuit.state();
            p.circuit.record_failure_at(now);
            let after = p.circuit.state();
            (
                (before != after).then_some((before, after)),
                p.circuit.consecutive_failures(),
            )
        })?;

        debug!(provider = %provider_id, reason = %reason, failures, "recorded provider failure");

        if let Some((from, to)) = transition {
            warn!(provider = %provider_id, %from, %to, reason = %reason, "circuit state changed");
            self.emit_transition(provider_id, from, to);
        }

        Ok(())
    }

    /// Explicit operator override: close the circuit and clear counters
    pub fn force_reset(&self, provider_id: &str) -> Result<()> {
        let now = Utc::now();
        let transition = self.registry.with_provider(provider_id, |p| {
            let before = p.circuit.state();
            p.circuit.force_reset(now);
            (before != CircuitState::Closed).then_some((before, CircuitState::Closed))
        })?;

        if let Some((from, to)) = transition {
            warn!(provider = %provider_id, %from, "circuit forcibly reset");
            self.emit_transition(provider_id, from, to);
        }

        Ok(())
    }

    fn emit_transition(&self, provider_id: &str, from: CircuitState, to: CircuitState) {
        if let Some(observer) = &self.observer {
            observer.on_event(&DispatchEvent::CircuitTransition {
                provider_id: provider_id.to_string(),
                from,
                to,
            });
        }
    }
}
