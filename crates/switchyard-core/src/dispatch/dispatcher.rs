//! Dispatch orchestration
//!
//! The `Dispatcher` composes the registry, quota tracker, circuit
//! supervisor, fallback resolver, and adaptive scorer behind the two-call
//! public contract: `select` hands out a provider plus a one-shot handle,
//! and `report_outcome` feeds the observed result back through quota,
//! circuit, and score updates, then snapshots state through the injected
//! store. The caller executes the actual work out of band, or lets
//! `execute` drive an injected invoker through the fallback chain.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit::CircuitSupervisor;
use super::events::{DispatchEvent, DispatchObserver};
use super::quota::QuotaTracker;
use super::registry::ProviderRegistry;
use super::resolver::FallbackResolver;
use super::scorer::AdaptiveScorer;
use super::store::SnapshotStore;
use super::types::{DispatchHandle, DispatchRequest, Outcome, ProviderSnapshot, TierStats};
use crate::config::{Config, DispatchConfig};
use crate::error::{Error, Result};

/// Usage observed while invoking a provider
#[derive(Debug, Clone, Default)]
pub struct InvokeReceipt {
    /// Tokens actually consumed
    pub tokens_consumed: u64,
    /// Observed latency in milliseconds
    pub latency_ms: u64,
    /// Optional quality signal in [0, 1]
    pub quality: Option<f64>,
}

/// Failure reported by an invoker, with whatever usage still accrued
#[derive(Debug, Clone)]
pub struct InvokeError {
    pub message: String,
    pub tokens_consumed: u64,
    pub latency_ms: u64,
}

impl InvokeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            tokens_consumed: 0,
            latency_ms: 0,
        }
    }
}

impl std::fmt::Display for InvokeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InvokeError {}

/// Injected capability that performs the actual call to a backend.
///
/// The core never imports a provider SDK; embedders implement this trait
/// and either drive `select`/`report_outcome` themselves or hand the
/// invoker to `Dispatcher::execute`.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    type Output: Send;

    async fn invoke(
        &self,
        provider_id: &str,
        request: &DispatchRequest,
    ) -> std::result::Result<(Self::Output, InvokeReceipt), InvokeError>;
}

/// A dispatch awaiting its outcome report
#[derive(Debug, Clone)]
#[allow(dead_code)]
struct PendingDispatch {
    provider_id: String,
    tier: String,
    /// Issue time kept for future staleness diagnostics
    issued_at: DateTime<Utc>,
}

/// Orchestrator for adaptive multi-provider dispatch
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    quota: QuotaTracker,
    circuit: CircuitSupervisor,
    resolver: FallbackResolver,
    scorer: AdaptiveScorer,
    store: Option<Arc<dyn SnapshotStore>>,
    observer: Option<Arc<dyn DispatchObserver>>,
    /// Handles issued but not yet reported
    pending: RwLock<HashMap<Uuid, PendingDispatch>>,
    config: DispatchConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("has_store", &self.store.is_some())
            .field("has_observer", &self.observer.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build a dispatcher from configuration with no store or observer
    pub fn from_config(config: Config) -> Result<Self> {
        DispatcherBuilder::new(config).build()
    }

    /// Start building a dispatcher
    pub fn builder(config: Config) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    /// Choose a provider for a request and issue a one-shot handle.
    ///
    /// Never blocks on I/O. Errors with `UnknownTier` when the tier has no
    /// configured providers and `NoEligibleProvider` when every candidate
    /// is filtered out by the circuit or quota gates.
    pub async fn select(&self, request: &DispatchRequest) -> Result<DispatchHandle> {
        let candidates = self.resolver.resolve(&request.tier, request.estimated_tokens)?;
        let selection = self.scorer.pick(
            &request.tier,
            &candidates,
            request.priority.unwrap_or_default(),
        )?;

        let handle = DispatchHandle {
            id: Uuid::new_v4(),
            provider_id: selection.provider_id.clone(),
            tier: request.tier.clone(),
            estimated_tokens: request.estimated_tokens,
            deadline: request.deadline,
            issued_at: Utc::now(),
        };

        {
            let mut pending = self.pending.write().await;
            pending.insert(
                handle.id,
                PendingDispatch {
                    provider_id: handle.provider_id.clone(),
                    tier: handle.tier.clone(),
                    issued_at: handle.issued_at,
                },
            );
        }

        debug!(
            tier = %request.tier,
            provider = %handle.provider_id,
            score = selection.score,
            explored = selection.explored,
            candidates = candidates.len(),
            "selected provider for dispatch"
        );

        Ok(handle)
    }

    /// Report the observed outcome for a handle, exactly once.
    ///
    /// Updates run in order: quota consume, circuit record, score update,
    /// then a best-effort snapshot save. A second report for the same
    /// handle fails with `DuplicateReport` and leaves all state untouched.
    /// A `QuotaExceeded` raised by the re-validating consume propagates;
    /// it is never silently absorbed.
    pub async fn report_outcome(&self, handle: &DispatchHandle, outcome: Outcome) -> Result<()> {
        if outcome.provider_id != handle.provider_id || outcome.tier != handle.tier {
            return Err(Error::InvalidInput(format!(
                "Outcome for '{}' / tier '{}' does not match handle {} ('{}' / tier '{}')",
                outcome.provider_id, outcome.tier, handle.id, handle.provider_id, handle.tier
            )));
        }

        let pending = {
            let mut pending = self.pending.write().await;
            pending.remove(&handle.id)
        }
        .ok_or(Error::DuplicateReport(handle.id))?;

        let remaining = self
            .quota
            .consume(&pending.provider_id, outcome.tokens_consumed)?;
        if remaining == 0 && outcome.tokens_consumed > 0 {
            let quota_limit = self.registry.get(&pending.provider_id)?.quota_limit();
            info!(provider = %pending.provider_id, quota_limit, "provider quota exhausted");
            if let Some(observer) = &self.observer {
                observer.on_event(&DispatchEvent::QuotaExhausted {
                    provider_id: pending.provider_id.clone(),
                    quota_limit,
                });
            }
        }

        if outcome.success {
            self.circuit.record_success(&pending.provider_id)?;
        } else {
            let reason = outcome.error.as_deref().unwrap_or("reported failure");
            self.circuit.record_failure(&pending.provider_id, reason)?;
        }

        self.scorer.apply(&outcome)?;

        debug!(
            handle = %handle.id,
            provider = %pending.provider_id,
            tier = %pending.tier,
            success = outcome.success,
            tokens = outcome.tokens_consumed,
            "recorded dispatch outcome"
        );

        if self.config.persist_on_report {
            if let Some(store) = &self.store {
                if let Err(err) = store.save(&self.registry.snapshot()).await {
                    warn!(error = %err, "snapshot save failed; in-memory state retained");
                    if let Some(observer) = &self.observer {
                        observer.on_event(&DispatchEvent::SnapshotFailed {
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Drive an injected invoker through the fallback chain.
    ///
    /// Each attempt is a fresh `select` + invoke + `report_outcome` cycle,
    /// so failures feed the circuit and the scores before the next
    /// candidate is chosen. Gives up after `max_attempts` with the
    /// per-attempt error summary. Backoff policy stays with the caller.
    pub async fn execute<I: ProviderInvoker>(
        &self,
        request: &DispatchRequest,
        invoker: &I,
    ) -> Result<I::Output> {
        let mut attempts: Vec<String> = Vec::new();

        for _ in 0..self.config.max_attempts.max(1) {
            let handle = match self.select(request).await {
                Ok(handle) => handle,
                Err(err) if attempts.is_empty() => return Err(err),
                Err(_) => break,
            };

            match invoker.invoke(&handle.provider_id, request).await {
                Ok((output, receipt)) => {
                    let mut outcome = Outcome::success(&handle.provider_id, &handle.tier)
                        .with_tokens(receipt.tokens_consumed)
                        .with_latency(receipt.latency_ms);
                    if let Some(quality) = receipt.quality {
                        outcome = outcome.with_quality(quality);
                    }
                    self.report_outcome(&handle, outcome).await?;
                    return Ok(output);
                }
                Err(failure) => {
                    warn!(
                        provider = %handle.provider_id,
                        tier = %handle.tier,
                        error = %failure,
                        "provider invocation failed, trying next candidate"
                    );
                    let outcome = Outcome::failure(&handle.provider_id, &handle.tier)
                        .with_tokens(failure.tokens_consumed)
                        .with_latency(failure.latency_ms)
                        .with_error(&failure.message);
                    self.report_outcome(&handle, outcome).await?;
                    attempts.push(format!("{}: {}", handle.provider_id, failure.message));
                }
            }
        }

        Err(Error::DispatchExhausted {
            tier: request.tier.clone(),
            attempts,
        })
    }

    /// Re-derive provider state from the last successful snapshot.
    ///
    /// Returns the number of providers restored; 0 when no store is wired.
    pub async fn load_state(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let snapshots = store.load().await?;
        Ok(self.registry.restore(&snapshots))
    }

    /// Persist the current provider state through the injected store
    pub async fn save_state(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(&self.registry.snapshot()).await
    }

    /// Pull-based export of every provider's current state
    pub fn snapshot(&self) -> Vec<ProviderSnapshot> {
        self.registry.snapshot()
    }

    /// Per-tier call statistics for one provider
    pub fn provider_stats(&self, provider_id: &str) -> Result<HashMap<String, TierStats>> {
        let provider = self.registry.get(provider_id)?;
        Ok(provider
            .tiers()
            .iter()
            .filter_map(|tier| {
                provider
                    .tier_stats(tier)
                    .map(|stats| (tier.clone(), stats.clone()))
            })
            .collect())
    }

    /// Number of handles issued but not yet reported
    pub async fn pending_dispatches(&self) -> usize {
        self.pending.read().await.len()
    }

    /// The shared provider registry
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Circuit operations, including the explicit reset override
    pub fn circuit(&self) -> &CircuitSupervisor {
        &self.circuit
    }

    /// The current dispatcher configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

/// Builder for `Dispatcher`
pub struct DispatcherBuilder {
    config: Config,
    store: Option<Arc<dyn SnapshotStore>>,
    observer: Option<Arc<dyn DispatchObserver>>,
    seed: Option<u64>,
}

impl DispatcherBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            observer: None,
            seed: None,
        }
    }

    /// Set the snapshot store
    pub fn store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event observer
    pub fn observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Fix the exploration RNG seed (for reproducibility in tests)
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration and assemble the dispatcher
    pub fn build(self) -> Result<Dispatcher> {
        self.config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let registry = Arc::new(ProviderRegistry::from_config(&self.config)?);

        let mut circuit = CircuitSupervisor::new(registry.clone());
        if let Some(observer) = &self.observer {
            circuit = circuit.with_observer(observer.clone());
        }

        let mut resolver_circuit = CircuitSupervisor::new(registry.clone());
        if let Some(observer) = &self.observer {
            resolver_circuit = resolver_circuit.with_observer(observer.clone());
        }
        let mut resolver = FallbackResolver::new(
            registry.clone(),
            QuotaTracker::new(registry.clone()),
            resolver_circuit,
        );
        if let Some(max) = self.config.dispatch.max_candidates {
            resolver = resolver.with_max_candidates(max);
        }

        let mut scorer = match self.seed {
            Some(seed) => {
                AdaptiveScorer::with_seed(registry.clone(), self.config.learning.clone(), seed)
            }
            None => AdaptiveScorer::new(registry.clone(), self.config.learning.clone()),
        };
        if let Some(observer) = &self.observer {
            scorer = scorer.with_observer(observer.clone());
        }

        info!(
            providers = self.config.providers.len(),
            tiers = self.config.tiers.len(),
            "dispatcher assembled"
        );

        Ok(Dispatcher {
            quota: QuotaTracker::new(registry.clone()),
            circuit,
            resolver,
            scorer,
            store: self.store,
            observer: self.observer,
            pending: RwLock::new(HashMap::new()),
            config: self.config.dispatch.clone(),
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LearningConfig, ProviderConfig, TierConfig};
    use crate::dispatch::circuit::{CircuitConfig, CircuitState};
    use crate::dispatch::events::EventLog;
    use crate::dispatch::store::MemorySnapshotStore;
    use std::collections::HashSet;

    fn test_config(quota: u64) -> Config {
        Config {
            tiers: vec![TierConfig {
                name: "fast".into(),
                providers: vec!["alpha".into(), "beta".into()],
            }],
            providers: vec![
                ProviderConfig {
                    id: "alpha".into(),
                    initial_score: 70.0,
                    daily_quota_tokens: quota,
                    cost_per_call: 0.01,
                },
                ProviderConfig {
                    id: "beta".into(),
                    initial_score: 30.0,
                    daily_quota_tokens: quota,
                    cost_per_call: 0.001,
                },
            ],
            circuit: CircuitConfig {
                failure_threshold: 2,
                recovery_timeout_secs: 60,
                half_open_max_calls: 3,
            },
            // Greedy policy keeps selections deterministic in tests
            learning: LearningConfig {
                epsilon: 0.0,
                epsilon_min: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn build(config: Config) -> Dispatcher {
        Dispatcher::builder(config).seed(7).build().unwrap()
    }

    struct ScriptedInvoker {
        failing: HashSet<String>,
    }

    impl ScriptedInvoker {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl ProviderInvoker for ScriptedInvoker {
        type Output = String;

        async fn invoke(
            &self,
            provider_id: &str,
            _request: &DispatchRequest,
        ) -> std::result::Result<(String, InvokeReceipt), InvokeError> {
            if self.failing.contains(provider_id) {
                return Err(InvokeError {
                    message: "backend unavailable".into(),
                    tokens_consumed: 5,
                    latency_ms: 40,
                });
            }
            Ok((
                format!("handled by {provider_id}"),
                InvokeReceipt {
                    tokens_consumed: 10,
                    latency_ms: 120,
                    quality: None,
                },
            ))
        }
    }

    #[tokio::test]
    async fn select_prefers_highest_score() {
        let dispatcher = build(test_config(1_000));

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap();

        assert_eq!(handle.provider_id, "alpha");
        assert_eq!(handle.tier, "fast");
        assert_eq!(dispatcher.pending_dispatches().await, 1);
    }

    #[tokio::test]
    async fn unknown_tier_errors() {
        let dispatcher = build(test_config(1_000));
        let err = dispatcher
            .select(&DispatchRequest::new("archive", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTier(_)));
    }

    #[tokio::test]
    async fn all_circuits_open_means_no_eligible_provider() {
        let dispatcher = build(test_config(1_000));
        for provider in ["alpha", "beta"] {
            dispatcher.circuit().record_failure(provider, "down").unwrap();
            dispatcher.circuit().record_failure(provider, "down").unwrap();
        }

        let err = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEligibleProvider(_)));
    }

    #[tokio::test]
    async fn report_outcome_updates_quota_circuit_and_score() {
        let dispatcher = build(test_config(1_000));

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap();
        let outcome = Outcome::success(&handle.provider_id, "fast")
            .with_tokens(80)
            .with_latency(150);
        dispatcher.report_outcome(&handle, outcome).await.unwrap();

        let alpha = dispatcher.registry().get("alpha").unwrap();
        assert_eq!(alpha.quota_used(), 80);
        assert_eq!(alpha.circuit_state(), CircuitState::Closed);
        // 70 + 0.1 * (100 - 70) = 73
        assert!((alpha.score("fast").unwrap() - 73.0).abs() < 1e-9);

        let stats = dispatcher.provider_stats("alpha").unwrap();
        assert_eq!(stats.get("fast").unwrap().successes, 1);
        assert_eq!(dispatcher.pending_dispatches().await, 0);
    }

    #[tokio::test]
    async fn duplicate_report_is_rejected_and_state_unchanged() {
        let dispatcher = build(test_config(1_000));

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap();
        let outcome = Outcome::success(&handle.provider_id, "fast").with_tokens(50);
        dispatcher
            .report_outcome(&handle, outcome.clone())
            .await
            .unwrap();

        let before = dispatcher.registry().get("alpha").unwrap();
        let err = dispatcher.report_outcome(&handle, outcome).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateReport(id) if id == handle.id));

        let after = dispatcher.registry().get("alpha").unwrap();
        assert_eq!(after.quota_used(), before.quota_used());
        assert_eq!(after.score("fast"), before.score("fast"));
    }

    #[tokio::test]
    async fn mismatched_outcome_is_rejected_before_consuming_the_handle() {
        let dispatcher = build(test_config(1_000));

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap();
        let err = dispatcher
            .report_outcome(&handle, Outcome::success("beta", "fast"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // The handle is still pending and can be reported correctly
        assert_eq!(dispatcher.pending_dispatches().await, 1);
        dispatcher
            .report_outcome(&handle, Outcome::success(&handle.provider_id, "fast"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failures_open_circuit_and_divert_traffic() {
        let dispatcher = build(test_config(1_000));

        for _ in 0..2 {
            let handle = dispatcher
                .select(&DispatchRequest::new("fast", 10))
                .await
                .unwrap();
            assert_eq!(handle.provider_id, "alpha");
            let outcome = Outcome::failure("alpha", "fast").with_error("timeout");
            dispatcher.report_outcome(&handle, outcome).await.unwrap();
        }

        assert_eq!(
            dispatcher.registry().get("alpha").unwrap().circuit_state(),
            CircuitState::Open
        );

        // Traffic falls back to the next provider in the tier
        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 10))
            .await
            .unwrap();
        assert_eq!(handle.provider_id, "beta");
    }

    #[tokio::test]
    async fn quota_exhaustion_emits_event_and_filters_provider() {
        let log = Arc::new(EventLog::new());
        let dispatcher = Dispatcher::builder(test_config(100))
            .observer(log.clone())
            .seed(7)
            .build()
            .unwrap();

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 100))
            .await
            .unwrap();
        let outcome = Outcome::success("alpha", "fast").with_tokens(100);
        dispatcher.report_outcome(&handle, outcome).await.unwrap();

        assert!(log.events().iter().any(|e| matches!(
            e,
            DispatchEvent::QuotaExhausted { provider_id, quota_limit: 100 } if provider_id == "alpha"
        )));

        // Alpha is out of quota, beta takes over
        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 50))
            .await
            .unwrap();
        assert_eq!(handle.provider_id, "beta");
    }

    #[tokio::test]
    async fn snapshot_persists_through_store_on_report() {
        let store = Arc::new(MemorySnapshotStore::new());
        let dispatcher = Dispatcher::builder(test_config(1_000))
            .store(store.clone())
            .seed(7)
            .build()
            .unwrap();

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 10))
            .await
            .unwrap();
        dispatcher
            .report_outcome(&handle, Outcome::success("alpha", "fast").with_tokens(10))
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        let saved = store.load().await.unwrap();
        let alpha = saved.iter().find(|s| s.id == "alpha").unwrap();
        assert_eq!(alpha.quota_used, 10);
    }

    struct FailingStore;

    #[async_trait]
    impl SnapshotStore for FailingStore {
        async fn load(&self) -> Result<Vec<ProviderSnapshot>> {
            Err(Error::Persistence("disk on fire".into()))
        }
        async fn save(&self, _snapshot: &[ProviderSnapshot]) -> Result<()> {
            Err(Error::Persistence("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_surfaced_but_does_not_fail_the_report() {
        let log = Arc::new(EventLog::new());
        let dispatcher = Dispatcher::builder(test_config(1_000))
            .store(Arc::new(FailingStore))
            .observer(log.clone())
            .seed(7)
            .build()
            .unwrap();

        let handle = dispatcher
            .select(&DispatchRequest::new("fast", 10))
            .await
            .unwrap();
        dispatcher
            .report_outcome(&handle, Outcome::success("alpha", "fast").with_tokens(10))
            .await
            .unwrap();

        // The in-memory update survived even though the save failed
        assert_eq!(dispatcher.registry().get("alpha").unwrap().quota_used(), 10);
        assert!(log
            .events()
            .iter()
            .any(|e| matches!(e, DispatchEvent::SnapshotFailed { .. })));

        // An explicit save propagates the error instead
        assert!(matches!(
            dispatcher.save_state().await,
            Err(Error::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn load_state_restores_persisted_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());

        {
            let dispatcher = Dispatcher::builder(test_config(1_000))
                .store(store.clone())
                .seed(7)
                .build()
                .unwrap();
            let handle = dispatcher
                .select(&DispatchRequest::new("fast", 10))
                .await
                .unwrap();
            dispatcher
                .report_outcome(&handle, Outcome::success("alpha", "fast").with_tokens(500))
                .await
                .unwrap();
        }

        // A fresh process picks the state back up
        let dispatcher = Dispatcher::builder(test_config(1_000))
            .store(store)
            .seed(7)
            .build()
            .unwrap();
        assert_eq!(dispatcher.load_state().await.unwrap(), 2);
        assert_eq!(
            dispatcher.registry().get("alpha").unwrap().quota_used(),
            500
        );
    }

    #[tokio::test]
    async fn execute_falls_back_to_working_provider() {
        let dispatcher = build(test_config(1_000));
        let invoker = ScriptedInvoker::failing(&["alpha"]);

        let output = dispatcher
            .execute(&DispatchRequest::new("fast", 10), &invoker)
            .await
            .unwrap();
        assert_eq!(output, "handled by beta");

        // The failed attempt was reported against alpha
        let stats = dispatcher.provider_stats("alpha").unwrap();
        assert_eq!(stats.get("fast").unwrap().failures, 1);
        let stats = dispatcher.provider_stats("beta").unwrap();
        assert_eq!(stats.get("fast").unwrap().successes, 1);
        assert_eq!(dispatcher.pending_dispatches().await, 0);
    }

    #[tokio::test]
    async fn execute_exhausts_after_max_attempts() {
        let mut config = test_config(1_000);
        config.dispatch.max_attempts = 3;
        let dispatcher = build(config);
        let invoker = ScriptedInvoker::failing(&["alpha", "beta"]);

        let err = dispatcher
            .execute(&DispatchRequest::new("fast", 10), &invoker)
            .await
            .unwrap_err();

        match err {
            Error::DispatchExhausted { tier, attempts } => {
                assert_eq!(tier, "fast");
                assert_eq!(attempts.len(), 3);
                assert!(attempts[0].contains("backend unavailable"));
            }
            other => panic!("expected DispatchExhausted, got: {other}"),
        }
    }

    #[tokio::test]
    async fn execute_surfaces_selection_error_when_nothing_was_tried() {
        let dispatcher = build(test_config(1_000));
        let invoker = ScriptedInvoker::failing(&[]);

        let err = dispatcher
            .execute(&DispatchRequest::new("archive", 10), &invoker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTier(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_cycles_never_overrun_the_quota() {
        let mut config = test_config(1_000);
        // Single provider so every cycle lands on the same quota window
        config.tiers[0].providers = vec!["alpha".into()];
        config.providers.truncate(1);
        let dispatcher = Arc::new(build(config));

        let mut handles = Vec::new();
        for _ in 0..1_000 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let handle = dispatcher.select(&DispatchRequest::new("fast", 1)).await?;
                let outcome = Outcome::success(&handle.provider_id, "fast").with_tokens(1);
                dispatcher.report_outcome(&handle, outcome).await
            }));
        }

        let mut ok = 0;
        for task in handles {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        let alpha = dispatcher.registry().get("alpha").unwrap();
        assert!(alpha.quota_used() <= alpha.quota_limit());
        assert_eq!(alpha.quota_used(), 1_000);
        assert_eq!(ok, 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn overcommitted_concurrency_stops_exactly_at_the_limit() {
        let mut config = test_config(50);
        config.tiers[0].providers = vec!["alpha".into()];
        config.providers.truncate(1);
        let dispatcher = Arc::new(build(config));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let handle = dispatcher.select(&DispatchRequest::new("fast", 1)).await?;
                let outcome = Outcome::success(&handle.provider_id, "fast").with_tokens(1);
                dispatcher.report_outcome(&handle, outcome).await
            }));
        }

        let mut ok = 0;
        for task in handles {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                // Losers of the race are told explicitly, never silently
                Err(Error::NoEligibleProvider(_)) | Err(Error::QuotaExceeded { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let alpha = dispatcher.registry().get("alpha").unwrap();
        assert_eq!(alpha.quota_used(), 50);
        assert_eq!(ok, 50);
    }

    #[tokio::test]
    async fn builder_rejects_invalid_config() {
        let err = Dispatcher::builder(Config::default()).build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
