//! Adaptive multi-provider dispatch
//!
//! This module decides which backend provider should handle the next unit
//! of work. The key components are:
//!
//! - **Provider Registry**: the shared records holding per-tier scores,
//!   quota counters, and circuit state for every configured provider.
//!
//! - **Quota Tracker**: renewable daily token budgets with a lazy
//!   check-on-access reset, enforced before dispatch.
//!
//! - **Circuit Breaker**: per-provider Closed/Open/HalfOpen fault
//!   isolation that stops routing to failing providers and probes
//!   recovery after a cooldown.
//!
//! - **Fallback Resolver**: turns a tier's static preference order into
//!   the currently eligible candidate list.
//!
//! - **Adaptive Scorer**: ε-greedy selection over learned Q-values,
//!   updated from reported outcomes.
//!
//! - **Dispatcher**: the public entry point composing all of the above,
//!   with snapshot persistence through an injected store.
//!
//! ## How it works
//!
//! 1. A caller asks the dispatcher to select a provider for a tier
//! 2. The resolver filters the tier's preference order through the
//!    circuit and quota gates
//! 3. The scorer picks among the survivors, mostly exploiting the best
//!    known score and occasionally exploring
//! 4. The caller executes the work out of band and reports the outcome,
//!    which updates quota, circuit, and score state
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchyard_core::config::Config;
//! use switchyard_core::dispatch::{Dispatcher, DispatchRequest, Outcome};
//!
//! let dispatcher = Dispatcher::from_config(Config::load()?)?;
//!
//! let request = DispatchRequest::new("fast", 1_200);
//! let handle = dispatcher.select(&request).await?;
//!
//! // ... run the work against handle.provider_id ...
//!
//! let outcome = Outcome::success(&handle.provider_id, &handle.tier)
//!     .with_tokens(950)
//!     .with_latency(820);
//! dispatcher.report_outcome(&handle, outcome).await?;
//! ```

mod circuit;
mod dispatcher;
mod events;
mod quota;
mod registry;
mod resolver;
mod scorer;
mod store;
mod types;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState, CircuitSupervisor};
pub use dispatcher::{
    Dispatcher, DispatcherBuilder, InvokeError, InvokeReceipt, ProviderInvoker,
};
pub use events::{DispatchEvent, DispatchObserver, EventLog};
pub use quota::QuotaTracker;
pub use registry::{Provider, ProviderRegistry};
pub use resolver::FallbackResolver;
pub use scorer::{AdaptiveScorer, ScoreUpdate, Selection};
pub use store::{
    CREATE_PROVIDER_STATE_TABLE_SQL, MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore,
};
pub use types::{
    DispatchHandle, DispatchRequest, Outcome, Priority, ProviderSnapshot, TierStats,
};
