//! Switchyard Core Library
//!
//! This crate provides the adaptive multi-provider dispatch core:
//! - Provider registry with per-tier scores and quota counters
//! - Daily token quotas with lazy reset
//! - Per-provider circuit breaking (Closed / Open / HalfOpen)
//! - Tier fallback resolution
//! - ε-greedy / Q-learning provider selection
//! - Snapshot persistence behind a narrow store contract

pub mod config;
pub mod dispatch;
pub mod error;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::{
        DispatchHandle, DispatchRequest, Dispatcher, Outcome, Priority, SnapshotStore,
    };
    pub use crate::error::{Error, Result};
}
