//! Configuration management with file persistence
//!
//! Provider definitions, tier preference orders, and tuning parameters are
//! loaded once at startup; hot-reload is out of scope.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::dispatch::CircuitConfig;

/// Switchyard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tier preference tables, each an ordered provider-id list
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
    /// Static provider definitions
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Circuit breaker tuning
    #[serde(default)]
    pub circuit: CircuitConfig,
    /// Learning-policy tuning
    #[serde(default)]
    pub learning: LearningConfig,
    /// Dispatcher behavior
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

/// One priority tier: a name plus its static fallback order.
///
/// Tier tables are the single source of tier membership; a provider's tier
/// set is derived from the tables that list it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub providers: Vec<String>,
}

/// Static definition of one backend provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable id, referenced by tier tables
    pub id: String,
    /// Starting score for every tier the provider belongs to
    #[serde(default = "default_initial_score")]
    pub initial_score: f64,
    /// Renewable daily token budget
    pub daily_quota_tokens: u64,
    /// Approximate cost per call, used only for Cost-priority tie-breaking
    #[serde(default)]
    pub cost_per_call: f64,
}

fn default_initial_score() -> f64 {
    50.0
}

/// ε-greedy / Q-learning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Starting exploration rate
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Multiplicative decay applied to ε after each decision
    #[serde(default = "default_epsilon_decay")]
    pub epsilon_decay: f64,
    /// Exploration floor
    #[serde(default = "default_epsilon_min")]
    pub epsilon_min: f64,
    /// Q-learning rate
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Discount factor, only applied when a caller models a next state
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_epsilon_decay() -> f64 {
    0.995
}

fn default_epsilon_min() -> f64 {
    0.01
}

fn default_alpha() -> f64 {
    0.1
}

fn default_gamma() -> f64 {
    0.9
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            epsilon_decay: default_epsilon_decay(),
            epsilon_min: default_epsilon_min(),
            alpha: default_alpha(),
            gamma: default_gamma(),
        }
    }
}

/// Dispatcher behavior knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Cap on the candidate list per dispatch; `None` keeps every eligible provider
    #[serde(default)]
    pub max_candidates: Option<usize>,
    /// Provider attempts per `execute` call before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Whether every outcome report writes a snapshot through the store
    #[serde(default = "default_persist_on_report")]
    pub persist_on_report: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_persist_on_report() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_candidates: None,
            max_attempts: default_max_attempts(),
            persist_on_report: default_persist_on_report(),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SWITCHYARD_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("switchyard")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate cross-references and parameter ranges.
    ///
    /// Called by the dispatcher builder before any component is constructed
    /// so that invalid states never reach the registry.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            return Err(anyhow!("No providers configured"));
        }
        if self.tiers.is_empty() {
            return Err(anyhow!("No tiers configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(anyhow!("Duplicate provider id '{}'", provider.id));
            }
            if !(0.0..=100.0).contains(&provider.initial_score) {
                return Err(anyhow!(
                    "Provider '{}' initial_score {} is outside [0, 100]",
                    provider.id,
                    provider.initial_score
                ));
            }
            if provider.cost_per_call < 0.0 {
                return Err(anyhow!(
                    "Provider '{}' cost_per_call must not be negative",
                    provider.id
                ));
            }
        }

        let mut tier_names = std::collections::HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(anyhow!("Duplicate tier '{}'", tier.name));
            }
            if tier.providers.is_empty() {
                return Err(anyhow!("Tier '{}' lists no providers", tier.name));
            }
            for id in &tier.providers {
                if !seen.contains(id.as_str()) {
                    return Err(anyhow!(
                        "Tier '{}' references unknown provider '{}'",
                        tier.name,
                        id
                    ));
                }
            }
        }

        if !(0.0..=1.0).contains(&self.learning.epsilon) {
            return Err(anyhow!("learning.epsilon must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.learning.epsilon_min)
            || self.learning.epsilon_min > self.learning.epsilon
        {
            return Err(anyhow!("learning.epsilon_min must be in [0, epsilon]"));
        }
        if !(0.0..=1.0).contains(&self.learning.epsilon_decay) || self.learning.epsilon_decay == 0.0
        {
            return Err(anyhow!("learning.epsilon_decay must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.learning.alpha) || self.learning.alpha == 0.0 {
            return Err(anyhow!("learning.alpha must be in (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.learning.gamma) {
            return Err(anyhow!("learning.gamma must be in [0, 1]"));
        }

        if self.circuit.failure_threshold == 0 {
            return Err(anyhow!("circuit.failure_threshold must be at least 1"));
        }
        if self.circuit.half_open_max_calls == 0 {
            return Err(anyhow!("circuit.half_open_max_calls must be at least 1"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(anyhow!("dispatch.max_attempts must be at least 1"));
        }
        if self.dispatch.max_candidates == Some(0) {
            return Err(anyhow!("dispatch.max_candidates must be at least 1 when set"));
        }

        Ok(())
    }
}
