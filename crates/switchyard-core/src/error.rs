//! Error types for Switchyard

use thiserror::Error;

/// Result type alias using Switchyard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Switchyard error types with helpful messages
#[derive(Error, Debug)]
pub enum Error {
    // Registry errors (E100-E199)
    #[error("Provider '{0}' is not registered")]
    UnknownProvider(String),

    #[error("Tier '{0}' has no configured providers")]
    UnknownTier(String),

    // Dispatch errors (E200-E299)
    #[error("No eligible provider for tier '{0}': every candidate is circuit-open or out of quota")]
    NoEligibleProvider(String),

    #[error(
        "Quota exceeded for provider '{provider}': requested {requested} tokens, {remaining} remaining"
    )]
    QuotaExceeded {
        provider: String,
        requested: u64,
        remaining: u64,
    },

    #[error("All dispatch attempts failed for tier '{tier}': {attempts:?}")]
    DispatchExhausted { tier: String, attempts: Vec<String> },

    // Reporting errors (E300-E399)
    #[error("Dispatch handle {0} is not pending: outcome already reported or handle never issued")]
    DuplicateReport(uuid::Uuid),

    // Persistence errors (E400-E499)
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Config errors (E500-E599)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownProvider(_) => "E100",
            Self::UnknownTier(_) => "E101",
            Self::NoEligibleProvider(_) => "E200",
            Self::QuotaExceeded { .. } => "E201",
            Self::DispatchExhausted { .. } => "E202",
            Self::DuplicateReport(_) => "E300",
            Self::Persistence(_) => "E400",
            Self::Config(_) => "E500",
            Self::InvalidInput(_) => "E501",
        }
    }

    /// Whether a caller can reasonably retry after backing off.
    ///
    /// Candidate exhaustion clears on its own once a circuit recovery
    /// timeout elapses or a quota window resets; the other variants
    /// indicate misconfiguration or misuse and will not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleProvider(_) | Self::DispatchExhausted { .. }
        )
    }
}
