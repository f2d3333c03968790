use crate::types::ReasonCode;
use thiserror::Error;

/// Credit engine errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CreditError {
    /// Malformed credential, policy, proof or request input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(ReasonCode),

    /// Signature or trust failure on a submitted proof.
    #[error("Proof invalid: {0}")]
    ProofInvalid(String),

    #[error("Exposure exceeded: {0}")]
    ExposureExceeded(String),

    /// Optimistic version mismatch on the exposure store. Retried internally.
    #[error("Concurrency conflict on {key}: expected version {expected}")]
    ConcurrencyConflict { key: String, expected: u64 },

    #[error("Settlement failure ({}): {message}", retry_class(.retryable))]
    SettlementFailure { retryable: bool, message: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CreditError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn stage_violation(from: &str, to: &str) -> Self {
        Self::InvalidTransition(format!("stage '{}' cannot advance to '{}'", from, to))
    }

    /// Canonical reason code reported when this error terminates a request.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Self::PolicyViolation(code) => Some(*code),
            Self::ProofInvalid(_) => Some(ReasonCode::ProofInvalid),
            Self::ExposureExceeded(_) | Self::ConcurrencyConflict { .. } => {
                Some(ReasonCode::ExposureExceeded)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SettlementFailure { retryable, .. } => *retryable,
            Self::ConcurrencyConflict { .. } => true,
            _ => false,
        }
    }
}

fn retry_class(retryable: &bool) -> &'static str {
    if *retryable {
        "retryable"
    } else {
        "fatal"
    }
}
