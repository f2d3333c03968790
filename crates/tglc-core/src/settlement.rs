//! Settlement collaborator boundary.
//!
//! Connectors build, sign and submit ledger transactions; the pipeline only sees handles and
//! outcomes.

use crate::error::CreditError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ledger transaction shape used to deliver approved liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    TrustLine,
    Escrow,
}

impl SettlementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrustLine => "trust_line",
            Self::Escrow => "escrow",
        }
    }
}

/// How the pipeline settles approved requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementMode {
    /// Open a trust line to the business for the approved amount.
    TrustLine,
    /// Lock the approved amount in a time-bound escrow.
    Escrow {
        finish_after_secs: u64,
        cancel_after_secs: u64,
    },
}

impl Default for SettlementMode {
    fn default() -> Self {
        Self::TrustLine
    }
}

/// Submitted transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub tx_id: String,
    pub kind: SettlementKind,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowInstruction {
    pub request_id: String,
    pub destination: String,
    pub currency: String,
    pub amount_minor: u64,
    pub finish_after: DateTime<Utc>,
    pub cancel_after: DateTime<Utc>,
}

/// Fully resolved settlement work for one approved request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementInstruction {
    TrustLine {
        request_id: String,
        address: String,
        currency: String,
        limit_minor: u64,
    },
    Escrow(EscrowInstruction),
}

impl SettlementInstruction {
    pub fn kind(&self) -> SettlementKind {
        match self {
            Self::TrustLine { .. } => SettlementKind::TrustLine,
            Self::Escrow(_) => SettlementKind::Escrow,
        }
    }
}

/// Submission rejected before a handle was issued.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct SettlementError {
    pub retryable: bool,
    pub message: String,
}

impl SettlementError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl From<SettlementError> for CreditError {
    fn from(err: SettlementError) -> Self {
        CreditError::SettlementFailure {
            retryable: err.retryable,
            message: err.message,
        }
    }
}

/// Cause reported with a failed outcome. Same retry classification as submission errors.
pub type SettlementFailure = SettlementError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Success(TxHandle),
    Failed(TxHandle, SettlementFailure),
}

/// Injected settlement collaborator.
#[async_trait]
pub trait SettlementConnector: Send + Sync {
    fn rail(&self) -> &'static str;

    async fn submit_trust_line(
        &self,
        address: &str,
        currency: &str,
        limit_minor: u64,
    ) -> Result<TxHandle, SettlementError>;

    async fn submit_escrow(&self, escrow: &EscrowInstruction) -> Result<TxHandle, SettlementError>;

    /// Wait for the ledger's verdict on a submitted transaction.
    async fn await_outcome(&self, handle: &TxHandle) -> SettlementOutcome;

    async fn submit(&self, instruction: &SettlementInstruction) -> Result<TxHandle, SettlementError> {
        match instruction {
            SettlementInstruction::TrustLine {
                address,
                currency,
                limit_minor,
                ..
            } => self.submit_trust_line(address, currency, *limit_minor).await,
            SettlementInstruction::Escrow(escrow) => self.submit_escrow(escrow).await,
        }
    }
}
