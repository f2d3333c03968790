use crate::error::CreditError;
use serde::{Deserialize, Serialize};

/// Lifecycle stages of a liquidity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    Received,
    ProofVerified,
    ProofRejected,
    PolicyEvaluated,
    Reserved,
    SettlementPending,
    Rejected,
    Settled,
    SettlementFailed,
    Cancelled,
}

impl RequestStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::ProofVerified => "proof_verified",
            Self::ProofRejected => "proof_rejected",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::Reserved => "reserved",
            Self::SettlementPending => "settlement_pending",
            Self::Rejected => "rejected",
            Self::Settled => "settled",
            Self::SettlementFailed => "settlement_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Settled | Self::SettlementFailed | Self::Cancelled
        )
    }

    /// Stages at which a cancellation is still honoured. From `Reserved` the reservation is
    /// released first.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Received | Self::ProofVerified | Self::PolicyEvaluated | Self::Reserved
        )
    }

    pub fn can_advance_to(self, next: RequestStage) -> bool {
        use RequestStage::*;
        matches!(
            (self, next),
            (Received, ProofVerified | ProofRejected | Rejected | Cancelled)
                | (ProofVerified, PolicyEvaluated | Cancelled)
                | (ProofRejected, Rejected)
                | (PolicyEvaluated, Reserved | Rejected | Cancelled)
                | (Reserved, SettlementPending | Cancelled)
                | (SettlementPending, Settled | SettlementFailed)
        )
    }
}

/// Enforces the request state machine so no stage can be skipped silently.
#[derive(Debug, Clone)]
pub struct RequestStateMachine {
    request_id: String,
    stage: RequestStage,
    history: Vec<RequestStage>,
}

impl RequestStateMachine {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            stage: RequestStage::Received,
            history: vec![RequestStage::Received],
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn stage(&self) -> RequestStage {
        self.stage
    }

    pub fn history(&self) -> &[RequestStage] {
        &self.history
    }

    pub fn advance(&mut self, next: RequestStage) -> Result<RequestStage, CreditError> {
        if !self.stage.can_advance_to(next) {
            return Err(CreditError::stage_violation(self.stage.name(), next.name()));
        }
        let previous = self.stage;
        self.stage = next;
        self.history.push(next);
        Ok(previous)
    }
}
