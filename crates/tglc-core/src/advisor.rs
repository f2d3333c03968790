use crate::error::CreditError;
use crate::types::{CreditDecision, LiquidityRequest, ProofVerificationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Non-binding opinion on a decision, recorded next to it in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub advisor: String,
    pub recommend_approval: bool,
    /// 0-100.
    pub confidence: u8,
    pub rationale: String,
}

/// Optional secondary reviewer. Its output is logged and audited, never used for gating.
#[async_trait]
pub trait DecisionAdvisor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn advise(
        &self,
        request: &LiquidityRequest,
        proof: Option<&ProofVerificationResult>,
        decision: &CreditDecision,
    ) -> Result<Advisory, CreditError>;
}
