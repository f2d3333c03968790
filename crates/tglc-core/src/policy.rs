use crate::error::CreditError;
use crate::types::{
    CreditCredential, CreditDecision, CreditPolicy, ExposureState, LiquidityRequest,
    ProofVerificationResult, ReasonCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One pricing tier: proofs scoring at least `min_confidence` pay `rate_bps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTier {
    pub min_confidence: u8,
    pub rate_bps: u32,
}

/// Confidence-to-rate mapping. Higher confidence never pays a higher rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PricingTier>", into = "Vec<PricingTier>")]
pub struct PricingTable {
    /// Sorted by `min_confidence`, highest first.
    tiers: Vec<PricingTier>,
}

impl PricingTable {
    pub fn new(mut tiers: Vec<PricingTier>) -> Result<Self, CreditError> {
        if tiers.is_empty() {
            return Err(CreditError::validation("pricing table needs at least one tier"));
        }
        tiers.sort_by(|a, b| b.min_confidence.cmp(&a.min_confidence));
        for pair in tiers.windows(2) {
            if pair[0].min_confidence == pair[1].min_confidence {
                return Err(CreditError::validation(format!(
                    "duplicate pricing tier for confidence {}",
                    pair[0].min_confidence
                )));
            }
            if pair[0].rate_bps > pair[1].rate_bps {
                return Err(CreditError::validation(format!(
                    "pricing is not monotone: confidence {} pays {} bps but {} pays {} bps",
                    pair[0].min_confidence, pair[0].rate_bps, pair[1].min_confidence, pair[1].rate_bps
                )));
            }
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[PricingTier] {
        &self.tiers
    }

    /// Rate for `confidence`; scores below every tier pay the lowest tier's rate.
    pub fn rate_for(&self, confidence: u8) -> u32 {
        self.tiers
            .iter()
            .find(|tier| confidence >= tier.min_confidence)
            .unwrap_or_else(|| self.lowest_tier())
            .rate_bps
    }

    pub fn lowest_tier_rate(&self) -> u32 {
        self.lowest_tier().rate_bps
    }

    fn lowest_tier(&self) -> &PricingTier {
        // `new` guarantees at least one tier.
        &self.tiers[self.tiers.len() - 1]
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                PricingTier {
                    min_confidence: 100,
                    rate_bps: 450,
                },
                PricingTier {
                    min_confidence: 75,
                    rate_bps: 650,
                },
                PricingTier {
                    min_confidence: 0,
                    rate_bps: 900,
                },
            ],
        }
    }
}

impl TryFrom<Vec<PricingTier>> for PricingTable {
    type Error = CreditError;

    fn try_from(tiers: Vec<PricingTier>) -> Result<Self, Self::Error> {
        Self::new(tiers)
    }
}

impl From<PricingTable> for Vec<PricingTier> {
    fn from(table: PricingTable) -> Self {
        table.tiers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default)]
    pub pricing: PricingTable,
}

/// Deterministic credit evaluator.
///
/// Checks run in a fixed order and stop at the first failure, so every rejection carries
/// exactly one reason. Nothing here reads the clock or touches shared state; `at` is supplied
/// by the caller.
#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    config: EvaluatorConfig,
}

impl PolicyEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn evaluate(
        &self,
        request: &LiquidityRequest,
        credential: &CreditCredential,
        policy: &CreditPolicy,
        snapshot: &ExposureState,
        proof: Option<&ProofVerificationResult>,
        at: DateTime<Utc>,
    ) -> CreditDecision {
        match self.first_failure(request, credential, policy, snapshot, proof, at) {
            Some(reason) => CreditDecision::reject(reason),
            None => {
                let rate_bps = proof
                    .map(|result| self.config.pricing.rate_for(result.confidence_score))
                    .unwrap_or_else(|| self.config.pricing.lowest_tier_rate());
                CreditDecision::approve(request.requested_amount_minor, rate_bps)
            }
        }
    }

    fn first_failure(
        &self,
        request: &LiquidityRequest,
        credential: &CreditCredential,
        policy: &CreditPolicy,
        snapshot: &ExposureState,
        proof: Option<&ProofVerificationResult>,
        at: DateTime<Utc>,
    ) -> Option<ReasonCode> {
        let requested = request.requested_amount_minor;
        let current = snapshot.current_exposure_minor;

        if !credential.covers(&request.corridor) || credential.is_expired_at(at) {
            return Some(ReasonCode::CorridorOrExpiry);
        }

        if let Some(minimum) = policy.proof_required_above_minor {
            if requested > minimum && !proof.is_some_and(|result| result.valid) {
                return Some(ReasonCode::ProofRequired);
            }
        }

        if requested > credential.credit_limit_minor.saturating_sub(current) {
            return Some(ReasonCode::Headroom);
        }

        if current.saturating_add(requested) > policy.max_exposure_minor {
            return Some(ReasonCode::ExposureCap);
        }

        if let Some(result) = proof {
            if result.default_rate > policy.max_default_rate {
                return Some(ReasonCode::DefaultRate);
            }
        }

        if let Some(days) = request.requested_duration_days {
            if days > policy.max_duration_days {
                return Some(ReasonCode::Duration);
            }
        }

        None
    }
}
