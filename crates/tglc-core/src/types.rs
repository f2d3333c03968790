use crate::error::CreditError;
use crate::flow::RequestStage;
use crate::settlement::TxHandle;
use crate::validation;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Key of a business-to-bank exposure record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExposureKey {
    pub business_id: String,
    pub bank_id: String,
}

impl ExposureKey {
    pub fn new(business_id: impl Into<String>, bank_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            bank_id: bank_id.into(),
        }
    }
}

impl fmt::Display for ExposureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.business_id, self.bank_id)
    }
}

/// Allowed currency-pair route, written `BASE-QUOTE` (e.g. `SGD-USDC`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Corridor {
    base: String,
    quote: String,
}

impl Corridor {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl FromStr for Corridor {
    type Err = CreditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (base, quote) = value.split_once('-').ok_or_else(|| {
            CreditError::validation(format!("corridor '{}' must be written BASE-QUOTE", value))
        })?;
        validation::validate_currency(base)?;
        validation::validate_currency(quote)?;
        if base == quote {
            return Err(CreditError::validation(format!(
                "corridor '{}' routes a currency to itself",
                value
            )));
        }
        Ok(Self {
            base: base.to_string(),
            quote: quote.to_string(),
        })
    }
}

impl TryFrom<String> for Corridor {
    type Error = CreditError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Corridor> for String {
    fn from(corridor: Corridor) -> Self {
        corridor.to_string()
    }
}

impl fmt::Display for Corridor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Credit credential issued by a bank to a business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCredential {
    /// Issuing bank id.
    pub issuer: String,
    pub business_id: String,
    pub credit_limit_minor: u64,
    pub corridors: BTreeSet<Corridor>,
    pub expires_at: DateTime<Utc>,
}

impl CreditCredential {
    pub fn exposure_key(&self) -> ExposureKey {
        ExposureKey::new(self.business_id.clone(), self.issuer.clone())
    }

    pub fn covers(&self, corridor: &Corridor) -> bool {
        self.corridors.contains(corridor)
    }

    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.expires_at
    }
}

/// Bank-scoped deterministic credit policy. Replaced wholesale on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPolicy {
    pub bank_id: String,
    pub max_duration_days: u32,
    /// Fraction in `[0, 1]`.
    pub max_default_rate: f64,
    pub max_exposure_minor: u64,
    /// Requests above this amount must carry a valid proof.
    #[serde(default)]
    pub proof_required_above_minor: Option<u64>,
}

impl CreditPolicy {
    pub fn validate(&self) -> Result<(), CreditError> {
        validation::validate_identifier("bank_id", &self.bank_id)?;
        if self.max_duration_days == 0 {
            return Err(CreditError::validation(
                "max_duration_days must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_default_rate) {
            return Err(CreditError::validation(format!(
                "max_default_rate {} must be in [0, 1]",
                self.max_default_rate
            )));
        }
        if self.max_exposure_minor == 0 {
            return Err(CreditError::validation(
                "max_exposure_minor must be positive",
            ));
        }
        Ok(())
    }
}

/// Current exposure of a business to a bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureState {
    pub key: ExposureKey,
    pub current_exposure_minor: u64,
    /// Monotonic sequence used for optimistic updates.
    pub version: u64,
}

impl ExposureState {
    pub fn initial(key: ExposureKey) -> Self {
        Self {
            key,
            current_exposure_minor: 0,
            version: 0,
        }
    }
}

/// Origin of a proof payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofSource {
    Oracle,
    Internal,
    Audited,
}

impl ProofSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::Internal => "internal",
            Self::Audited => "audited",
        }
    }

    /// Oracle and audited proofs are only trusted when signed.
    pub fn requires_signature(self) -> bool {
        matches!(self, Self::Oracle | Self::Audited)
    }
}

impl FromStr for ProofSource {
    type Err = CreditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "oracle" => Ok(Self::Oracle),
            "internal" => Ok(Self::Internal),
            "audited" => Ok(Self::Audited),
            other => Err(CreditError::validation(format!(
                "unknown proof source '{}'",
                other
            ))),
        }
    }
}

/// Metric key that every proof must carry.
pub const DEFAULT_RATE_METRIC: &str = "default_rate";

/// Business metrics submitted to justify a liquidity request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofPayload {
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
    pub source: ProofSource,
    /// Hex-encoded Ed25519 signature over [`ProofPayload::signing_bytes`].
    #[serde(default)]
    pub signature: Option<String>,
}

impl ProofPayload {
    pub fn new(
        metrics: BTreeMap<String, f64>,
        timestamp: DateTime<Utc>,
        source: ProofSource,
    ) -> Self {
        Self {
            metrics,
            timestamp,
            source,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn default_rate(&self) -> Option<f64> {
        self.metrics.get(DEFAULT_RATE_METRIC).copied()
    }

    /// Parse an untyped ingress payload, reporting shape problems as validation errors.
    pub fn from_value(value: Value) -> Result<Self, CreditError> {
        let object = value
            .as_object()
            .ok_or_else(|| CreditError::validation("proof payload must be an object"))?;
        let metrics = object
            .get("metrics")
            .ok_or_else(|| CreditError::validation("proof payload is missing metrics"))?
            .as_object()
            .ok_or_else(|| CreditError::validation("proof metrics must be an object"))?;
        if let Some((name, _)) = metrics.iter().find(|(_, v)| !v.is_number()) {
            return Err(CreditError::validation(format!(
                "proof metric '{}' must be numeric",
                name
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| CreditError::validation(format!("malformed proof payload: {e}")))
    }

    /// Canonical message covered by the proof signature.
    ///
    /// Keys are emitted in sorted order and the timestamp at millisecond precision, so the
    /// same proof always yields the same bytes.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let material = serde_json::json!({
            "metrics": self.metrics,
            "source": self.source.as_str(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        serde_json::to_vec(&material).unwrap_or_default()
    }
}

/// Derived scoring of a proof. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofVerificationResult {
    pub valid: bool,
    pub confidence_score: u8,
    pub default_rate: f64,
    pub violations: Vec<String>,
}

/// Canonical rejection codes.
///
/// The policy evaluator only produces the first six. `ProofInvalid` and `ExposureExceeded`
/// are raised by the pipeline before or after evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReasonCode {
    CorridorOrExpiry,
    ProofRequired,
    Headroom,
    ExposureCap,
    DefaultRate,
    Duration,
    ProofInvalid,
    ExposureExceeded,
}

impl ReasonCode {
    /// Evaluation order of the policy checks.
    pub const EVALUATOR_ORDER: [ReasonCode; 6] = [
        Self::CorridorOrExpiry,
        Self::ProofRequired,
        Self::Headroom,
        Self::ExposureCap,
        Self::DefaultRate,
        Self::Duration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CorridorOrExpiry => "CorridorOrExpiry",
            Self::ProofRequired => "ProofRequired",
            Self::Headroom => "Headroom",
            Self::ExposureCap => "ExposureCap",
            Self::DefaultRate => "DefaultRate",
            Self::Duration => "Duration",
            Self::ProofInvalid => "ProofInvalid",
            Self::ExposureExceeded => "ExposureExceeded",
        }
    }

    pub fn is_evaluator_code(self) -> bool {
        Self::EVALUATOR_ORDER.contains(&self)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of credit evaluation.
///
/// Approved decisions always carry amount and rate; rejections always carry exactly one
/// reason and nothing else. Construction goes through [`CreditDecision::approve`] and
/// [`CreditDecision::reject`], and deserialization re-checks the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DecisionRecord")]
pub struct CreditDecision {
    approved: bool,
    approved_amount_minor: Option<u64>,
    rate_bps: Option<u32>,
    reason: Option<ReasonCode>,
}

impl CreditDecision {
    pub fn approve(amount_minor: u64, rate_bps: u32) -> Self {
        Self {
            approved: true,
            approved_amount_minor: Some(amount_minor),
            rate_bps: Some(rate_bps),
            reason: None,
        }
    }

    pub fn reject(reason: ReasonCode) -> Self {
        Self {
            approved: false,
            approved_amount_minor: None,
            rate_bps: None,
            reason: Some(reason),
        }
    }

    pub fn approved(&self) -> bool {
        self.approved
    }

    pub fn approved_amount_minor(&self) -> Option<u64> {
        self.approved_amount_minor
    }

    pub fn rate_bps(&self) -> Option<u32> {
        self.rate_bps
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        self.reason
    }
}

#[derive(Deserialize)]
struct DecisionRecord {
    approved: bool,
    #[serde(default)]
    approved_amount_minor: Option<u64>,
    #[serde(default)]
    rate_bps: Option<u32>,
    #[serde(default)]
    reason: Option<ReasonCode>,
}

impl TryFrom<DecisionRecord> for CreditDecision {
    type Error = String;

    fn try_from(record: DecisionRecord) -> Result<Self, Self::Error> {
        match (
            record.approved,
            record.approved_amount_minor,
            record.rate_bps,
            record.reason,
        ) {
            (true, Some(amount), Some(rate), None) => Ok(Self::approve(amount, rate)),
            (false, None, None, Some(reason)) => Ok(Self::reject(reason)),
            (true, ..) => Err("approved decision requires amount and rate and no reason".into()),
            (false, ..) => Err("rejected decision requires a reason and no amount or rate".into()),
        }
    }
}

fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Incoming liquidity request. Transient apart from the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityRequest {
    /// Idempotency key; generated when the caller does not supply one.
    #[serde(default = "generate_request_id")]
    pub request_id: String,
    pub business_did: String,
    pub business_id: String,
    pub bank_id: String,
    pub principal_address: String,
    pub corridor: Corridor,
    pub requested_amount_minor: u64,
    #[serde(default)]
    pub proof: Option<ProofPayload>,
    #[serde(default)]
    pub requested_duration_days: Option<u32>,
}

impl LiquidityRequest {
    pub fn new(
        business_did: impl Into<String>,
        business_id: impl Into<String>,
        bank_id: impl Into<String>,
        principal_address: impl Into<String>,
        corridor: Corridor,
        requested_amount_minor: u64,
    ) -> Self {
        Self {
            request_id: generate_request_id(),
            business_did: business_did.into(),
            business_id: business_id.into(),
            bank_id: bank_id.into(),
            principal_address: principal_address.into(),
            corridor,
            requested_amount_minor,
            proof: None,
            requested_duration_days: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_proof(mut self, proof: ProofPayload) -> Self {
        self.proof = Some(proof);
        self
    }

    pub fn with_duration_days(mut self, days: u32) -> Self {
        self.requested_duration_days = Some(days);
        self
    }

    pub fn exposure_key(&self) -> ExposureKey {
        ExposureKey::new(self.business_id.clone(), self.bank_id.clone())
    }
}

/// Final, auditable result of one liquidity request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: String,
    pub stage: RequestStage,
    pub decision: Option<CreditDecision>,
    pub settlement: Option<TxHandle>,
    pub detail: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn reason(&self) -> Option<ReasonCode> {
        self.decision.as_ref().and_then(CreditDecision::reason)
    }
}
