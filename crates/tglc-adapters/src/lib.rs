//! Settlement connectors and advisors for the TGLC engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tglc_core::advisor::{Advisory, DecisionAdvisor};
use tglc_core::error::CreditError;
use tglc_core::settlement::{
    EscrowInstruction, SettlementConnector, SettlementError, SettlementKind, SettlementOutcome,
    TxHandle,
};
use tglc_core::types::{CreditDecision, LiquidityRequest, ProofVerificationResult};
use tracing::debug;

fn simulated_tx_id(kind: SettlementKind, sequence: u64, material: &str) -> String {
    let digest = blake3::hash(format!("{}|{sequence}|{material}", kind.as_str()).as_bytes());
    let hex = digest.to_hex();
    format!("sim-{}", &hex.as_str()[..16])
}

/// In-process ledger simulator. Every submission validates immediately.
///
/// Transaction ids are derived from the submission content and a sequence number, so the same
/// sequence of submissions always yields the same ids.
#[derive(Debug, Default)]
pub struct SimulatedLedgerConnector {
    sequence: AtomicU64,
    submitted: Mutex<Vec<TxHandle>>,
}

impl SimulatedLedgerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<TxHandle> {
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, kind: SettlementKind, material: String) -> TxHandle {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let handle = TxHandle {
            tx_id: simulated_tx_id(kind, sequence, &material),
            kind,
            submitted_at: Utc::now(),
        };
        debug!(tx_id = %handle.tx_id, kind = kind.as_str(), "simulated submission");
        self.submitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.clone());
        handle
    }
}

#[async_trait]
impl SettlementConnector for SimulatedLedgerConnector {
    fn rail(&self) -> &'static str {
        "simulated"
    }

    async fn submit_trust_line(
        &self,
        address: &str,
        currency: &str,
        limit_minor: u64,
    ) -> Result<TxHandle, SettlementError> {
        Ok(self.record(
            SettlementKind::TrustLine,
            format!("{address}|{currency}|{limit_minor}"),
        ))
    }

    async fn submit_escrow(&self, escrow: &EscrowInstruction) -> Result<TxHandle, SettlementError> {
        Ok(self.record(
            SettlementKind::Escrow,
            format!(
                "{}|{}|{}|{}",
                escrow.destination,
                escrow.currency,
                escrow.amount_minor,
                escrow.cancel_after.timestamp()
            ),
        ))
    }

    async fn await_outcome(&self, handle: &TxHandle) -> SettlementOutcome {
        SettlementOutcome::Success(handle.clone())
    }
}

/// Connector that refuses every submission. Useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailConnector {
    rail_name: &'static str,
    error: SettlementError,
    attempts: std::sync::Arc<AtomicU32>,
}

impl AlwaysFailConnector {
    pub fn retryable(rail_name: &'static str, reason: impl Into<String>) -> Self {
        Self::new(rail_name, SettlementError::retryable(reason))
    }

    pub fn fatal(rail_name: &'static str, reason: impl Into<String>) -> Self {
        Self::new(rail_name, SettlementError::fatal(reason))
    }

    fn new(rail_name: &'static str, error: SettlementError) -> Self {
        Self {
            rail_name,
            error,
            attempts: Default::default(),
        }
    }

    /// Submissions refused so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> Result<TxHandle, SettlementError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

#[async_trait]
impl SettlementConnector for AlwaysFailConnector {
    fn rail(&self) -> &'static str {
        self.rail_name
    }

    async fn submit_trust_line(
        &self,
        _address: &str,
        _currency: &str,
        _limit_minor: u64,
    ) -> Result<TxHandle, SettlementError> {
        self.refuse()
    }

    async fn submit_escrow(&self, _escrow: &EscrowInstruction) -> Result<TxHandle, SettlementError> {
        self.refuse()
    }

    async fn await_outcome(&self, handle: &TxHandle) -> SettlementOutcome {
        SettlementOutcome::Failed(handle.clone(), self.error.clone())
    }
}

/// Accepts submissions but reports a retryable ledger failure for the first `failures`
/// outcomes, then succeeds.
#[derive(Debug, Default)]
pub struct FlakyConnector {
    inner: SimulatedLedgerConnector,
    failures: u32,
    observed: AtomicU32,
}

impl FlakyConnector {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: SimulatedLedgerConnector::new(),
            failures,
            observed: AtomicU32::new(0),
        }
    }

    /// Outcomes reported so far.
    pub fn outcomes(&self) -> u32 {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<TxHandle> {
        self.inner.submitted()
    }
}

#[async_trait]
impl SettlementConnector for FlakyConnector {
    fn rail(&self) -> &'static str {
        "flaky"
    }

    async fn submit_trust_line(
        &self,
        address: &str,
        currency: &str,
        limit_minor: u64,
    ) -> Result<TxHandle, SettlementError> {
        self.inner
            .submit_trust_line(address, currency, limit_minor)
            .await
    }

    async fn submit_escrow(&self, escrow: &EscrowInstruction) -> Result<TxHandle, SettlementError> {
        self.inner.submit_escrow(escrow).await
    }

    async fn await_outcome(&self, handle: &TxHandle) -> SettlementOutcome {
        let seen = self.observed.fetch_add(1, Ordering::SeqCst);
        if seen < self.failures {
            SettlementOutcome::Failed(
                handle.clone(),
                SettlementError::retryable(format!("ledger busy (attempt {})", seen + 1)),
            )
        } else {
            SettlementOutcome::Success(handle.clone())
        }
    }
}

/// Simulated ledger whose verdict arrives only after `delay`.
#[derive(Debug)]
pub struct SlowConnector {
    inner: SimulatedLedgerConnector,
    delay: Duration,
}

impl SlowConnector {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: SimulatedLedgerConnector::new(),
            delay,
        }
    }

    pub fn submitted(&self) -> Vec<TxHandle> {
        self.inner.submitted()
    }
}

#[async_trait]
impl SettlementConnector for SlowConnector {
    fn rail(&self) -> &'static str {
        "slow"
    }

    async fn submit_trust_line(
        &self,
        address: &str,
        currency: &str,
        limit_minor: u64,
    ) -> Result<TxHandle, SettlementError> {
        self.inner
            .submit_trust_line(address, currency, limit_minor)
            .await
    }

    async fn submit_escrow(&self, escrow: &EscrowInstruction) -> Result<TxHandle, SettlementError> {
        self.inner.submit_escrow(escrow).await
    }

    async fn await_outcome(&self, handle: &TxHandle) -> SettlementOutcome {
        tokio::time::sleep(self.delay).await;
        SettlementOutcome::Success(handle.clone())
    }
}

/// Advisor with no model behind it: always recommends approval at a fixed confidence.
#[derive(Debug, Clone)]
pub struct StaticAdvisor {
    confidence: u8,
}

impl StaticAdvisor {
    pub fn new(confidence: u8) -> Self {
        Self {
            confidence: confidence.min(100),
        }
    }
}

impl Default for StaticAdvisor {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl DecisionAdvisor for StaticAdvisor {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn advise(
        &self,
        request: &LiquidityRequest,
        proof: Option<&ProofVerificationResult>,
        _decision: &CreditDecision,
    ) -> Result<Advisory, CreditError> {
        let rationale = match proof {
            Some(result) => format!(
                "no model configured; {} minor requested with default rate {}",
                request.requested_amount_minor, result.default_rate
            ),
            None => format!(
                "no model configured; {} minor requested without proof",
                request.requested_amount_minor
            ),
        };
        Ok(Advisory {
            advisor: self.name().to_string(),
            recommend_approval: true,
            confidence: self.confidence,
            rationale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tglc_core::settlement::SettlementInstruction;

    fn trust_line() -> SettlementInstruction {
        SettlementInstruction::TrustLine {
            request_id: "req-1".to_string(),
            address: "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh".to_string(),
            currency: "USDC".to_string(),
            limit_minor: 50_000,
        }
    }

    #[tokio::test]
    async fn simulated_ids_are_deterministic() {
        let first = SimulatedLedgerConnector::new();
        let second = SimulatedLedgerConnector::new();
        let a = first.submit(&trust_line()).await.unwrap();
        let b = second.submit(&trust_line()).await.unwrap();
        assert_eq!(a.tx_id, b.tx_id);
        assert_eq!(a.kind, SettlementKind::TrustLine);

        let again = first.submit(&trust_line()).await.unwrap();
        assert_ne!(a.tx_id, again.tx_id);
        assert_eq!(first.submitted().len(), 2);
        assert!(matches!(
            first.await_outcome(&a).await,
            SettlementOutcome::Success(_)
        ));
    }

    #[tokio::test]
    async fn failing_adapter_reports_its_class() {
        let connector = AlwaysFailConnector::fatal("xrpl", "tecNO_DST");
        let err = connector.submit(&trust_line()).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(connector.attempts(), 1);

        let connector = AlwaysFailConnector::retryable("xrpl", "telINSUF_FEE_P");
        assert!(connector.submit(&trust_line()).await.unwrap_err().retryable);
    }

    #[tokio::test]
    async fn flaky_adapter_recovers_after_budgeted_failures() {
        let connector = FlakyConnector::new(2);
        let handle = connector.submit(&trust_line()).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(
                connector.await_outcome(&handle).await,
                SettlementOutcome::Failed(_, SettlementError { retryable: true, .. })
            ));
        }
        assert!(matches!(
            connector.await_outcome(&handle).await,
            SettlementOutcome::Success(_)
        ));
        assert_eq!(connector.outcomes(), 3);
    }

    #[tokio::test]
    async fn static_advisor_always_recommends_approval() {
        let request = LiquidityRequest::new(
            "did:xrpl:1:rBusiness",
            "biz-1",
            "bank-1",
            "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh",
            "SGD-USDC".parse().unwrap(),
            50_000,
        );
        let decision = CreditDecision::reject(tglc_core::types::ReasonCode::Headroom);
        let advisory = StaticAdvisor::default()
            .advise(&request, None, &decision)
            .await
            .unwrap();
        assert!(advisory.recommend_approval);
        assert_eq!(advisory.confidence, 50);
        assert_eq!(advisory.advisor, "static");
    }
}
