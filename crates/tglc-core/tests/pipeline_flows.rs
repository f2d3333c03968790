use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use ed25519_dalek::SigningKey;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tglc_adapters::{AlwaysFailConnector, FlakyConnector, SimulatedLedgerConnector, SlowConnector};
use tglc_core::{
    sign_proof, Advisory, AuditEntry, AuditEntryKind, AuditSink, CancelDisposition,
    CreditCredential, CreditDecision, CreditError, CreditPolicy, DecisionAdvisor,
    DispatchStatus, Ed25519TrustAnchor, ExposureLedger, ExposureLimits, ExposureStore,
    LiquidityPipeline, LiquidityRequest, MemoryExposureStore, PersistentAuditTrail,
    PipelineConfig, ProofPayload, ProofSource, ProofVerificationResult, ProofVerifier,
    ReasonCode, RequestDispatcher, RequestStage, ReservationStatus, SettlementConnector,
    SettlementKind, SettlementMode, TrustAnchor, TxHandle,
};
use tokio::sync::Notify;

const ADDRESS: &str = "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";
const DID: &str = "did:xrpl:1:rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Sink that refuses settlement entries and accepts everything else.
struct SettlementRefusingSink;

#[async_trait]
impl AuditSink for SettlementRefusingSink {
    fn label(&self) -> &'static str {
        "settlement-refusing"
    }

    async fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<(), CreditError> {
        if entry.kind == AuditEntryKind::Settlement {
            return Err(CreditError::Storage("audit table unavailable".to_string()));
        }
        Ok(())
    }
}

/// Anchor that parks every verification until released.
struct GatedAnchor {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl TrustAnchor for GatedAnchor {
    async fn verify_signature(&self, _message: &[u8], _signature: &str, _source: ProofSource) -> bool {
        self.entered.notify_one();
        self.release.notified().await;
        true
    }
}

/// Advisor that parks until released, then recommends approval.
struct GatedAdvisor {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl DecisionAdvisor for GatedAdvisor {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn advise(
        &self,
        _request: &LiquidityRequest,
        _proof: Option<&ProofVerificationResult>,
        _decision: &CreditDecision,
    ) -> Result<Advisory, CreditError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Advisory {
            advisor: "gated".to_string(),
            recommend_approval: true,
            confidence: 90,
            rationale: "released".to_string(),
        })
    }
}

fn oracle_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

fn verifier() -> ProofVerifier {
    let anchor = Ed25519TrustAnchor::new().with_key(ProofSource::Oracle, oracle_key().verifying_key());
    ProofVerifier::new(Arc::new(anchor))
}

fn credential(limit_minor: u64) -> CreditCredential {
    CreditCredential {
        issuer: "bank-1".to_string(),
        business_id: "biz-1".to_string(),
        credit_limit_minor: limit_minor,
        corridors: BTreeSet::from(["SGD-USDC".parse().unwrap()]),
        expires_at: Utc::now() + ChronoDuration::days(30),
    }
}

fn policy(max_exposure_minor: u64) -> CreditPolicy {
    CreditPolicy {
        bank_id: "bank-1".to_string(),
        max_duration_days: 30,
        max_default_rate: 0.1,
        max_exposure_minor,
        proof_required_above_minor: None,
    }
}

fn oracle_proof(default_rate: f64) -> ProofPayload {
    let proof = ProofPayload::new(
        BTreeMap::from([("default_rate".to_string(), default_rate)]),
        Utc::now() - ChronoDuration::seconds(5),
        ProofSource::Oracle,
    );
    sign_proof(proof, &oracle_key())
}

fn request(id: &str, amount_minor: u64) -> LiquidityRequest {
    LiquidityRequest::new(
        DID,
        "biz-1",
        "bank-1",
        ADDRESS,
        "SGD-USDC".parse().unwrap(),
        amount_minor,
    )
    .with_request_id(id)
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        settlement_backoff: Duration::from_millis(1),
        ..PipelineConfig::default()
    }
}

fn pipeline_with(
    connector: Arc<dyn SettlementConnector>,
    config: PipelineConfig,
) -> LiquidityPipeline {
    let pipeline = LiquidityPipeline::builder(connector, verifier())
        .config(config)
        .build()
        .unwrap();
    pipeline.credentials().register(credential(1_000)).unwrap();
    pipeline.policies().set(policy(800)).unwrap();
    pipeline
}

async fn exposure(pipeline: &LiquidityPipeline) -> u64 {
    pipeline
        .ledger()
        .snapshot(&request("any", 1).exposure_key())
        .await
        .unwrap()
        .current_exposure_minor
}

async fn stages(pipeline: &LiquidityPipeline, request_id: &str) -> Vec<RequestStage> {
    pipeline
        .audit()
        .entries_for(request_id)
        .await
        .into_iter()
        .filter(|entry| entry.kind == AuditEntryKind::Transition)
        .map(|entry| serde_json::from_value::<RequestStage>(entry.payload["to"].clone()).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approves_and_settles_with_confident_proof() {
    let connector = Arc::new(SimulatedLedgerConnector::new());
    let pipeline = pipeline_with(connector.clone(), fast_config());

    let outcome = pipeline
        .submit(request("req-1", 500).with_proof(oracle_proof(0.03)))
        .await
        .unwrap();

    assert_eq!(outcome.stage, RequestStage::Settled);
    let decision = outcome.decision.unwrap();
    assert_eq!(decision.approved_amount_minor(), Some(500));
    assert_eq!(decision.rate_bps(), Some(450));
    assert_eq!(outcome.settlement.unwrap().kind, SettlementKind::TrustLine);
    assert_eq!(exposure(&pipeline).await, 500);
    assert_eq!(pipeline.ledger().outstanding_count(), 0);
    assert_eq!(
        stages(&pipeline, "req-1").await,
        vec![
            RequestStage::Received,
            RequestStage::ProofVerified,
            RequestStage::PolicyEvaluated,
            RequestStage::Reserved,
            RequestStage::SettlementPending,
            RequestStage::Settled,
        ]
    );
    assert!(pipeline.audit().verify_chain().await);
}

#[tokio::test]
async fn concurrent_requests_respect_exposure_cap() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());

    let first = pipeline.submit(request("req-a", 500).with_proof(oracle_proof(0.03)));
    let second = pipeline.submit(request("req-b", 500).with_proof(oracle_proof(0.03)));
    let (first, second) = tokio::join!(first, second);
    let outcomes = [first.unwrap(), second.unwrap()];

    let settled = outcomes
        .iter()
        .filter(|o| o.stage == RequestStage::Settled)
        .count();
    assert_eq!(settled, 1);
    let rejected = outcomes
        .iter()
        .find(|o| o.stage == RequestStage::Rejected)
        .unwrap();
    assert_eq!(rejected.reason(), Some(ReasonCode::ExposureCap));
    assert_eq!(exposure(&pipeline).await, 500);
}

#[tokio::test]
async fn unsigned_oracle_proof_is_rejected_without_reservation() {
    let connector = Arc::new(SimulatedLedgerConnector::new());
    let pipeline = pipeline_with(connector.clone(), fast_config());
    let mut proof = oracle_proof(0.03);
    proof.signature = None;

    let outcome = pipeline
        .submit(request("req-unsigned", 500).with_proof(proof))
        .await
        .unwrap();

    assert_eq!(outcome.stage, RequestStage::Rejected);
    assert_eq!(outcome.reason(), Some(ReasonCode::ProofInvalid));
    assert!(pipeline
        .ledger()
        .reservations(&request("any", 1).exposure_key())
        .await
        .unwrap()
        .is_empty());
    assert!(connector.submitted().is_empty());
    assert_eq!(
        stages(&pipeline, "req-unsigned").await,
        vec![
            RequestStage::Received,
            RequestStage::ProofRejected,
            RequestStage::Rejected,
        ]
    );
}

#[tokio::test]
async fn missing_credential_rejects_with_corridor_code() {
    let pipeline = LiquidityPipeline::builder(Arc::new(SimulatedLedgerConnector::new()), verifier())
        .build()
        .unwrap();
    pipeline.policies().set(policy(800)).unwrap();

    let outcome = pipeline.submit(request("req-none", 100)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::Rejected);
    assert_eq!(outcome.reason(), Some(ReasonCode::CorridorOrExpiry));
}

#[tokio::test]
async fn request_without_proof_is_priced_at_lowest_tier() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    let outcome = pipeline.submit(request("req-bare", 200)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::Settled);
    assert_eq!(outcome.decision.unwrap().rate_bps(), Some(900));
}

#[tokio::test]
async fn policy_rejection_leaves_ledger_untouched() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    let outcome = pipeline
        .submit(request("req-long", 100).with_duration_days(90))
        .await
        .unwrap();
    assert_eq!(outcome.reason(), Some(ReasonCode::Duration));
    assert_eq!(exposure(&pipeline).await, 0);

    let decisions: Vec<_> = pipeline
        .audit()
        .entries_for("req-long")
        .await
        .into_iter()
        .filter(|entry| entry.kind == AuditEntryKind::Decision)
        .collect();
    assert_eq!(decisions.len(), 1);
}

#[tokio::test]
async fn malformed_request_is_a_validation_error_and_audited() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    let mut bad = request("req-bad", 100);
    bad.principal_address = "not-an-address".to_string();

    let err = pipeline.submit(bad).await.unwrap_err();
    assert!(matches!(err, CreditError::Validation(_)));
    let entries = pipeline.audit().entries_for("req-bad").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, AuditEntryKind::Outcome);
    assert!(pipeline.stage("req-bad").is_none());
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_request_id_returns_stored_outcome() {
    let connector = Arc::new(SimulatedLedgerConnector::new());
    let pipeline = pipeline_with(connector.clone(), fast_config());

    let first = pipeline.submit(request("req-idem", 300)).await.unwrap();
    let again = pipeline.submit(request("req-idem", 300)).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(exposure(&pipeline).await, 300);
    assert_eq!(connector.submitted().len(), 1);
    assert_eq!(pipeline.outcome("req-idem"), Some(first));
}

#[tokio::test]
async fn concurrent_duplicates_share_one_evaluation() {
    let connector = Arc::new(SlowConnector::new(Duration::from_millis(20)));
    let pipeline = pipeline_with(connector.clone(), fast_config());

    let (a, b) = tokio::join!(
        pipeline.submit(request("req-dup", 300)),
        pipeline.submit(request("req-dup", 300))
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(connector.submitted().len(), 1);
    assert_eq!(exposure(&pipeline).await, 300);
}

// ---------------------------------------------------------------------------
// Settlement failure, retry and timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retryable_failures_retry_within_budget() {
    let connector = Arc::new(FlakyConnector::new(2));
    let pipeline = pipeline_with(connector.clone(), fast_config());

    let outcome = pipeline.submit(request("req-retry", 400)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::Settled);
    assert_eq!(connector.submitted().len(), 3);
    assert_eq!(connector.outcomes(), 3);
    assert_eq!(exposure(&pipeline).await, 400);

    let attempts = pipeline
        .audit()
        .entries_for("req-retry")
        .await
        .into_iter()
        .filter(|entry| entry.kind == AuditEntryKind::Settlement)
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn exhausted_retry_budget_releases_exposure() {
    let connector = Arc::new(FlakyConnector::new(2));
    let config = PipelineConfig {
        settlement_retry_budget: 1,
        ..fast_config()
    };
    let pipeline = pipeline_with(connector.clone(), config);

    let outcome = pipeline.submit(request("req-exhaust", 400)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::SettlementFailed);
    assert!(outcome.decision.unwrap().approved());
    assert_eq!(connector.outcomes(), 2);
    assert_eq!(exposure(&pipeline).await, 0);
    assert_eq!(pipeline.ledger().outstanding_count(), 0);
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let connector = Arc::new(AlwaysFailConnector::fatal("xrpl", "tecNO_DST"));
    let pipeline = pipeline_with(connector.clone(), fast_config());

    let outcome = pipeline.submit(request("req-fatal", 400)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::SettlementFailed);
    assert!(outcome.detail.unwrap().contains("tecNO_DST"));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(exposure(&pipeline).await, 0);
}

#[tokio::test]
async fn refused_submissions_retry_until_budget_runs_out() {
    let connector = Arc::new(AlwaysFailConnector::retryable("xrpl", "telINSUF_FEE_P"));
    let config = PipelineConfig {
        settlement_retry_budget: 2,
        ..fast_config()
    };
    let pipeline = pipeline_with(connector.clone(), config);

    let outcome = pipeline.submit(request("req-fee", 400)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::SettlementFailed);
    assert_eq!(connector.attempts(), 3);
    assert_eq!(exposure(&pipeline).await, 0);
    assert_eq!(pipeline.ledger().outstanding_count(), 0);
}

#[tokio::test]
async fn settlement_timeout_releases_without_retry() {
    let connector = Arc::new(SlowConnector::new(Duration::from_secs(5)));
    let config = PipelineConfig {
        settlement_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let pipeline = pipeline_with(connector.clone(), config);

    let outcome = pipeline.submit(request("req-slow", 400)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::SettlementFailed);
    assert!(outcome.detail.unwrap().contains("exceeded"));
    assert_eq!(connector.submitted().len(), 1);
    assert_eq!(exposure(&pipeline).await, 0);
}

#[tokio::test]
async fn unaudited_settlement_still_settles_and_keeps_exposure() {
    let connector = Arc::new(SimulatedLedgerConnector::new());
    let audit = Arc::new(
        PersistentAuditTrail::with_sink(Vec::new(), Arc::new(SettlementRefusingSink)).unwrap(),
    );
    let pipeline = LiquidityPipeline::builder(connector.clone(), verifier())
        .audit(audit)
        .config(fast_config())
        .build()
        .unwrap();
    pipeline.credentials().register(credential(1_000)).unwrap();
    pipeline.policies().set(policy(800)).unwrap();

    let outcome = pipeline.submit(request("req-moved", 500)).await.unwrap();
    assert_eq!(outcome.stage, RequestStage::Settled);
    assert_eq!(exposure(&pipeline).await, 500);
    assert_eq!(pipeline.ledger().outstanding_count(), 0);

    let again = pipeline.submit(request("req-moved", 500)).await.unwrap();
    assert_eq!(again, outcome);
    assert_eq!(connector.submitted().len(), 1);
    assert_eq!(pipeline.cancel("req-moved"), CancelDisposition::Refused(RequestStage::Settled));

    let entries = pipeline.audit().entries_for("req-moved").await;
    assert!(entries
        .iter()
        .all(|entry| entry.kind != AuditEntryKind::Settlement));
    assert!(stages(&pipeline, "req-moved")
        .await
        .ends_with(&[RequestStage::SettlementPending, RequestStage::Settled]));
}

#[tokio::test]
async fn restart_commits_settled_and_releases_abandoned_reservations() {
    let store = Arc::new(MemoryExposureStore::new());
    let audit = Arc::new(PersistentAuditTrail::memory());
    let key = request("any", 1).exposure_key();
    let limits = ExposureLimits::new(&credential(1_000), &policy(800));

    // A process that reserved twice, saw one settlement succeed, then stopped.
    let earlier = ExposureLedger::new(store.clone());
    let paid = earlier.reserve(&key, "req-paid", 300, limits).await.unwrap();
    earlier.reserve(&key, "req-lost", 400, limits).await.unwrap();
    audit
        .record(
            "req-paid",
            AuditEntryKind::Decision,
            &serde_json::json!({ "decision": CreditDecision::approve(300, 450) }),
        )
        .await
        .unwrap();
    let tx = TxHandle {
        tx_id: "tx-paid".to_string(),
        kind: SettlementKind::TrustLine,
        submitted_at: Utc::now(),
    };
    audit
        .record(
            "req-paid",
            AuditEntryKind::Settlement,
            &serde_json::json!({ "attempt": 1, "result": "success", "tx": tx, "detail": null }),
        )
        .await
        .unwrap();
    drop(earlier);

    let connector = Arc::new(SimulatedLedgerConnector::new());
    let ledger = Arc::new(ExposureLedger::open(store.clone()).await.unwrap());
    assert_eq!(ledger.outstanding_count(), 2);
    let pipeline = LiquidityPipeline::builder(connector.clone(), verifier())
        .ledger(ledger)
        .audit(audit)
        .config(fast_config())
        .build()
        .unwrap();
    pipeline.credentials().register(credential(1_000)).unwrap();
    pipeline.policies().set(policy(800)).unwrap();

    let report = pipeline.recover_reservations().await.unwrap();
    assert_eq!(report.released, vec!["req-lost".to_string()]);
    assert_eq!(report.settled.len(), 1);
    let settled = &report.settled[0];
    assert_eq!(settled.request_id, "req-paid");
    assert_eq!(settled.stage, RequestStage::Settled);
    assert_eq!(settled.settlement.as_ref().unwrap().tx_id, "tx-paid");
    assert_eq!(settled.decision, Some(CreditDecision::approve(300, 450)));

    assert_eq!(pipeline.ledger().outstanding_count(), 0);
    assert!(store.outstanding_reservations().await.unwrap().is_empty());
    assert_eq!(exposure(&pipeline).await, 300);
    let statuses: Vec<_> = pipeline
        .ledger()
        .reservations(&key)
        .await
        .unwrap()
        .into_iter()
        .map(|record| (record.handle.request_id, record.status))
        .collect();
    assert!(statuses.contains(&("req-paid".to_string(), ReservationStatus::Committed)));
    assert!(statuses.contains(&("req-lost".to_string(), ReservationStatus::Released)));
    assert_eq!(paid.request_id, "req-paid");

    // The settled request answers from its recovered outcome; nothing is resubmitted.
    let again = pipeline.submit(request("req-paid", 300)).await.unwrap();
    assert_eq!(&again, settled);
    assert!(connector.submitted().is_empty());

    // A second pass has nothing left to do.
    assert_eq!(
        pipeline.recover_reservations().await.unwrap(),
        Default::default()
    );
}

#[tokio::test]
async fn escrow_mode_submits_escrow() {
    let config = PipelineConfig {
        settlement_mode: SettlementMode::Escrow {
            finish_after_secs: 60,
            cancel_after_secs: 3_600,
        },
        ..fast_config()
    };
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), config);
    let outcome = pipeline.submit(request("req-escrow", 100)).await.unwrap();
    assert_eq!(outcome.settlement.unwrap().kind, SettlementKind::Escrow);
}

#[test]
fn escrow_window_must_be_ordered() {
    let config = PipelineConfig {
        settlement_mode: SettlementMode::Escrow {
            finish_after_secs: 600,
            cancel_after_secs: 60,
        },
        ..PipelineConfig::default()
    };
    let built = LiquidityPipeline::builder(Arc::new(SimulatedLedgerConnector::new()), verifier())
        .config(config)
        .build();
    assert!(matches!(built, Err(CreditError::Validation(_))));
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_during_proof_verification_ends_cancelled() {
    let anchor = Arc::new(GatedAnchor {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let pipeline = LiquidityPipeline::builder(
        Arc::new(SimulatedLedgerConnector::new()),
        ProofVerifier::new(anchor.clone()),
    )
    .build()
    .unwrap();
    pipeline.credentials().register(credential(1_000)).unwrap();
    pipeline.policies().set(policy(800)).unwrap();

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .submit(request("req-cancel", 100).with_proof(oracle_proof(0.03)))
                .await
        })
    };
    anchor.entered.notified().await;
    assert_eq!(pipeline.cancel("req-cancel"), CancelDisposition::Accepted);
    anchor.release.notify_one();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.stage, RequestStage::Cancelled);
    assert_eq!(exposure(&pipeline).await, 0);
}

#[tokio::test]
async fn cancel_after_reservation_releases_first() {
    let advisor = Arc::new(GatedAdvisor {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let connector = Arc::new(SimulatedLedgerConnector::new());
    let pipeline = LiquidityPipeline::builder(connector.clone(), verifier())
        .advisor(advisor.clone())
        .build()
        .unwrap();
    pipeline.credentials().register(credential(1_000)).unwrap();
    pipeline.policies().set(policy(800)).unwrap();

    let task = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.submit(request("req-held", 300)).await })
    };
    advisor.entered.notified().await;
    assert_eq!(exposure(&pipeline).await, 300);
    assert_eq!(pipeline.cancel("req-held"), CancelDisposition::Accepted);
    advisor.release.notify_one();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.stage, RequestStage::Cancelled);
    assert_eq!(exposure(&pipeline).await, 0);
    assert_eq!(connector.submitted().len(), 0);
    assert!(stages(&pipeline, "req-held")
        .await
        .contains(&RequestStage::Reserved));
}

#[tokio::test]
async fn cancel_is_refused_once_terminal_and_unknown_ids_are_reported() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    pipeline.submit(request("req-done", 100)).await.unwrap();

    assert_eq!(
        pipeline.cancel("req-done"),
        CancelDisposition::Refused(RequestStage::Settled)
    );
    assert_eq!(pipeline.cancel("req-missing"), CancelDisposition::Unknown);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatcher_reports_completion() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    let dispatcher = RequestDispatcher::new(pipeline, 2);

    let ids: Vec<String> = (0..4)
        .map(|i| dispatcher.submit(request(&format!("req-d{i}"), 100)))
        .collect();
    for id in &ids {
        let status = dispatcher.wait(id).await.unwrap();
        assert!(matches!(
            status,
            DispatchStatus::Completed { ref outcome } if outcome.stage == RequestStage::Settled
        ));
    }
    assert!(dispatcher.status("req-unknown").is_none());
    assert!(matches!(
        dispatcher.wait("req-unknown").await,
        Err(CreditError::NotFound(_))
    ));
}

#[tokio::test]
async fn dispatcher_reports_validation_failures() {
    let pipeline = pipeline_with(Arc::new(SimulatedLedgerConnector::new()), fast_config());
    let dispatcher = RequestDispatcher::new(pipeline, 1);
    let mut bad = request("req-d-bad", 100);
    bad.business_did = "nope".to_string();

    let id = dispatcher.submit(bad);
    assert!(matches!(
        dispatcher.wait(&id).await.unwrap(),
        DispatchStatus::Failed { .. }
    ));
}
