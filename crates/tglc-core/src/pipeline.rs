//! Liquidity request pipeline.
//!
//! Each request runs as its own tokio task through the stage machine in [`crate::flow`]:
//! proof verification, evaluation and reservation under the exposure key lock, settlement, then
//! commit or release. Every transition is audited before the next one starts.

use crate::advisor::DecisionAdvisor;
use crate::audit::{AuditEntry, AuditEntryKind, TransitionEvent};
use crate::error::CreditError;
use crate::exposure::{EvaluatedReservation, ExposureLedger, ExposureLimits, ReservationHandle};
use crate::flow::{RequestStage, RequestStateMachine};
use crate::policy::PolicyEvaluator;
use crate::proof::ProofVerifier;
use crate::registry::{CredentialRegistry, PolicyRegistry};
use crate::settlement::{
    EscrowInstruction, SettlementConnector, SettlementError, SettlementInstruction,
    SettlementMode, SettlementOutcome, TxHandle,
};
use crate::storage::PersistentAuditTrail;
use crate::types::{
    CreditDecision, ExposureState, LiquidityRequest, ProofVerificationResult, ReasonCode,
    RequestOutcome,
};
use crate::validation;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Longest escrow window the pipeline will build, in seconds (ten years).
const MAX_ESCROW_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub proof_timeout: Duration,
    /// Bound on one settlement attempt, submission plus outcome.
    pub settlement_timeout: Duration,
    /// Extra attempts granted to retryable settlement failures.
    pub settlement_retry_budget: u32,
    pub settlement_backoff: Duration,
    pub advisor_timeout: Duration,
    pub settlement_mode: SettlementMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            proof_timeout: Duration::from_secs(5),
            settlement_timeout: Duration::from_secs(30),
            settlement_retry_budget: 2,
            settlement_backoff: Duration::from_millis(250),
            advisor_timeout: Duration::from_secs(2),
            settlement_mode: SettlementMode::TrustLine,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), CreditError> {
        if self.proof_timeout.is_zero() || self.settlement_timeout.is_zero() {
            return Err(CreditError::validation("pipeline timeouts must be non-zero"));
        }
        if let SettlementMode::Escrow {
            finish_after_secs,
            cancel_after_secs,
        } = self.settlement_mode
        {
            if cancel_after_secs <= finish_after_secs {
                return Err(CreditError::validation(
                    "escrow cancel_after must be later than finish_after",
                ));
            }
            if cancel_after_secs > MAX_ESCROW_WINDOW_SECS {
                return Err(CreditError::validation(format!(
                    "escrow window {cancel_after_secs}s exceeds {MAX_ESCROW_WINDOW_SECS}s"
                )));
            }
        }
        Ok(())
    }
}

/// Answer to a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", content = "stage", rename_all = "snake_case")]
pub enum CancelDisposition {
    /// Honoured at the request's next stage boundary.
    Accepted,
    Refused(RequestStage),
    Unknown,
}

#[derive(Debug)]
struct SlotControl {
    stage: RequestStage,
    cancel_requested: bool,
}

/// Shared state of one request id: current stage, cancellation flag and the published result.
struct RequestSlot {
    control: Mutex<SlotControl>,
    done: watch::Sender<Option<Result<RequestOutcome, CreditError>>>,
}

impl RequestSlot {
    fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            control: Mutex::new(SlotControl {
                stage: RequestStage::Received,
                cancel_requested: false,
            }),
            done,
        }
    }

    /// Slot for a request that already reached `outcome`.
    fn concluded(outcome: RequestOutcome) -> Self {
        let slot = Self::new();
        slot.control().stage = outcome.stage;
        slot.publish(Ok(outcome));
        slot
    }

    fn control(&self) -> std::sync::MutexGuard<'_, SlotControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stage(&self) -> RequestStage {
        self.control().stage
    }

    fn cancel_requested(&self) -> bool {
        self.control().cancel_requested
    }

    fn request_cancel(&self) -> CancelDisposition {
        let mut control = self.control();
        if control.stage.is_cancellable() {
            control.cancel_requested = true;
            CancelDisposition::Accepted
        } else {
            CancelDisposition::Refused(control.stage)
        }
    }

    fn outcome(&self) -> Option<RequestOutcome> {
        match &*self.done.borrow() {
            Some(Ok(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    fn publish(&self, result: Result<RequestOutcome, CreditError>) {
        self.done.send_replace(Some(result));
    }

    async fn wait(&self) -> Result<RequestOutcome, CreditError> {
        let mut receiver = self.done.subscribe();
        let published = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CreditError::InvariantViolation("request slot closed".to_string()))?;
        match &*published {
            Some(result) => result.clone(),
            None => Err(CreditError::InvariantViolation(
                "request slot published nothing".to_string(),
            )),
        }
    }
}

/// Settlement gave up; carries the last handle seen, if any.
struct SettlementAbandoned {
    handle: Option<TxHandle>,
    detail: String,
}

/// Reservations left open by an earlier process and what recovery did with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Requests whose settlement had succeeded; their reservations were committed.
    pub settled: Vec<RequestOutcome>,
    /// Requests that never settled; their reservations were released.
    pub released: Vec<String>,
}

/// Builder for [`LiquidityPipeline`]. Registries, ledger and audit default to fresh
/// in-memory instances.
pub struct PipelineBuilder {
    connector: Arc<dyn SettlementConnector>,
    verifier: ProofVerifier,
    credentials: Option<Arc<CredentialRegistry>>,
    policies: Option<Arc<PolicyRegistry>>,
    ledger: Option<Arc<ExposureLedger>>,
    audit: Option<Arc<PersistentAuditTrail>>,
    evaluator: PolicyEvaluator,
    advisor: Option<Arc<dyn DecisionAdvisor>>,
    config: PipelineConfig,
}

impl PipelineBuilder {
    pub fn credentials(mut self, credentials: Arc<CredentialRegistry>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn policies(mut self, policies: Arc<PolicyRegistry>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn ledger(mut self, ledger: Arc<ExposureLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn audit(mut self, audit: Arc<PersistentAuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn evaluator(mut self, evaluator: PolicyEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn advisor(mut self, advisor: Arc<dyn DecisionAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<LiquidityPipeline, CreditError> {
        self.config.validate()?;
        Ok(LiquidityPipeline {
            inner: Arc::new(PipelineInner {
                credentials: self.credentials.unwrap_or_default(),
                policies: self.policies.unwrap_or_default(),
                verifier: self.verifier,
                evaluator: self.evaluator,
                ledger: self.ledger.unwrap_or_default(),
                connector: self.connector,
                audit: self
                    .audit
                    .unwrap_or_else(|| Arc::new(PersistentAuditTrail::memory())),
                advisor: self.advisor,
                config: self.config,
                requests: DashMap::new(),
            }),
        })
    }
}

/// Cloneable handle to the request pipeline.
#[derive(Clone)]
pub struct LiquidityPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    credentials: Arc<CredentialRegistry>,
    policies: Arc<PolicyRegistry>,
    verifier: ProofVerifier,
    evaluator: PolicyEvaluator,
    ledger: Arc<ExposureLedger>,
    connector: Arc<dyn SettlementConnector>,
    audit: Arc<PersistentAuditTrail>,
    advisor: Option<Arc<dyn DecisionAdvisor>>,
    config: PipelineConfig,
    requests: DashMap<String, Arc<RequestSlot>>,
}

impl LiquidityPipeline {
    pub fn builder(connector: Arc<dyn SettlementConnector>, verifier: ProofVerifier) -> PipelineBuilder {
        PipelineBuilder {
            connector,
            verifier,
            credentials: None,
            policies: None,
            ledger: None,
            audit: None,
            evaluator: PolicyEvaluator::default(),
            advisor: None,
            config: PipelineConfig::default(),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.inner.credentials
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.inner.policies
    }

    pub fn ledger(&self) -> &Arc<ExposureLedger> {
        &self.inner.ledger
    }

    pub fn audit(&self) -> &Arc<PersistentAuditTrail> {
        &self.inner.audit
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Run a request to its terminal stage.
    ///
    /// A request id already seen returns the original outcome, waiting for it if the first
    /// attempt is still running. Malformed requests fail with [`CreditError::Validation`]
    /// before any state is touched.
    pub async fn submit(&self, request: LiquidityRequest) -> Result<RequestOutcome, CreditError> {
        if let Err(err) = validation::validate_request(&request) {
            warn!(request_id = %request.request_id, error = %err, "request failed validation");
            self.inner
                .audit
                .record(
                    &request.request_id,
                    AuditEntryKind::Outcome,
                    &serde_json::json!({ "validation_error": err.to_string() }),
                )
                .await?;
            return Err(err);
        }

        let request_id = request.request_id.clone();
        let slot = match self.inner.requests.entry(request_id.clone()) {
            Entry::Occupied(existing) => {
                let slot = existing.get().clone();
                drop(existing);
                info!(request_id = %request_id, "duplicate request id; returning original outcome");
                return slot.wait().await;
            }
            Entry::Vacant(vacant) => {
                let slot = Arc::new(RequestSlot::new());
                vacant.insert(slot.clone());
                slot
            }
        };

        let inner = self.inner.clone();
        let task_slot = slot.clone();
        let task = tokio::spawn(async move { inner.run(request, task_slot).await });
        if let Err(join_err) = task.await {
            error!(request_id = %request_id, error = %join_err, "pipeline task aborted");
            self.inner.requests.remove(&request_id);
            slot.publish(Err(CreditError::InvariantViolation(format!(
                "pipeline task for {request_id} aborted: {join_err}"
            ))));
        }
        slot.wait().await
    }

    /// Ask for a request to be cancelled.
    ///
    /// Accepted while the request has not reached settlement; a reservation already held is
    /// released first.
    pub fn cancel(&self, request_id: &str) -> CancelDisposition {
        let Some(slot) = self.inner.requests.get(request_id).map(|slot| slot.clone()) else {
            return CancelDisposition::Unknown;
        };
        let disposition = slot.request_cancel();
        info!(request_id, ?disposition, "cancellation requested");
        disposition
    }

    pub fn stage(&self, request_id: &str) -> Option<RequestStage> {
        self.inner
            .requests
            .get(request_id)
            .map(|slot| slot.stage())
    }

    pub fn outcome(&self, request_id: &str) -> Option<RequestOutcome> {
        self.inner
            .requests
            .get(request_id)
            .and_then(|slot| slot.outcome())
    }

    /// Commit or release reservations this pipeline did not open itself.
    ///
    /// Meant to run once at startup over a ledger built with [`ExposureLedger::open`]. A
    /// reservation whose request has a successful settlement in the audit trail is committed
    /// and the request answers with its `Settled` outcome from then on. Every other one is
    /// released.
    pub async fn recover_reservations(&self) -> Result<RecoveryReport, CreditError> {
        let mut report = RecoveryReport::default();
        for handle in self.inner.ledger.outstanding_handles() {
            if self.inner.requests.contains_key(&handle.request_id) {
                continue;
            }
            let entries = self.inner.audit.entries_for(&handle.request_id).await;
            match recovered_settlement(&handle, &entries) {
                Some((outcome, audited)) => {
                    self.inner.ledger.commit(&handle).await?;
                    if !audited {
                        self.inner
                            .audit
                            .record(&handle.request_id, AuditEntryKind::Outcome, &outcome)
                            .await?;
                    }
                    warn!(
                        request_id = %handle.request_id,
                        amount_minor = handle.amount_minor,
                        "settled reservation committed on recovery"
                    );
                    self.inner.requests.insert(
                        handle.request_id.clone(),
                        Arc::new(RequestSlot::concluded(outcome.clone())),
                    );
                    report.settled.push(outcome);
                }
                None => {
                    self.inner.ledger.release(&handle).await?;
                    self.inner
                        .audit
                        .record(
                            &handle.request_id,
                            AuditEntryKind::Outcome,
                            &serde_json::json!({
                                "recovery": "released",
                                "reservation_id": handle.reservation_id,
                                "amount_minor": handle.amount_minor,
                            }),
                        )
                        .await?;
                    warn!(
                        request_id = %handle.request_id,
                        amount_minor = handle.amount_minor,
                        "unsettled reservation released on recovery"
                    );
                    report.released.push(handle.request_id.clone());
                }
            }
        }
        if !report.settled.is_empty() || !report.released.is_empty() {
            info!(
                settled = report.settled.len(),
                released = report.released.len(),
                "reservation recovery finished"
            );
        }
        Ok(report)
    }
}

/// Settled outcome for `handle`'s request, if its settlement succeeded, and whether that
/// outcome is already in the audit trail.
fn recovered_settlement(
    handle: &ReservationHandle,
    entries: &[AuditEntry],
) -> Option<(RequestOutcome, bool)> {
    let audited = entries
        .iter()
        .filter(|entry| entry.kind == AuditEntryKind::Outcome)
        .filter_map(|entry| serde_json::from_value::<RequestOutcome>(entry.payload.clone()).ok())
        .find(|outcome| outcome.stage == RequestStage::Settled);
    if let Some(outcome) = audited {
        return Some((outcome, true));
    }

    let tx = entries
        .iter()
        .filter(|entry| {
            entry.kind == AuditEntryKind::Settlement && entry.payload["result"] == "success"
        })
        .find_map(|entry| serde_json::from_value::<TxHandle>(entry.payload["tx"].clone()).ok())?;
    let decision = entries
        .iter()
        .filter(|entry| entry.kind == AuditEntryKind::Decision)
        .find_map(|entry| {
            serde_json::from_value::<CreditDecision>(entry.payload["decision"].clone()).ok()
        });
    let outcome = RequestOutcome {
        request_id: handle.request_id.clone(),
        stage: RequestStage::Settled,
        decision,
        detail: Some(format!("settled as {}; recovered after restart", tx.tx_id)),
        settlement: Some(tx),
        completed_at: Utc::now(),
    };
    Some((outcome, false))
}

impl PipelineInner {
    async fn run(self: Arc<Self>, request: LiquidityRequest, slot: Arc<RequestSlot>) {
        let request_id = request.request_id.clone();
        let result = self.process(&request, &slot).await;
        match &result {
            Ok(outcome) => info!(
                request_id = %request_id,
                stage = outcome.stage.name(),
                reason = ?outcome.reason(),
                "request completed"
            ),
            // Aborted runs never reach a successful settlement, so a retry may evaluate afresh.
            Err(err) => {
                error!(request_id = %request_id, error = %err, "request aborted");
                self.requests.remove(&request_id);
            }
        }
        slot.publish(result);
    }

    async fn process(
        &self,
        request: &LiquidityRequest,
        slot: &RequestSlot,
    ) -> Result<RequestOutcome, CreditError> {
        let at = Utc::now();
        let mut run = RequestRun::new(&self.audit, slot, &request.request_id);
        run.record_received().await?;

        if slot.cancel_requested() {
            return run
                .finish(RequestStage::Cancelled, None, None, "cancelled before evaluation")
                .await;
        }

        let credential = self
            .credentials
            .lookup_at(&request.business_id, &request.bank_id, &request.corridor, at)
            .found();
        let policy = self.policies.get(&request.bank_id);
        let (credential, policy) = match (credential, policy) {
            (Some(credential), Some(policy)) => (credential, policy),
            (None, _) => {
                let detail = format!(
                    "no active credential from {} covers {} for {}",
                    request.bank_id, request.corridor, request.business_id
                );
                let violation = CreditError::PolicyViolation(ReasonCode::CorridorOrExpiry);
                return run.reject(violation, detail).await;
            }
            (Some(_), None) => {
                let detail = format!("no credit policy configured for {}", request.bank_id);
                let violation = CreditError::PolicyViolation(ReasonCode::CorridorOrExpiry);
                return run.reject(violation, detail).await;
            }
        };

        let proof = match &request.proof {
            None => None,
            Some(payload) => {
                let verified =
                    tokio::time::timeout(self.config.proof_timeout, self.verifier.verify(payload, at))
                        .await;
                match verified {
                    Ok(Ok(result)) => Some(result),
                    Ok(Err(err)) => return run.reject_proof(err.to_string()).await,
                    Err(_) => {
                        let detail = format!(
                            "proof verification exceeded {:?}",
                            self.config.proof_timeout
                        );
                        return run.reject_proof(detail).await;
                    }
                }
            }
        };

        let proof_detail = match &proof {
            Some(result) => format!(
                "confidence {} at default rate {}",
                result.confidence_score, result.default_rate
            ),
            None => "no proof supplied".to_string(),
        };
        if !run
            .advance_unless_cancelled(RequestStage::ProofVerified, proof_detail)
            .await?
        {
            return run
                .finish(RequestStage::Cancelled, None, None, "cancelled after proof verification")
                .await;
        }

        let key = request.exposure_key();
        let limits = ExposureLimits::new(&credential, &policy);
        let evaluator = &self.evaluator;
        let evaluation = self
            .ledger
            .reserve_evaluated(&key, &request.request_id, limits, |snapshot| {
                evaluator.evaluate(request, &credential, &policy, snapshot, proof.as_ref(), at)
            })
            .await;

        match evaluation {
            Ok(EvaluatedReservation::Declined { decision, snapshot }) => {
                run.record_decision(&decision, &snapshot).await?;
                self.consult_advisor(&run, request, proof.as_ref(), &decision)
                    .await?;
                let detail = match decision.reason() {
                    Some(reason) => CreditError::PolicyViolation(reason).to_string(),
                    None => "policy declined".to_string(),
                };
                run.advance(RequestStage::PolicyEvaluated, detail.clone())
                    .await?;
                run.finish(RequestStage::Rejected, Some(decision), None, detail)
                    .await
            }
            Ok(EvaluatedReservation::Reserved {
                decision,
                handle,
                snapshot,
            }) => {
                let settled = self
                    .settle_reserved(&mut run, request, proof.as_ref(), decision, &handle, &snapshot, at)
                    .await;
                if settled.is_err() && self.ledger.is_outstanding(&handle) {
                    if let Err(release_err) = self.ledger.release(&handle).await {
                        error!(
                            request_id = %request.request_id,
                            error = %release_err,
                            "release after aborted request failed"
                        );
                    }
                }
                settled
            }
            Err(err) if err.reason_code() == Some(ReasonCode::ExposureExceeded) => {
                run.advance(
                    RequestStage::PolicyEvaluated,
                    "approved against snapshot; reservation refused",
                )
                .await?;
                let detail = err.to_string();
                run.reject(err, detail).await
            }
            Err(err) => Err(err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_reserved(
        &self,
        run: &mut RequestRun<'_>,
        request: &LiquidityRequest,
        proof: Option<&ProofVerificationResult>,
        decision: CreditDecision,
        handle: &ReservationHandle,
        snapshot: &ExposureState,
        at: DateTime<Utc>,
    ) -> Result<RequestOutcome, CreditError> {
        run.record_decision(&decision, snapshot).await?;
        self.consult_advisor(run, request, proof, &decision).await?;
        run.advance(
            RequestStage::PolicyEvaluated,
            format!(
                "approved {} minor at {} bps",
                handle.amount_minor,
                decision.rate_bps().unwrap_or_default()
            ),
        )
        .await?;
        run.advance(
            RequestStage::Reserved,
            format!("reservation {}", handle.reservation_id),
        )
        .await?;

        let instruction = self.instruction_for(request, handle.amount_minor, at);
        let entered = run
            .advance_unless_cancelled(
                RequestStage::SettlementPending,
                format!("submitting {}", instruction.kind().as_str()),
            )
            .await?;
        if !entered {
            self.ledger.release(handle).await?;
            return run
                .finish(
                    RequestStage::Cancelled,
                    Some(decision),
                    None,
                    "cancelled after reservation; exposure released",
                )
                .await;
        }

        match self.drive_settlement(run, &instruction).await? {
            Ok((attempt, tx)) => Ok(self
                .complete_settled(run, attempt, decision, handle, tx)
                .await),
            Err(abandoned) => {
                self.ledger.release(handle).await?;
                run.finish(
                    RequestStage::SettlementFailed,
                    Some(decision),
                    abandoned.handle,
                    abandoned.detail,
                )
                .await
            }
        }
    }

    /// Liquidity has moved: commit and end `Settled`. Failures from here on are logged and
    /// never undo the settlement.
    async fn complete_settled(
        &self,
        run: &mut RequestRun<'_>,
        attempt: u32,
        decision: CreditDecision,
        handle: &ReservationHandle,
        tx: TxHandle,
    ) -> RequestOutcome {
        if let Err(err) = self.ledger.commit(handle).await {
            error!(
                request_id = run.request_id,
                reservation_id = %handle.reservation_id,
                error = %err,
                "commit after settlement failed; reservation stays outstanding"
            );
        }
        if let Err(err) = run
            .record_settlement(attempt, "success", Some(&tx), None)
            .await
        {
            error!(request_id = run.request_id, tx_id = %tx.tx_id, error = %err, "settlement success not audited");
        }
        let detail = format!("settled as {}", tx.tx_id);
        run.finish_logged(RequestStage::Settled, Some(decision), Some(tx), detail)
            .await
    }

    fn instruction_for(
        &self,
        request: &LiquidityRequest,
        amount_minor: u64,
        at: DateTime<Utc>,
    ) -> SettlementInstruction {
        let currency = request.corridor.quote().to_string();
        match self.config.settlement_mode {
            SettlementMode::TrustLine => SettlementInstruction::TrustLine {
                request_id: request.request_id.clone(),
                address: request.principal_address.clone(),
                currency,
                limit_minor: amount_minor,
            },
            SettlementMode::Escrow {
                finish_after_secs,
                cancel_after_secs,
            } => SettlementInstruction::Escrow(EscrowInstruction {
                request_id: request.request_id.clone(),
                destination: request.principal_address.clone(),
                currency,
                amount_minor,
                finish_after: at + window(finish_after_secs),
                cancel_after: at + window(cancel_after_secs),
            }),
        }
    }

    /// Submit and await settlement, retrying retryable failures within the budget.
    ///
    /// The outer error is an audit failure on a failed attempt; the inner one means settlement
    /// was abandoned. Success carries the attempt number and is left for the caller to audit.
    async fn drive_settlement(
        &self,
        run: &RequestRun<'_>,
        instruction: &SettlementInstruction,
    ) -> Result<Result<(u32, TxHandle), SettlementAbandoned>, CreditError> {
        let attempts = self.config.settlement_retry_budget + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result =
                tokio::time::timeout(self.config.settlement_timeout, self.settle_once(instruction))
                    .await;

            let (handle, failure) = match result {
                Ok(Ok(tx)) => return Ok(Ok((attempt, tx))),
                Ok(Err((handle, failure))) => (handle, failure),
                Err(_) => {
                    let detail = format!(
                        "settlement attempt {attempt} exceeded {:?}",
                        self.config.settlement_timeout
                    );
                    run.record_settlement(attempt, "timeout", None, Some(&detail))
                        .await?;
                    warn!(request_id = run.request_id, attempt, "settlement timed out");
                    return Ok(Err(SettlementAbandoned {
                        handle: None,
                        detail,
                    }));
                }
            };

            let failure = CreditError::from(failure);
            let retryable = failure.is_retryable();
            let class = if retryable { "retryable" } else { "fatal" };
            let detail = failure.to_string();
            run.record_settlement(attempt, class, handle.as_ref(), Some(&detail))
                .await?;
            if retryable && attempt < attempts {
                warn!(
                    request_id = run.request_id,
                    attempt,
                    error = %failure,
                    "retryable settlement failure; retrying"
                );
                tokio::time::sleep(self.config.settlement_backoff).await;
                continue;
            }

            warn!(request_id = run.request_id, attempt, error = %failure, "settlement abandoned");
            return Ok(Err(SettlementAbandoned { handle, detail }));
        }
    }

    async fn settle_once(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<TxHandle, (Option<TxHandle>, SettlementError)> {
        let handle = self
            .connector
            .submit(instruction)
            .await
            .map_err(|err| (None, err))?;
        debug!(tx_id = %handle.tx_id, rail = self.connector.rail(), "settlement submitted");
        match self.connector.await_outcome(&handle).await {
            SettlementOutcome::Success(tx) => Ok(tx),
            SettlementOutcome::Failed(tx, failure) => Err((Some(tx), failure)),
        }
    }

    async fn consult_advisor(
        &self,
        run: &RequestRun<'_>,
        request: &LiquidityRequest,
        proof: Option<&ProofVerificationResult>,
        decision: &CreditDecision,
    ) -> Result<(), CreditError> {
        let Some(advisor) = &self.advisor else {
            return Ok(());
        };
        let advice = tokio::time::timeout(
            self.config.advisor_timeout,
            advisor.advise(request, proof, decision),
        )
        .await;
        match advice {
            Ok(Ok(advisory)) => {
                if advisory.recommend_approval != decision.approved() {
                    info!(
                        request_id = run.request_id,
                        advisor = advisor.name(),
                        "advisor disagrees with decision"
                    );
                }
                self.audit
                    .record(run.request_id, AuditEntryKind::Advisory, &advisory)
                    .await?;
            }
            Ok(Err(err)) => {
                warn!(request_id = run.request_id, advisor = advisor.name(), error = %err, "advisor failed");
            }
            Err(_) => {
                warn!(request_id = run.request_id, advisor = advisor.name(), "advisor timed out");
            }
        }
        Ok(())
    }
}

fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_ESCROW_WINDOW_SECS) as i64)
}

/// Per-request stage machine bound to the audit trail and the request's shared slot.
struct RequestRun<'a> {
    audit: &'a PersistentAuditTrail,
    slot: &'a RequestSlot,
    request_id: &'a str,
    machine: RequestStateMachine,
}

impl<'a> RequestRun<'a> {
    fn new(audit: &'a PersistentAuditTrail, slot: &'a RequestSlot, request_id: &'a str) -> Self {
        Self {
            audit,
            slot,
            request_id,
            machine: RequestStateMachine::new(request_id),
        }
    }

    async fn record_received(&self) -> Result<(), CreditError> {
        info!(request_id = self.request_id, "request received");
        self.record_transition(None, RequestStage::Received, "received".to_string())
            .await
    }

    fn enter(&mut self, next: RequestStage) -> Result<RequestStage, CreditError> {
        let from = self.machine.advance(next)?;
        self.slot.control().stage = next;
        Ok(from)
    }

    async fn advance(
        &mut self,
        next: RequestStage,
        detail: impl Into<String>,
    ) -> Result<(), CreditError> {
        let from = self.enter(next)?;
        self.log_and_record(from, next, detail.into()).await
    }

    /// Advance unless a cancellation is pending; returns whether the stage was entered.
    ///
    /// The flag check and the stage change happen under the slot lock, so a cancellation
    /// accepted before this point is never lost.
    async fn advance_unless_cancelled(
        &mut self,
        next: RequestStage,
        detail: impl Into<String>,
    ) -> Result<bool, CreditError> {
        let from = {
            let mut control = self.slot.control();
            if control.cancel_requested {
                return Ok(false);
            }
            let from = self.machine.advance(next)?;
            control.stage = next;
            from
        };
        self.log_and_record(from, next, detail.into()).await?;
        Ok(true)
    }

    async fn log_and_record(
        &self,
        from: RequestStage,
        to: RequestStage,
        detail: String,
    ) -> Result<(), CreditError> {
        match to {
            RequestStage::ProofRejected
            | RequestStage::Rejected
            | RequestStage::SettlementFailed => {
                warn!(request_id = self.request_id, from = from.name(), to = to.name(), detail = %detail, "request stage changed");
            }
            _ => {
                info!(request_id = self.request_id, from = from.name(), to = to.name(), detail = %detail, "request stage changed");
            }
        }
        self.record_transition(Some(from), to, detail).await
    }

    async fn record_transition(
        &self,
        from: Option<RequestStage>,
        to: RequestStage,
        detail: String,
    ) -> Result<(), CreditError> {
        self.audit
            .record(
                self.request_id,
                AuditEntryKind::Transition,
                &TransitionEvent { from, to, detail },
            )
            .await?;
        Ok(())
    }

    async fn record_decision(
        &self,
        decision: &CreditDecision,
        snapshot: &ExposureState,
    ) -> Result<(), CreditError> {
        self.audit
            .record(
                self.request_id,
                AuditEntryKind::Decision,
                &serde_json::json!({
                    "decision": decision,
                    "exposure_minor": snapshot.current_exposure_minor,
                    "exposure_version": snapshot.version,
                }),
            )
            .await?;
        Ok(())
    }

    async fn record_settlement(
        &self,
        attempt: u32,
        result: &str,
        handle: Option<&TxHandle>,
        detail: Option<&str>,
    ) -> Result<(), CreditError> {
        self.audit
            .record(
                self.request_id,
                AuditEntryKind::Settlement,
                &serde_json::json!({
                    "attempt": attempt,
                    "result": result,
                    "tx": handle,
                    "detail": detail,
                }),
            )
            .await?;
        Ok(())
    }

    /// End `Rejected` under the canonical reason code of `violation`.
    async fn reject(
        &mut self,
        violation: CreditError,
        detail: String,
    ) -> Result<RequestOutcome, CreditError> {
        let reason = violation.reason_code().ok_or_else(|| {
            CreditError::InvariantViolation(format!("'{violation}' carries no reason code"))
        })?;
        self.finish(
            RequestStage::Rejected,
            Some(CreditDecision::reject(reason)),
            None,
            detail,
        )
        .await
    }

    async fn reject_proof(&mut self, detail: String) -> Result<RequestOutcome, CreditError> {
        self.advance(RequestStage::ProofRejected, detail.clone())
            .await?;
        self.reject(CreditError::ProofInvalid(detail.clone()), detail)
            .await
    }

    async fn finish(
        &mut self,
        stage: RequestStage,
        decision: Option<CreditDecision>,
        settlement: Option<TxHandle>,
        detail: impl Into<String>,
    ) -> Result<RequestOutcome, CreditError> {
        let detail = detail.into();
        self.advance(stage, detail.clone()).await?;
        let outcome = self.outcome(stage, decision, settlement, detail);
        self.audit
            .record(self.request_id, AuditEntryKind::Outcome, &outcome)
            .await?;
        Ok(outcome)
    }

    /// Like [`Self::finish`], but the outcome stands even when it cannot be audited.
    async fn finish_logged(
        &mut self,
        stage: RequestStage,
        decision: Option<CreditDecision>,
        settlement: Option<TxHandle>,
        detail: String,
    ) -> RequestOutcome {
        let outcome = self.outcome(stage, decision, settlement, detail.clone());
        let transition = match self.enter(stage) {
            Ok(from) => self.log_and_record(from, stage, detail).await,
            Err(err) => Err(err),
        };
        if let Err(err) = transition {
            error!(request_id = self.request_id, stage = stage.name(), error = %err, "terminal transition not audited");
        }
        if let Err(err) = self
            .audit
            .record(self.request_id, AuditEntryKind::Outcome, &outcome)
            .await
        {
            error!(request_id = self.request_id, stage = stage.name(), error = %err, "terminal outcome not audited");
        }
        outcome
    }

    fn outcome(
        &self,
        stage: RequestStage,
        decision: Option<CreditDecision>,
        settlement: Option<TxHandle>,
        detail: String,
    ) -> RequestOutcome {
        RequestOutcome {
            request_id: self.request_id.to_string(),
            stage,
            decision,
            settlement,
            detail: Some(detail),
            completed_at: Utc::now(),
        }
    }
}
