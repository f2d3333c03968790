//! Authoritative exposure ledger.
//!
//! Every operation on one `(business_id, bank_id)` key runs under that key's async mutex; keys
//! never share a lock. Records are versioned so a store shared between processes rejects stale
//! writes with [`CreditError::ConcurrencyConflict`]. Each reservation is logged in the same write
//! as the exposure change it makes, so a restarted ledger can find and settle what it left open.

use crate::error::CreditError;
use crate::types::{CreditCredential, CreditDecision, CreditPolicy, ExposureKey, ExposureState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_CAS_RETRIES: u32 = 5;

/// Closed reservations kept per key by [`MemoryExposureStore`] and returned by
/// [`ExposureLedger::reservations`].
pub const RESERVATION_HISTORY: usize = 256;

/// Reservation log update applied together with an exposure write.
#[derive(Debug, Clone, Copy)]
pub enum ReservationChange<'a> {
    Open(&'a ReservationHandle),
    Close {
        reservation_id: &'a str,
        status: ReservationStatus,
    },
}

/// Versioned backing store for exposure records and the reservation log.
#[async_trait]
pub trait ExposureStore: Send + Sync {
    fn label(&self) -> &'static str;

    /// Current record, or the zero record if the key was never written.
    async fn load(&self, key: &ExposureKey) -> Result<ExposureState, CreditError>;

    /// Write `exposure_minor` if the stored version still equals `expected.version`.
    ///
    /// `change` lands atomically with the exposure write: both or neither.
    async fn compare_and_swap(
        &self,
        expected: &ExposureState,
        exposure_minor: u64,
        change: ReservationChange<'_>,
    ) -> Result<ExposureState, CreditError>;

    /// Mark an outstanding reservation committed. Exposure is unchanged.
    async fn commit_reservation(&self, reservation_id: &str) -> Result<(), CreditError>;

    async fn outstanding_reservations(&self) -> Result<Vec<ReservationHandle>, CreditError>;

    /// Outstanding reservations for `key` oldest first, then up to `history` closed ones, most
    /// recently closed first.
    async fn reservations(
        &self,
        key: &ExposureKey,
        history: usize,
    ) -> Result<Vec<ReservationRecord>, CreditError>;
}

#[derive(Debug, Default)]
pub struct MemoryExposureStore {
    states: DashMap<ExposureKey, ExposureState>,
    outstanding: DashMap<String, ReservationHandle>,
    closed: DashMap<ExposureKey, VecDeque<ReservationRecord>>,
}

impl MemoryExposureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn close(
        &self,
        reservation_id: &str,
        status: ReservationStatus,
    ) -> Result<(), CreditError> {
        let (_, handle) = self.outstanding.remove(reservation_id).ok_or_else(|| {
            CreditError::InvariantViolation(format!(
                "reservation {reservation_id} is not outstanding in the store"
            ))
        })?;
        let mut closed = self.closed.entry(handle.key.clone()).or_default();
        closed.push_front(ReservationRecord {
            handle,
            status,
            closed_at: Some(Utc::now()),
        });
        closed.truncate(RESERVATION_HISTORY);
        Ok(())
    }
}

#[async_trait]
impl ExposureStore for MemoryExposureStore {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &ExposureKey) -> Result<ExposureState, CreditError> {
        Ok(self
            .states
            .get(key)
            .map(|state| state.clone())
            .unwrap_or_else(|| ExposureState::initial(key.clone())))
    }

    async fn compare_and_swap(
        &self,
        expected: &ExposureState,
        exposure_minor: u64,
        change: ReservationChange<'_>,
    ) -> Result<ExposureState, CreditError> {
        let mut state = self
            .states
            .entry(expected.key.clone())
            .or_insert_with(|| ExposureState::initial(expected.key.clone()));
        if state.version != expected.version {
            return Err(CreditError::ConcurrencyConflict {
                key: expected.key.to_string(),
                expected: expected.version,
            });
        }
        match change {
            ReservationChange::Open(handle) => {
                self.outstanding
                    .insert(handle.reservation_id.clone(), handle.clone());
            }
            ReservationChange::Close {
                reservation_id,
                status,
            } => self.close(reservation_id, status)?,
        }
        state.current_exposure_minor = exposure_minor;
        state.version += 1;
        Ok(state.clone())
    }

    async fn commit_reservation(&self, reservation_id: &str) -> Result<(), CreditError> {
        self.close(reservation_id, ReservationStatus::Committed)
    }

    async fn outstanding_reservations(&self) -> Result<Vec<ReservationHandle>, CreditError> {
        let mut handles: Vec<ReservationHandle> = self
            .outstanding
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        Ok(handles)
    }

    async fn reservations(
        &self,
        key: &ExposureKey,
        history: usize,
    ) -> Result<Vec<ReservationRecord>, CreditError> {
        let mut records: Vec<ReservationRecord> = self
            .outstanding_reservations()
            .await?
            .into_iter()
            .filter(|handle| &handle.key == key)
            .map(|handle| ReservationRecord {
                handle,
                status: ReservationStatus::Outstanding,
                closed_at: None,
            })
            .collect();
        if let Some(closed) = self.closed.get(key) {
            records.extend(closed.iter().take(history).cloned());
        }
        Ok(records)
    }
}

/// Limits the ledger enforces on every reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureLimits {
    pub credit_limit_minor: u64,
    pub max_exposure_minor: u64,
}

impl ExposureLimits {
    pub fn new(credential: &CreditCredential, policy: &CreditPolicy) -> Self {
        Self {
            credit_limit_minor: credential.credit_limit_minor,
            max_exposure_minor: policy.max_exposure_minor,
        }
    }

    pub fn ceiling_minor(&self) -> u64 {
        self.credit_limit_minor.min(self.max_exposure_minor)
    }

    /// Headroom and cap inequalities, checked in that order.
    fn admit(&self, current_minor: u64, amount_minor: u64) -> Result<u64, String> {
        let headroom = self.credit_limit_minor.saturating_sub(current_minor);
        if amount_minor > headroom {
            return Err(format!(
                "amount {amount_minor} exceeds credit headroom {headroom}"
            ));
        }
        let next = current_minor.saturating_add(amount_minor);
        if next > self.max_exposure_minor {
            return Err(format!(
                "exposure {next} would exceed cap {}",
                self.max_exposure_minor
            ));
        }
        Ok(next)
    }
}

/// Outstanding reservation. Consumed by exactly one commit or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHandle {
    pub reservation_id: String,
    pub key: ExposureKey,
    pub request_id: String,
    pub amount_minor: u64,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Outstanding,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CreditError> {
        match value {
            "outstanding" => Ok(Self::Outstanding),
            "committed" => Ok(Self::Committed),
            "released" => Ok(Self::Released),
            other => Err(CreditError::Storage(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub handle: ReservationHandle,
    pub status: ReservationStatus,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Result of an evaluated reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatedReservation {
    Reserved {
        decision: CreditDecision,
        handle: ReservationHandle,
        snapshot: ExposureState,
    },
    Declined {
        decision: CreditDecision,
        snapshot: ExposureState,
    },
}

impl EvaluatedReservation {
    pub fn decision(&self) -> &CreditDecision {
        match self {
            Self::Reserved { decision, .. } | Self::Declined { decision, .. } => decision,
        }
    }
}

pub struct ExposureLedger {
    store: Arc<dyn ExposureStore>,
    locks: DashMap<ExposureKey, Arc<Mutex<()>>>,
    outstanding: DashMap<String, ReservationHandle>,
    max_cas_retries: u32,
}

impl Default for ExposureLedger {
    fn default() -> Self {
        Self::new(Arc::new(MemoryExposureStore::new()))
    }
}

impl ExposureLedger {
    /// Ledger over a store with no reservations left open.
    pub fn new(store: Arc<dyn ExposureStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            outstanding: DashMap::new(),
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    /// Ledger over a store that may hold reservations from an earlier process. They become
    /// outstanding here and must be committed or released.
    pub async fn open(store: Arc<dyn ExposureStore>) -> Result<Self, CreditError> {
        let ledger = Self::new(store);
        let restored = ledger.store.outstanding_reservations().await?;
        if !restored.is_empty() {
            warn!(
                store = ledger.store.label(),
                reservations = restored.len(),
                "outstanding reservations restored"
            );
        }
        for handle in restored {
            ledger
                .outstanding
                .insert(handle.reservation_id.clone(), handle);
        }
        Ok(ledger)
    }

    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries;
        self
    }

    pub fn store_label(&self) -> &'static str {
        self.store.label()
    }

    fn key_lock(&self, key: &ExposureKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a key's lock slot once nothing else references it.
    fn prune_lock(&self, key: &ExposureKey) {
        if let Entry::Occupied(slot) = self.locks.entry(key.clone()) {
            if Arc::strong_count(slot.get()) == 1 {
                slot.remove();
            }
        }
    }

    /// Advisory read; may be stale by the time the caller acts on it.
    pub async fn snapshot(&self, key: &ExposureKey) -> Result<ExposureState, CreditError> {
        self.store.load(key).await
    }

    pub async fn reserve(
        &self,
        key: &ExposureKey,
        request_id: &str,
        amount_minor: u64,
        limits: ExposureLimits,
    ) -> Result<ReservationHandle, CreditError> {
        let result = {
            let lock = self.key_lock(key);
            let _guard = lock.lock().await;
            self.reserve_locked(key, request_id, amount_minor, limits)
                .await
        };
        self.prune_lock(key);
        result
    }

    /// Evaluate against a fresh snapshot and reserve the approved amount under one lock hold.
    ///
    /// A declining verdict leaves the ledger untouched. An approving verdict still goes through
    /// the authoritative headroom and cap check.
    pub async fn reserve_evaluated<F>(
        &self,
        key: &ExposureKey,
        request_id: &str,
        limits: ExposureLimits,
        evaluate: F,
    ) -> Result<EvaluatedReservation, CreditError>
    where
        F: FnOnce(&ExposureState) -> CreditDecision + Send,
    {
        let result = {
            let lock = self.key_lock(key);
            let _guard = lock.lock().await;
            self.evaluate_locked(key, request_id, limits, evaluate)
                .await
        };
        self.prune_lock(key);
        result
    }

    async fn evaluate_locked<F>(
        &self,
        key: &ExposureKey,
        request_id: &str,
        limits: ExposureLimits,
        evaluate: F,
    ) -> Result<EvaluatedReservation, CreditError>
    where
        F: FnOnce(&ExposureState) -> CreditDecision + Send,
    {
        let snapshot = self.store.load(key).await?;
        let decision = evaluate(&snapshot);
        let Some(amount_minor) = decision.approved_amount_minor() else {
            debug!(key = %key, request_id, reason = ?decision.reason(), "evaluation declined");
            return Ok(EvaluatedReservation::Declined { decision, snapshot });
        };

        let handle = self
            .reserve_locked(key, request_id, amount_minor, limits)
            .await?;
        Ok(EvaluatedReservation::Reserved {
            decision,
            handle,
            snapshot,
        })
    }

    async fn reserve_locked(
        &self,
        key: &ExposureKey,
        request_id: &str,
        amount_minor: u64,
        limits: ExposureLimits,
    ) -> Result<ReservationHandle, CreditError> {
        if amount_minor == 0 {
            return Err(CreditError::validation("reservation amount must be positive"));
        }

        let handle = ReservationHandle {
            reservation_id: Uuid::new_v4().to_string(),
            key: key.clone(),
            request_id: request_id.to_string(),
            amount_minor,
            reserved_at: Utc::now(),
        };
        for attempt in 0..=self.max_cas_retries {
            let state = self.store.load(key).await?;
            let next = limits
                .admit(state.current_exposure_minor, amount_minor)
                .map_err(CreditError::ExposureExceeded)?;

            match self
                .store
                .compare_and_swap(&state, next, ReservationChange::Open(&handle))
                .await
            {
                Ok(updated) => {
                    self.outstanding
                        .insert(handle.reservation_id.clone(), handle.clone());
                    info!(
                        key = %key,
                        request_id,
                        amount_minor,
                        exposure_minor = updated.current_exposure_minor,
                        version = updated.version,
                        "exposure reserved"
                    );
                    return Ok(handle);
                }
                Err(CreditError::ConcurrencyConflict { expected, .. }) => {
                    warn!(key = %key, attempt, expected, "exposure version conflict; retrying");
                }
                Err(other) => return Err(other),
            }
        }

        Err(CreditError::ExposureExceeded(format!(
            "reservation on {key} abandoned after {} version conflicts",
            self.max_cas_retries + 1
        )))
    }

    /// Finalize a reservation after successful settlement. Exposure is unchanged.
    pub async fn commit(&self, handle: &ReservationHandle) -> Result<(), CreditError> {
        let result = {
            let lock = self.key_lock(&handle.key);
            let _guard = lock.lock().await;
            self.commit_locked(handle).await
        };
        self.prune_lock(&handle.key);
        result
    }

    async fn commit_locked(&self, handle: &ReservationHandle) -> Result<(), CreditError> {
        if !self.outstanding.contains_key(&handle.reservation_id) {
            return Err(not_outstanding(handle));
        }
        self.store
            .commit_reservation(&handle.reservation_id)
            .await?;
        self.take_outstanding(handle)?;
        info!(
            key = %handle.key,
            request_id = %handle.request_id,
            amount_minor = handle.amount_minor,
            "reservation committed"
        );
        Ok(())
    }

    /// Reverse the reservation's increment.
    pub async fn release(&self, handle: &ReservationHandle) -> Result<(), CreditError> {
        let result = {
            let lock = self.key_lock(&handle.key);
            let _guard = lock.lock().await;
            self.release_locked(handle).await
        };
        self.prune_lock(&handle.key);
        result
    }

    async fn release_locked(&self, handle: &ReservationHandle) -> Result<(), CreditError> {
        if !self.outstanding.contains_key(&handle.reservation_id) {
            return Err(not_outstanding(handle));
        }

        let change = ReservationChange::Close {
            reservation_id: &handle.reservation_id,
            status: ReservationStatus::Released,
        };
        let mut conflicts = 0;
        loop {
            let state = self.store.load(&handle.key).await?;
            let next = state
                .current_exposure_minor
                .checked_sub(handle.amount_minor)
                .ok_or_else(|| {
                    CreditError::InvariantViolation(format!(
                        "release of {} on {} would drive exposure {} negative",
                        handle.amount_minor, handle.key, state.current_exposure_minor
                    ))
                })?;

            match self.store.compare_and_swap(&state, next, change).await {
                Ok(updated) => {
                    info!(
                        key = %handle.key,
                        request_id = %handle.request_id,
                        amount_minor = handle.amount_minor,
                        exposure_minor = updated.current_exposure_minor,
                        "reservation released"
                    );
                    break;
                }
                Err(err @ CreditError::ConcurrencyConflict { .. }) => {
                    conflicts += 1;
                    if conflicts > self.max_cas_retries {
                        return Err(err);
                    }
                    warn!(key = %handle.key, conflicts, "exposure version conflict on release");
                }
                Err(other) => return Err(other),
            }
        }

        self.take_outstanding(handle)
    }

    fn take_outstanding(&self, handle: &ReservationHandle) -> Result<(), CreditError> {
        self.outstanding
            .remove(&handle.reservation_id)
            .map(|_| ())
            .ok_or_else(|| not_outstanding(handle))
    }

    /// Outstanding reservations for `key`, then the most recently closed ones.
    pub async fn reservations(
        &self,
        key: &ExposureKey,
    ) -> Result<Vec<ReservationRecord>, CreditError> {
        self.store.reservations(key, RESERVATION_HISTORY).await
    }

    pub fn is_outstanding(&self, handle: &ReservationHandle) -> bool {
        self.outstanding.contains_key(&handle.reservation_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Outstanding handles, oldest first.
    pub fn outstanding_handles(&self) -> Vec<ReservationHandle> {
        let mut handles: Vec<ReservationHandle> = self
            .outstanding
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        handles.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        handles
    }
}

fn not_outstanding(handle: &ReservationHandle) -> CreditError {
    CreditError::InvariantViolation(format!(
        "reservation {} for request {} is not outstanding",
        handle.reservation_id, handle.request_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> ExposureKey {
        ExposureKey::new("biz-1", "bank-a")
    }

    fn limits() -> ExposureLimits {
        ExposureLimits {
            credit_limit_minor: 1_000,
            max_exposure_minor: 800,
        }
    }

    #[tokio::test]
    async fn reserve_rechecks_headroom_and_cap() {
        let ledger = ExposureLedger::default();
        let first = ledger.reserve(&key(), "req-1", 500, limits()).await.unwrap();
        assert_eq!(first.amount_minor, 500);

        let err = ledger
            .reserve(&key(), "req-2", 500, limits())
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::ExposureExceeded(_)));
        assert_eq!(
            ledger.snapshot(&key()).await.unwrap().current_exposure_minor,
            500
        );
    }

    #[tokio::test]
    async fn release_restores_capacity_once() {
        let ledger = ExposureLedger::default();
        let handle = ledger.reserve(&key(), "req-1", 300, limits()).await.unwrap();
        ledger.release(&handle).await.unwrap();

        let state = ledger.snapshot(&key()).await.unwrap();
        assert_eq!(state.current_exposure_minor, 0);
        assert_eq!(state.version, 2);

        let err = ledger.release(&handle).await.unwrap_err();
        assert!(matches!(err, CreditError::InvariantViolation(_)));
        assert!(ledger.commit(&handle).await.is_err());
    }

    #[tokio::test]
    async fn commit_archives_without_changing_exposure() {
        let ledger = ExposureLedger::default();
        let handle = ledger.reserve(&key(), "req-1", 300, limits()).await.unwrap();
        ledger.commit(&handle).await.unwrap();

        assert_eq!(
            ledger.snapshot(&key()).await.unwrap().current_exposure_minor,
            300
        );
        let records = ledger.reservations(&key()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ReservationStatus::Committed);
        assert_eq!(ledger.outstanding_count(), 0);
        assert!(ledger.locks.is_empty());
    }

    #[tokio::test]
    async fn reopened_ledger_settles_what_it_left_open() {
        let store = Arc::new(MemoryExposureStore::new());
        let first = ExposureLedger::new(store.clone());
        let abandoned = first.reserve(&key(), "req-1", 500, limits()).await.unwrap();
        let settled = first.reserve(&key(), "req-2", 100, limits()).await.unwrap();
        first.commit(&settled).await.unwrap();
        drop(first);

        let reopened = ExposureLedger::open(store.clone()).await.unwrap();
        assert_eq!(reopened.outstanding_handles(), vec![abandoned.clone()]);
        assert!(matches!(
            reopened.reserve(&key(), "req-3", 400, limits()).await,
            Err(CreditError::ExposureExceeded(_))
        ));

        reopened.release(&abandoned).await.unwrap();
        assert_eq!(
            reopened.snapshot(&key()).await.unwrap().current_exposure_minor,
            100
        );
        reopened.reserve(&key(), "req-3", 400, limits()).await.unwrap();

        let statuses: Vec<ReservationStatus> = reopened
            .reservations(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                ReservationStatus::Outstanding,
                ReservationStatus::Released,
                ReservationStatus::Committed,
            ]
        );
    }

    #[tokio::test]
    async fn closed_history_is_bounded() {
        let ledger = ExposureLedger::default();
        for i in 0..RESERVATION_HISTORY + 10 {
            let handle = ledger
                .reserve(&key(), &format!("req-{i}"), 1, limits())
                .await
                .unwrap();
            ledger.release(&handle).await.unwrap();
        }
        let records = ledger.reservations(&key()).await.unwrap();
        assert_eq!(records.len(), RESERVATION_HISTORY);
        assert_eq!(
            records[0].handle.request_id,
            format!("req-{}", RESERVATION_HISTORY + 9)
        );
    }

    #[tokio::test]
    async fn declined_evaluation_leaves_ledger_untouched() {
        let ledger = ExposureLedger::default();
        let outcome = ledger
            .reserve_evaluated(&key(), "req-1", limits(), |_| {
                CreditDecision::reject(crate::types::ReasonCode::Duration)
            })
            .await
            .unwrap();
        assert!(matches!(outcome, EvaluatedReservation::Declined { .. }));
        assert_eq!(ledger.snapshot(&key()).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_ceiling() {
        let ledger = Arc::new(ExposureLedger::default());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .reserve(&key(), &format!("req-{i}"), 100, limits())
                    .await
                    .is_ok()
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 8);
        assert_eq!(
            ledger.snapshot(&key()).await.unwrap().current_exposure_minor,
            800
        );
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let ledger = ExposureLedger::default();
        let other = ExposureKey::new("biz-2", "bank-a");
        ledger.reserve(&key(), "req-1", 800, limits()).await.unwrap();
        ledger.reserve(&other, "req-2", 800, limits()).await.unwrap();
        assert!(ledger.locks.is_empty());
        assert_eq!(
            ledger.snapshot(&other).await.unwrap().current_exposure_minor,
            800
        );
    }

    /// Store that loses the version race a fixed number of times.
    struct ContendedStore {
        inner: MemoryExposureStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl ExposureStore for ContendedStore {
        fn label(&self) -> &'static str {
            "contended"
        }

        async fn load(&self, key: &ExposureKey) -> Result<ExposureState, CreditError> {
            self.inner.load(key).await
        }

        async fn compare_and_swap(
            &self,
            expected: &ExposureState,
            exposure_minor: u64,
            change: ReservationChange<'_>,
        ) -> Result<ExposureState, CreditError> {
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CreditError::ConcurrencyConflict {
                    key: expected.key.to_string(),
                    expected: expected.version,
                });
            }
            self.inner
                .compare_and_swap(expected, exposure_minor, change)
                .await
        }

        async fn commit_reservation(&self, reservation_id: &str) -> Result<(), CreditError> {
            self.inner.commit_reservation(reservation_id).await
        }

        async fn outstanding_reservations(&self) -> Result<Vec<ReservationHandle>, CreditError> {
            self.inner.outstanding_reservations().await
        }

        async fn reservations(
            &self,
            key: &ExposureKey,
            history: usize,
        ) -> Result<Vec<ReservationRecord>, CreditError> {
            self.inner.reservations(key, history).await
        }
    }

    #[tokio::test]
    async fn conflicts_are_retried_then_surface_as_exposure_exceeded() {
        let store = Arc::new(ContendedStore {
            inner: MemoryExposureStore::new(),
            conflicts_left: AtomicU32::new(2),
        });
        let ledger = ExposureLedger::new(store.clone()).with_max_cas_retries(3);
        assert!(ledger.reserve(&key(), "req-1", 100, limits()).await.is_ok());

        store.conflicts_left.store(10, Ordering::SeqCst);
        let err = ledger
            .reserve(&key(), "req-2", 100, limits())
            .await
            .unwrap_err();
        assert!(matches!(err, CreditError::ExposureExceeded(_)));
        assert_eq!(
            ledger.snapshot(&key()).await.unwrap().current_exposure_minor,
            100
        );
        assert_eq!(store.outstanding_reservations().await.unwrap().len(), 1);
    }
}
