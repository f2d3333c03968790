use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tglc_core::{
    CreditCredential, CreditPolicy, Ed25519TrustAnchor, ExposureKey, ExposureLedger,
    ExposureLimits, ExposureState, LiquidityRequest, PolicyEvaluator, ProofPayload, ProofSource,
    ProofVerifier, ReservationHandle,
};

// ---------------------------------------------------------------------------
// Helpers / Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum LedgerOp {
    Reserve(u64),
    Commit(usize),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (1u64..600).prop_map(LedgerOp::Reserve),
        any::<usize>().prop_map(LedgerOp::Commit),
        any::<usize>().prop_map(LedgerOp::Release),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn fixed_now() -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000, 0).unwrap()
}

fn credential(limit_minor: u64) -> CreditCredential {
    CreditCredential {
        issuer: "bank-1".to_string(),
        business_id: "biz-1".to_string(),
        credit_limit_minor: limit_minor,
        corridors: BTreeSet::from(["SGD-USDC".parse().unwrap()]),
        expires_at: fixed_now() + Duration::days(30),
    }
}

fn policy(max_exposure_minor: u64, max_default_rate: f64) -> CreditPolicy {
    CreditPolicy {
        bank_id: "bank-1".to_string(),
        max_duration_days: 30,
        max_default_rate,
        max_exposure_minor,
        proof_required_above_minor: Some(5_000),
    }
}

fn internal_proof(default_rate: f64) -> ProofPayload {
    ProofPayload::new(
        BTreeMap::from([("default_rate".to_string(), default_rate)]),
        fixed_now() - Duration::minutes(1),
        ProofSource::Internal,
    )
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// No interleaving of reserve, commit and release lets exposure pass either limit, and
    /// exposure always equals the sum of live reservations.
    #[test]
    fn exposure_never_exceeds_limits(
        limit in 100u64..2_000,
        cap in 100u64..2_000,
        ops in prop::collection::vec(arb_op(), 1..60),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let ledger = ExposureLedger::default();
            let key = ExposureKey::new("biz-1", "bank-1");
            let limits = ExposureLimits { credit_limit_minor: limit, max_exposure_minor: cap };
            let mut outstanding: Vec<ReservationHandle> = Vec::new();
            let mut committed = 0u64;

            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    LedgerOp::Reserve(amount) => {
                        if let Ok(handle) = ledger.reserve(&key, &format!("req-{n}"), amount, limits).await {
                            outstanding.push(handle);
                        }
                    }
                    LedgerOp::Commit(pick) if !outstanding.is_empty() => {
                        let handle = outstanding.remove(pick % outstanding.len());
                        ledger.commit(&handle).await.unwrap();
                        committed += handle.amount_minor;
                        prop_assert!(ledger.commit(&handle).await.is_err());
                    }
                    LedgerOp::Release(pick) if !outstanding.is_empty() => {
                        let handle = outstanding.remove(pick % outstanding.len());
                        ledger.release(&handle).await.unwrap();
                        prop_assert!(ledger.release(&handle).await.is_err());
                    }
                    _ => {}
                }

                let state = ledger.snapshot(&key).await.unwrap();
                let live: u64 = outstanding.iter().map(|h| h.amount_minor).sum();
                prop_assert!(state.current_exposure_minor <= limits.ceiling_minor());
                prop_assert_eq!(state.current_exposure_minor, live + committed);
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Evaluation is a pure function of its inputs, and approvals never shrink the amount or
    /// break either limit.
    #[test]
    fn evaluation_is_deterministic(
        amount in 1u64..10_000,
        current in 0u64..3_000,
        limit in 1u64..5_000,
        cap in 1u64..5_000,
        default_rate in 0.0f64..1.0,
        with_proof in any::<bool>(),
        days in prop::option::of(1u32..90),
    ) {
        let rt = runtime();
        let verifier = ProofVerifier::new(Arc::new(Ed25519TrustAnchor::new()));
        let proof = if with_proof {
            Some(rt.block_on(verifier.verify(&internal_proof(default_rate), fixed_now())).unwrap())
        } else {
            None
        };

        let mut request = LiquidityRequest::new(
            "did:xrpl:1:rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            "biz-1",
            "bank-1",
            "rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe",
            "SGD-USDC".parse().unwrap(),
            amount,
        );
        request.requested_duration_days = days;
        let credential = credential(limit);
        let policy = policy(cap, 0.1);
        let snapshot = ExposureState {
            key: request.exposure_key(),
            current_exposure_minor: current,
            version: 3,
        };

        let evaluator = PolicyEvaluator::default();
        let first = evaluator.evaluate(&request, &credential, &policy, &snapshot, proof.as_ref(), fixed_now());
        let second = evaluator.evaluate(&request, &credential, &policy, &snapshot, proof.as_ref(), fixed_now());
        prop_assert_eq!(&first, &second);

        if first.approved() {
            prop_assert_eq!(first.approved_amount_minor(), Some(amount));
            prop_assert!(first.rate_bps().is_some());
            prop_assert!(first.reason().is_none());
            prop_assert!(current + amount <= limit);
            prop_assert!(current + amount <= cap);
        } else {
            prop_assert!(first.reason().unwrap().is_evaluator_code());
            prop_assert!(first.approved_amount_minor().is_none());
        }
    }

    /// Verification gives the same answer for the same proof and instant.
    #[test]
    fn verification_is_deterministic(default_rate in 0.0f64..=1.0) {
        let rt = runtime();
        let verifier = ProofVerifier::new(Arc::new(Ed25519TrustAnchor::new()));
        let proof = internal_proof(default_rate);
        let first = rt.block_on(verifier.verify(&proof, fixed_now())).unwrap();
        let second = rt.block_on(verifier.verify(&proof, fixed_now())).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.valid);
        prop_assert_eq!(first.confidence_score, tglc_core::confidence_for(default_rate));
    }
}
