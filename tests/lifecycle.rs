mod common;

use common::*;
use diesel::sqlite::SqliteConnection;
use planhub_billing::error::AppError;
use planhub_billing::model::Purchase;
use planhub_billing::reconcile::{self, ReconcileOutcome};
use planhub_billing::store;
use planhub_billing::types::{
    Evidence, EvidenceOutcome, EvidenceSource, PaymentGateway, PurchaseStatus,
};
use proptest::prelude::*;

fn seed_pending(
    conn: &mut SqliteConnection,
    user: &str,
    plan_id: &str,
    gateway: PaymentGateway,
) -> Purchase {
    let plan = test_plans().into_iter().find(|p| p.id == plan_id).unwrap();
    let purchase = Purchase::new_draft(user.to_string(), &plan, gateway, false).unwrap();
    store::insert(conn, &purchase).unwrap();
    store::mark_pending_payment(conn, &purchase.id, None).unwrap();
    store::find(conn, &purchase.id).unwrap().unwrap()
}

fn success_evidence(purchase_id: &str, transaction_id: &str, amount: Option<i64>) -> Evidence {
    Evidence {
        purchase_id: purchase_id.to_string(),
        transaction_id: Some(transaction_id.to_string()),
        outcome: EvidenceOutcome::Success,
        amount_cents: amount,
        reason: None,
    }
}

fn failure_evidence(purchase_id: &str, transaction_id: Option<&str>, reason: &str) -> Evidence {
    Evidence {
        purchase_id: purchase_id.to_string(),
        transaction_id: transaction_id.map(|s| s.to_string()),
        outcome: EvidenceOutcome::Failure,
        amount_cents: None,
        reason: Some(reason.to_string()),
    }
}

#[test]
fn duplicate_success_evidence_activates_exactly_once() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u1", "pro-monthly", PaymentGateway::Stripe);

    let evidence = success_evidence(&purchase.id, "tx_1", Some(1999));

    let first =
        reconcile::apply_evidence(&mut conn, &evidence, &EvidenceSource::Client).unwrap();
    assert!(matches!(first, ReconcileOutcome::Applied(_)));
    let settled = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(settled.status, PurchaseStatus::Active);
    let (amount, expiry) = (settled.amount_paid, settled.expiry_date);

    // Client retry plus the later gateway callback for the same
    // authorization: both no-ops.
    let second =
        reconcile::apply_evidence(&mut conn, &evidence, &EvidenceSource::Client).unwrap();
    assert!(matches!(second, ReconcileOutcome::AlreadyApplied(_)));
    let third =
        reconcile::apply_evidence(&mut conn, &evidence, &EvidenceSource::GatewayCallback).unwrap();
    assert!(matches!(third, ReconcileOutcome::AlreadyApplied(_)));

    let after = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(after.amount_paid, amount);
    assert_eq!(after.expiry_date, expiry);

    // The snapshot still carries the original commercial terms.
    assert_eq!(after.snapshot().unwrap().price_cents, 1999);
}

#[test]
fn callback_failure_demotes_optimistic_activation() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u2", "pro-monthly", PaymentGateway::Stripe);

    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_2", None),
        &EvidenceSource::Client,
    )
    .unwrap();

    let outcome = reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&purchase.id, Some("tx_2"), "card declined"),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied(_)));

    let after = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::Failed);
    assert_eq!(after.failure_reason.as_deref(), Some("card declined"));
    assert!(after.failure_at.is_some());
}

#[test]
fn client_failure_cannot_demote_settled_purchase() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u3", "pro-monthly", PaymentGateway::Stripe);

    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_3", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    let outcome = reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&purchase.id, Some("tx_3"), "client says no"),
        &EvidenceSource::Client,
    )
    .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied(_)));

    let after = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::Active);
}

#[test]
fn conflicting_transaction_is_surfaced_not_applied() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u4", "pro-monthly", PaymentGateway::Stripe);

    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_4", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    let result = reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_other", None),
        &EvidenceSource::GatewayCallback,
    );
    assert!(matches!(result, Err(AppError::ConflictingTransition(_))));

    let after = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::Active);
    assert_eq!(after.transaction_id.as_deref(), Some("tx_4"));
}

#[test]
fn transaction_id_activates_at_most_one_purchase() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();

    let first = seed_pending(&mut conn, "u5", "pro-monthly", PaymentGateway::Stripe);
    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&first.id, "tx_replayed", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    // A replayed gateway event lands on a different user's pending record.
    let second = seed_pending(&mut conn, "u6", "pro-monthly", PaymentGateway::Stripe);
    let result = reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&second.id, "tx_replayed", None),
        &EvidenceSource::GatewayCallback,
    );
    assert!(matches!(result, Err(AppError::ConflictingTransition(_))));

    let after = store::find(&mut conn, &second.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::PendingPayment);
}

#[test]
fn successful_switch_retires_old_record_atomically() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let user = "u-switch";

    let old = seed_pending(&mut conn, user, "pro-monthly", PaymentGateway::Bank);
    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&old.id, "tx_old", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    store::claim_switch(&mut conn, &old.id, "team-monthly").unwrap();
    let new = seed_pending(&mut conn, user, "team-monthly", PaymentGateway::Bank);

    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&new.id, "tx_new", Some(4999)),
        &EvidenceSource::AdminOverride {
            actor: "ops@example.com".to_string(),
        },
    )
    .unwrap();

    let old_after = store::find(&mut conn, &old.id).unwrap().unwrap();
    let new_after = store::find(&mut conn, &new.id).unwrap().unwrap();
    assert_eq!(old_after.status, PurchaseStatus::Switched);
    assert!(!old_after.switch_pending);
    assert_eq!(new_after.status, PurchaseStatus::Active);

    // Exactly one active purchase for the feature.
    assert_eq!(
        store::active_for_feature(&mut conn, user, "api-access")
            .unwrap()
            .unwrap()
            .id,
        new_after.id
    );
}

#[test]
fn failed_switch_leaves_original_untouched() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let user = "u-switch-fail";

    let old = seed_pending(&mut conn, user, "pro-monthly", PaymentGateway::Bank);
    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&old.id, "tx_keep", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    store::claim_switch(&mut conn, &old.id, "team-monthly").unwrap();
    let new = seed_pending(&mut conn, user, "team-monthly", PaymentGateway::Bank);

    reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&new.id, None, "transfer never arrived"),
        &EvidenceSource::AdminOverride {
            actor: "ops@example.com".to_string(),
        },
    )
    .unwrap();

    let old_after = store::find(&mut conn, &old.id).unwrap().unwrap();
    let new_after = store::find(&mut conn, &new.id).unwrap().unwrap();
    assert_eq!(old_after.status, PurchaseStatus::Active);
    // The claim is released so the user can try again.
    assert!(!old_after.switch_pending);
    assert!(old_after.pending_switch_plan_id.is_none());
    assert_eq!(new_after.status, PurchaseStatus::Failed);
}

#[test]
fn draft_purchases_reject_evidence() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();

    let plan = test_plans()
        .into_iter()
        .find(|p| p.id == "pro-monthly")
        .unwrap();
    let draft =
        Purchase::new_draft("u-draft".to_string(), &plan, PaymentGateway::Stripe, false).unwrap();
    store::insert(&mut conn, &draft).unwrap();

    let result = reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&draft.id, "tx_d", None),
        &EvidenceSource::GatewayCallback,
    );
    assert!(matches!(result, Err(AppError::ConflictingTransition(_))));

    let after = store::find(&mut conn, &draft.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::Draft);
}

#[test]
fn settled_purchase_is_never_resurrected() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u7", "pro-monthly", PaymentGateway::Stripe);

    reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&purchase.id, Some("tx_7"), "declined"),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    // Even an administrator cannot turn failed back into active.
    let result = reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_7b", None),
        &EvidenceSource::AdminOverride {
            actor: "ops@example.com".to_string(),
        },
    );
    assert!(matches!(result, Err(AppError::ConflictingTransition(_))));

    // Re-delivered failure evidence stays a quiet no-op.
    let outcome = reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&purchase.id, Some("tx_7"), "declined"),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();
    assert!(matches!(outcome, ReconcileOutcome::AlreadyApplied(_)));
}

#[test]
fn admin_failure_cancels_active_purchase() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let purchase = seed_pending(&mut conn, "u8", "pro-monthly", PaymentGateway::Bank);

    reconcile::apply_evidence(
        &mut conn,
        &success_evidence(&purchase.id, "tx_8", None),
        &EvidenceSource::GatewayCallback,
    )
    .unwrap();

    reconcile::apply_evidence(
        &mut conn,
        &failure_evidence(&purchase.id, None, "chargeback"),
        &EvidenceSource::AdminOverride {
            actor: "ops@example.com".to_string(),
        },
    )
    .unwrap();

    let after = store::find(&mut conn, &purchase.id).unwrap().unwrap();
    assert_eq!(after.status, PurchaseStatus::Cancelled);
}

#[test]
fn expiry_sweep_only_touches_overdue_purchases() {
    let fixture = TestApp::new();
    let mut conn = fixture.conn();
    let now = chrono::Utc::now().naive_utc();

    let overdue = seed_pending(&mut conn, "u9", "pro-monthly", PaymentGateway::Bank);
    store::activate(
        &mut conn,
        &overdue.id,
        "tx_overdue",
        1999,
        Some(now - chrono::Duration::days(1)),
    )
    .unwrap();

    let current = seed_pending(&mut conn, "u10", "pro-monthly", PaymentGateway::Bank);
    store::activate(
        &mut conn,
        &current.id,
        "tx_current",
        1999,
        Some(now + chrono::Duration::days(29)),
    )
    .unwrap();

    let swept = store::expire_overdue(&mut conn, now).unwrap();
    assert_eq!(swept, 1);

    let overdue_after = store::find(&mut conn, &overdue.id).unwrap().unwrap();
    let current_after = store::find(&mut conn, &current.id).unwrap().unwrap();
    assert_eq!(overdue_after.status, PurchaseStatus::Expired);
    assert_eq!(current_after.status, PurchaseStatus::Active);
}

// Random event sequences: whatever arrives in whatever order, the status
// only ever moves along allowed edges.

#[derive(Debug, Clone)]
enum Event {
    ClientSuccess(u8),
    ClientFailure(u8),
    CallbackSuccess(u8),
    CallbackFailure(u8),
    AdminSuccess,
    AdminFailure,
    Cancel,
    Expire,
}

fn event_strategy() -> impl Strategy<Value = Event> {
    prop_oneof![
        (0u8..2).prop_map(Event::ClientSuccess),
        (0u8..2).prop_map(Event::ClientFailure),
        (0u8..2).prop_map(Event::CallbackSuccess),
        (0u8..2).prop_map(Event::CallbackFailure),
        Just(Event::AdminSuccess),
        Just(Event::AdminFailure),
        Just(Event::Cancel),
        Just(Event::Expire),
    ]
}

fn tx_name(index: u8) -> String {
    format!("tx_{}", index)
}

fn apply_event(conn: &mut SqliteConnection, purchase_id: &str, event: &Event) {
    let admin = EvidenceSource::AdminOverride {
        actor: "prop@example.com".to_string(),
    };
    let result = match event {
        Event::ClientSuccess(tx) => reconcile::apply_evidence(
            conn,
            &success_evidence(purchase_id, &tx_name(*tx), None),
            &EvidenceSource::Client,
        ),
        Event::ClientFailure(tx) => reconcile::apply_evidence(
            conn,
            &failure_evidence(purchase_id, Some(&tx_name(*tx)), "client failure"),
            &EvidenceSource::Client,
        ),
        Event::CallbackSuccess(tx) => reconcile::apply_evidence(
            conn,
            &success_evidence(purchase_id, &tx_name(*tx), Some(1999)),
            &EvidenceSource::GatewayCallback,
        ),
        Event::CallbackFailure(tx) => reconcile::apply_evidence(
            conn,
            &failure_evidence(purchase_id, Some(&tx_name(*tx)), "callback failure"),
            &EvidenceSource::GatewayCallback,
        ),
        Event::AdminSuccess => reconcile::apply_evidence(
            conn,
            &success_evidence(purchase_id, "tx_admin", None),
            &admin,
        ),
        Event::AdminFailure => reconcile::apply_evidence(
            conn,
            &failure_evidence(purchase_id, None, "admin failure"),
            &admin,
        ),
        Event::Cancel => {
            let _ = store::cancel(conn, purchase_id);
            return;
        }
        Event::Expire => {
            let _ = store::expire_overdue(
                conn,
                chrono::Utc::now().naive_utc() + chrono::Duration::days(365),
            );
            return;
        }
    };
    // Rejected evidence is fine; the property is about what rejections and
    // applications do to the status.
    let _ = result;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_event_sequences_respect_state_machine_edges(
        events in proptest::collection::vec(event_strategy(), 1..12)
    ) {
        let fixture = TestApp::new();
        let mut conn = fixture.conn();
        let purchase = seed_pending(&mut conn, "u-prop", "pro-monthly", PaymentGateway::Stripe);

        let mut history = vec![purchase.status];
        for event in &events {
            apply_event(&mut conn, &purchase.id, event);
            let current = store::find(&mut conn, &purchase.id).unwrap().unwrap().status;
            history.push(current);
        }

        for pair in history.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            prop_assert!(
                from == to || from.can_transition_to(to),
                "disallowed transition {:?} -> {:?} via {:?}",
                from,
                to,
                events
            );
        }
    }
}
