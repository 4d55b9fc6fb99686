use crate::error::{AppError, AppResult};
use crate::model::Purchase;
use crate::store;
use crate::types::{Evidence, EvidenceOutcome, EvidenceSource, PurchaseStatus};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

/// What applying a piece of evidence did to the purchase.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// A transition happened; carries the purchase as it now stands.
    Applied(Purchase),
    /// The evidence was stale: its effect was already recorded. Not an
    /// error; at-most-once activation depends on this being a quiet no-op.
    AlreadyApplied(Purchase),
}

impl ReconcileOutcome {
    pub fn purchase(&self) -> &Purchase {
        match self {
            ReconcileOutcome::Applied(p) | ReconcileOutcome::AlreadyApplied(p) => p,
        }
    }
}

enum Attempt {
    Done(ReconcileOutcome),
    /// A compare-and-set guard did not match: somebody else moved the
    /// purchase between our read and our write. Re-read and re-decide.
    Lost,
}

/// Apply confirmation evidence to a purchase under the idempotency and
/// precedence rules. Safe to call concurrently from different requests for
/// the same transaction; the per-id CAS plus one re-read resolves races.
pub fn apply_evidence(
    conn: &mut SqliteConnection,
    evidence: &Evidence,
    source: &EvidenceSource,
) -> AppResult<ReconcileOutcome> {
    if let EvidenceSource::AdminOverride { actor } = source {
        tracing::info!(
            purchase_id = %evidence.purchase_id,
            actor = %actor,
            outcome = ?evidence.outcome,
            "administrator override received"
        );
    }

    // One re-read after a lost CAS; the second loss means the record is
    // being actively contended and the evidence no longer applies cleanly.
    for _ in 0..2 {
        let purchase = store::find(conn, &evidence.purchase_id)?
            .ok_or_else(|| AppError::PurchaseNotFound(evidence.purchase_id.clone()))?;

        match attempt_apply(conn, &purchase, evidence, source)? {
            Attempt::Done(outcome) => return Ok(outcome),
            Attempt::Lost => continue,
        }
    }

    Err(AppError::ConflictingTransition(format!(
        "purchase {} is changing concurrently; evidence not applied",
        evidence.purchase_id
    )))
}

fn attempt_apply(
    conn: &mut SqliteConnection,
    purchase: &Purchase,
    evidence: &Evidence,
    source: &EvidenceSource,
) -> AppResult<Attempt> {
    match purchase.status {
        PurchaseStatus::PendingPayment => match evidence.outcome {
            EvidenceOutcome::Success => activate_purchase(conn, purchase, evidence, source),
            EvidenceOutcome::Failure => {
                let reason = evidence
                    .reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string());
                let applied = conn.transaction::<bool, AppError, _>(|conn| {
                    if !store::mark_failed(conn, &purchase.id, &reason)? {
                        return Ok(false);
                    }
                    // A failed switch leaves the original purchase active
                    // and unaffected; drop its claim so a retry can pass the
                    // precondition again.
                    if let Some(old) = store::other_active_for_feature(
                        conn,
                        &purchase.user_id,
                        &purchase.feature_key,
                        &purchase.id,
                    )? {
                        if old.switch_pending
                            && old.pending_switch_plan_id.as_deref()
                                == Some(purchase.plan_id.as_str())
                        {
                            store::release_switch_claim(conn, &old.id)?;
                        }
                    }
                    Ok(true)
                })?;

                if applied {
                    tracing::info!(purchase_id = %purchase.id, %reason, "purchase failed");
                    reloaded(conn, &purchase.id)
                } else {
                    Ok(Attempt::Lost)
                }
            }
        },

        PurchaseStatus::Active => apply_to_active(conn, purchase, evidence, source),

        PurchaseStatus::Draft => {
            // The orchestrator owns draft; evidence for it means the
            // authorization step never completed.
            conflict(purchase, evidence, "purchase has not entered pending payment")
        }

        PurchaseStatus::Failed
        | PurchaseStatus::Cancelled
        | PurchaseStatus::Expired
        | PurchaseStatus::Switched => match evidence.outcome {
            // Re-delivered failure evidence against a settled record.
            EvidenceOutcome::Failure => Ok(Attempt::Done(ReconcileOutcome::AlreadyApplied(
                purchase.clone(),
            ))),
            // A settled purchase is never resurrected; surface for manual
            // reconciliation instead of guessing.
            EvidenceOutcome::Success => conflict(
                purchase,
                evidence,
                "success evidence against a settled purchase",
            ),
        },
    }
}

fn apply_to_active(
    conn: &mut SqliteConnection,
    purchase: &Purchase,
    evidence: &Evidence,
    source: &EvidenceSource,
) -> AppResult<Attempt> {
    let same_transaction = match (&evidence.transaction_id, &purchase.transaction_id) {
        (Some(incoming), Some(recorded)) => incoming == recorded,
        // Admin overrides without a transaction reference address the
        // purchase itself.
        (None, _) => true,
        (Some(_), None) => false,
    };

    match evidence.outcome {
        EvidenceOutcome::Success if same_transaction => {
            // Duplicate success (client retry, then the gateway callback for
            // the same authorization): at-most-once activation.
            Ok(Attempt::Done(ReconcileOutcome::AlreadyApplied(
                purchase.clone(),
            )))
        }
        EvidenceOutcome::Success => conflict(
            purchase,
            evidence,
            "purchase already active under a different transaction",
        ),
        EvidenceOutcome::Failure => match source {
            // The gateway is authoritative: demote the optimistic
            // client-sourced activation it disagrees with.
            EvidenceSource::GatewayCallback if same_transaction => {
                let reason = evidence
                    .reason
                    .clone()
                    .unwrap_or_else(|| "gateway reported failure after activation".to_string());
                let tx = evidence
                    .transaction_id
                    .as_deref()
                    .or(purchase.transaction_id.as_deref())
                    .unwrap_or_default();
                if store::demote_active_to_failed(conn, &purchase.id, tx, &reason)? {
                    tracing::warn!(
                        purchase_id = %purchase.id,
                        transaction_id = %tx,
                        "authoritative callback demoted an optimistic activation"
                    );
                    reloaded(conn, &purchase.id)
                } else {
                    Ok(Attempt::Lost)
                }
            }
            EvidenceSource::GatewayCallback => conflict(
                purchase,
                evidence,
                "failure callback for a transaction this purchase does not hold",
            ),
            // Corrective action on a live purchase.
            EvidenceSource::AdminOverride { actor } => {
                if store::cancel(conn, &purchase.id)? {
                    tracing::info!(
                        purchase_id = %purchase.id,
                        actor = %actor,
                        "administrator cancelled an active purchase"
                    );
                    reloaded(conn, &purchase.id)
                } else {
                    Ok(Attempt::Lost)
                }
            }
            // A client cannot demote what an authoritative source settled.
            EvidenceSource::Client => Ok(Attempt::Done(ReconcileOutcome::AlreadyApplied(
                purchase.clone(),
            ))),
        },
    }
}

/// pending_payment -> active, plus retiring whatever active record this one
/// supersedes, in one transaction. Switch finalization and renewal are the
/// same operation here: old record out, new record in.
fn activate_purchase(
    conn: &mut SqliteConnection,
    purchase: &Purchase,
    evidence: &Evidence,
    source: &EvidenceSource,
) -> AppResult<Attempt> {
    let snapshot = purchase.snapshot()?;

    let transaction_id = evidence
        .transaction_id
        .clone()
        .unwrap_or_else(|| format!("manual_{}", Uuid::new_v4()));
    // The settled amount comes from an authoritative source or the
    // snapshot; a client-reported figure is never trusted.
    let amount_cents = match source {
        EvidenceSource::Client => snapshot.price_cents,
        _ => evidence.amount_cents.unwrap_or(snapshot.price_cents),
    };

    conn.transaction::<Attempt, AppError, _>(|conn| {
        // A transaction id activates at most one purchase, ever. A replayed
        // gateway event against a different record is a conflict, not a
        // second activation.
        if let Some(holder) = store::find_by_transaction(conn, &transaction_id)? {
            if holder.id != purchase.id {
                return Err(AppError::ConflictingTransition(format!(
                    "transaction {} is already recorded on purchase {}",
                    transaction_id, holder.id
                )));
            }
        }

        let now = chrono::Utc::now().naive_utc();
        let expiry = snapshot.expiry_from(now);

        if !store::activate(conn, &purchase.id, &transaction_id, amount_cents, expiry)? {
            return Ok(Attempt::Lost);
        }

        if let Some(superseded) = store::other_active_for_feature(
            conn,
            &purchase.user_id,
            &purchase.feature_key,
            &purchase.id,
        )? {
            store::retire_to_switched(conn, &superseded.id)?;
            tracing::info!(
                purchase_id = %purchase.id,
                superseded_id = %superseded.id,
                feature_key = %purchase.feature_key,
                "activated purchase and retired the record it supersedes"
            );
        } else {
            tracing::info!(
                purchase_id = %purchase.id,
                transaction_id = %transaction_id,
                "activated purchase"
            );
        }

        let updated = store::find(conn, &purchase.id)?
            .ok_or_else(|| AppError::PurchaseNotFound(purchase.id.clone()))?;
        Ok(Attempt::Done(ReconcileOutcome::Applied(updated)))
    })
}

fn conflict(purchase: &Purchase, evidence: &Evidence, detail: &str) -> AppResult<Attempt> {
    tracing::warn!(
        purchase_id = %purchase.id,
        status = purchase.status.as_str(),
        evidence = ?evidence,
        detail,
        "conflicting evidence retained for manual reconciliation"
    );
    Err(AppError::ConflictingTransition(format!(
        "{} (purchase {})",
        detail, purchase.id
    )))
}

fn reloaded(conn: &mut SqliteConnection, purchase_id: &str) -> AppResult<Attempt> {
    let purchase = store::find(conn, purchase_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(purchase_id.to_string()))?;
    Ok(Attempt::Done(ReconcileOutcome::Applied(purchase)))
}
