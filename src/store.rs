use crate::error::AppResult;
use crate::model::Purchase;
use crate::types::PurchaseStatus;
use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

/// Durable store of purchase records. Every status change goes through a
/// per-id compare-and-set (`UPDATE ... WHERE id = ? AND status = ?`); a
/// return of `false` means the guard did not match and the caller must
/// re-read before deciding anything.
pub fn insert(conn: &mut SqliteConnection, record: &Purchase) -> AppResult<()> {
    use crate::schema::purchases::dsl::*;

    diesel::insert_into(purchases).values(record).execute(conn)?;
    Ok(())
}

pub fn find(conn: &mut SqliteConnection, purchase_id_param: &str) -> AppResult<Option<Purchase>> {
    use crate::schema::purchases::dsl::*;

    let record = purchases
        .filter(id.eq(purchase_id_param))
        .first(conn)
        .optional()?;
    Ok(record)
}

/// Lookup by gateway transaction id, used to detect replayed events that
/// would otherwise double-activate a second purchase.
pub fn find_by_transaction(
    conn: &mut SqliteConnection,
    transaction_id_param: &str,
) -> AppResult<Option<Purchase>> {
    use crate::schema::purchases::dsl::*;

    let record = purchases
        .filter(transaction_id.eq(transaction_id_param))
        .first(conn)
        .optional()?;
    Ok(record)
}

/// The one active purchase for an exclusive feature, if any.
pub fn active_for_feature(
    conn: &mut SqliteConnection,
    user_id_param: &str,
    feature_key_param: &str,
) -> AppResult<Option<Purchase>> {
    use crate::schema::purchases::dsl::*;

    let record = purchases
        .filter(user_id.eq(user_id_param))
        .filter(feature_key.eq(feature_key_param))
        .filter(status.eq(PurchaseStatus::Active))
        .first(conn)
        .optional()?;
    Ok(record)
}

/// Any other active purchase holding the same exclusive feature, used when
/// an activation has to retire the record it supersedes.
pub fn other_active_for_feature(
    conn: &mut SqliteConnection,
    user_id_param: &str,
    feature_key_param: &str,
    excluded_purchase_id: &str,
) -> AppResult<Option<Purchase>> {
    use crate::schema::purchases::dsl::*;

    let record = purchases
        .filter(user_id.eq(user_id_param))
        .filter(feature_key.eq(feature_key_param))
        .filter(status.eq(PurchaseStatus::Active))
        .filter(id.ne(excluded_purchase_id))
        .first(conn)
        .optional()?;
    Ok(record)
}

/// draft -> pending_payment, recording the gateway correlation token.
pub fn mark_pending_payment(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
    intent_id_param: Option<&str>,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Draft)),
    )
    .set((
        status.eq(PurchaseStatus::PendingPayment),
        payment_intent_id.eq(intent_id_param),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// pending_payment -> active, recording the settlement facts.
pub fn activate(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
    transaction_id_param: &str,
    amount_cents: i64,
    expiry: Option<NaiveDateTime>,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::PendingPayment)),
    )
    .set((
        status.eq(PurchaseStatus::Active),
        transaction_id.eq(transaction_id_param),
        amount_paid.eq(amount_cents),
        expiry_date.eq(expiry),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// pending_payment -> failed.
pub fn mark_failed(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
    reason: &str,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::PendingPayment)),
    )
    .set((
        status.eq(PurchaseStatus::Failed),
        failure_reason.eq(reason),
        failure_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// active -> failed, only for the same transaction the activation recorded.
/// This is the authoritative-callback demotion of an optimistic client
/// confirmation.
pub fn demote_active_to_failed(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
    transaction_id_param: &str,
    reason: &str,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Active))
            .filter(transaction_id.eq(transaction_id_param)),
    )
    .set((
        status.eq(PurchaseStatus::Failed),
        failure_reason.eq(reason),
        failure_at.eq(chrono::Utc::now().naive_utc()),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// Claim an active purchase for a switch. The guard on `switch_pending`
/// serializes concurrent switch checkouts for the same record: only one
/// caller wins the claim.
pub fn claim_switch(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
    target_plan_id: &str,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Active))
            .filter(switch_pending.eq(false)),
    )
    .set((
        switch_pending.eq(true),
        pending_switch_plan_id.eq(target_plan_id),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// Undo a switch claim after a checkout that never reached authorization,
/// leaving the original purchase active and unaffected.
pub fn release_switch_claim(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
) -> AppResult<()> {
    use crate::schema::purchases::dsl::*;

    diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Active)),
    )
    .set((
        switch_pending.eq(false),
        pending_switch_plan_id.eq(None::<String>),
    ))
    .execute(conn)?;

    Ok(())
}

/// active -> switched, retiring a superseded record. Clears the switch
/// bookkeeping so the audit trail reads cleanly.
pub fn retire_to_switched(
    conn: &mut SqliteConnection,
    purchase_id_param: &str,
) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Active)),
    )
    .set((
        status.eq(PurchaseStatus::Switched),
        switch_pending.eq(false),
        pending_switch_plan_id.eq(None::<String>),
    ))
    .execute(conn)?;

    Ok(updated == 1)
}

/// active -> cancelled.
pub fn cancel(conn: &mut SqliteConnection, purchase_id_param: &str) -> AppResult<bool> {
    use crate::schema::purchases::dsl::*;

    let updated = diesel::update(
        purchases
            .filter(id.eq(purchase_id_param))
            .filter(status.eq(PurchaseStatus::Active)),
    )
    .set(status.eq(PurchaseStatus::Cancelled))
    .execute(conn)?;

    Ok(updated == 1)
}

/// active -> expired for every purchase whose expiry has passed. Returns
/// how many records were swept.
pub fn expire_overdue(conn: &mut SqliteConnection, now: NaiveDateTime) -> AppResult<usize> {
    use crate::schema::purchases::dsl::*;

    let swept = diesel::update(
        purchases
            .filter(status.eq(PurchaseStatus::Active))
            .filter(expiry_date.is_not_null())
            .filter(expiry_date.lt(now)),
    )
    .set(status.eq(PurchaseStatus::Expired))
    .execute(conn)?;

    if swept > 0 {
        tracing::info!(count = swept, "expired overdue purchases");
    }
    Ok(swept)
}
