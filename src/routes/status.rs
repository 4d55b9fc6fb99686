use crate::auth;
use crate::error::{AppError, AppResult};
use crate::model::Purchase;
use crate::store;
use crate::types::{ApiResponse, EmptyData, PurchaseStatus, StatusPhase, StatusQuery, StatusResponse};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;

/// How long the confirmation view waits before re-fetching.
pub const POLL_INTERVAL_SECS: u64 = 7;
/// After this many re-fetches a still-pending purchase is presented as
/// "unknown, check your dashboard" instead of polling forever.
pub const MAX_STATUS_POLLS: u32 = 8;

/// Status read backing the confirmation view's bounded polling loop. The
/// view passes its own `refresh_count`; the server decides when the loop is
/// over.
#[utoipa::path(
    get,
    path = "/purchases/{id}/status",
    params(
        ("id" = String, Path, description = "Purchase id"),
        ("refresh_count" = u32, Query, description = "How many re-fetches the view has already made")
    ),
    responses(
        (status = 200, description = "Current presentation state", body = ApiResponse<StatusResponse>),
        (status = 401, description = "Ownership mismatch", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown purchase", body = ApiResponse<EmptyData>)
    ),
    tag = "Purchases"
)]
pub async fn purchase_status(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> AppResult<Json<ApiResponse<StatusResponse>>> {
    let user_id = auth::require_user(&headers)?;
    let mut conn = state.db()?;

    let purchase = store::find(&mut conn, &purchase_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(purchase_id.clone()))?;
    if purchase.user_id != user_id {
        return Err(AppError::Unauthorized(
            "purchase belongs to a different user".to_string(),
        ));
    }

    Ok(Json(ApiResponse::success(summarize(
        &purchase,
        query.refresh_count,
    )?)))
}

/// Map a purchase onto the presentation contract: processing / confirmed /
/// error / unknown, with a human-readable reason and the next poll delay.
pub fn summarize(purchase: &Purchase, refresh_count: u32) -> AppResult<StatusResponse> {
    let snapshot = purchase.snapshot()?;

    let (phase, poll_again_in_secs) = match purchase.status {
        PurchaseStatus::Active => (StatusPhase::Confirmed, None),
        PurchaseStatus::Draft | PurchaseStatus::PendingPayment => {
            if refresh_count < MAX_STATUS_POLLS {
                (StatusPhase::Processing, Some(POLL_INTERVAL_SECS))
            } else {
                (StatusPhase::Unknown, None)
            }
        }
        PurchaseStatus::Failed
        | PurchaseStatus::Cancelled
        | PurchaseStatus::Expired
        | PurchaseStatus::Switched => (StatusPhase::Error, None),
    };

    let reason = match phase {
        StatusPhase::Error => Some(
            purchase
                .failure_reason
                .clone()
                .unwrap_or_else(|| match purchase.status {
                    PurchaseStatus::Cancelled => "This purchase was cancelled.".to_string(),
                    PurchaseStatus::Expired => "This purchase has expired.".to_string(),
                    PurchaseStatus::Switched => {
                        "This purchase was replaced by a plan switch.".to_string()
                    }
                    _ => "The payment did not complete.".to_string(),
                }),
        ),
        StatusPhase::Unknown => Some(
            "We could not confirm your payment yet. Please check your dashboard.".to_string(),
        ),
        _ => None,
    };

    Ok(StatusResponse {
        purchase_id: purchase.id.clone(),
        phase,
        plan_name: snapshot.name,
        feature_name: snapshot.feature_name,
        amount_paid_cents: purchase.amount_paid,
        transaction_id: purchase.transaction_id.clone(),
        expiry_date: purchase.expiry_date,
        reason,
        poll_again_in_secs,
    })
}
