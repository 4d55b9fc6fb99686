use crate::auth;
use crate::error::AppResult;
use crate::reconcile::{self, ReconcileOutcome};
use crate::routes::status::summarize;
use crate::store;
use crate::types::{
    AdminOverrideRequest, ApiResponse, EmptyData, Evidence, EvidenceSource, StatusResponse,
};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

/// Administrator override: finalize a bank-transfer purchase or correct a
/// stuck one. Goes through the same reconciler as every other evidence
/// source, so the idempotency and precedence rules apply unchanged.
#[utoipa::path(
    post,
    path = "/admin/purchases/{id}/override",
    params(("id" = String, Path, description = "Purchase id")),
    request_body = AdminOverrideRequest,
    responses(
        (status = 200, description = "Override applied", body = ApiResponse<StatusResponse>),
        (status = 401, description = "Missing or invalid admin token", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown purchase", body = ApiResponse<EmptyData>),
        (status = 409, description = "Override conflicts with recorded state", body = ApiResponse<EmptyData>)
    ),
    tag = "Administration"
)]
pub async fn override_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<AdminOverrideRequest>,
) -> AppResult<Json<ApiResponse<StatusResponse>>> {
    auth::require_admin(&headers)?;
    let mut conn = state.db()?;

    let evidence = Evidence {
        purchase_id: purchase_id.clone(),
        transaction_id: payload.transaction_id.clone(),
        outcome: payload.outcome,
        amount_cents: payload.amount_cents,
        reason: payload.reason.clone(),
    };

    let outcome = reconcile::apply_evidence(
        &mut conn,
        &evidence,
        &EvidenceSource::AdminOverride {
            actor: payload.actor.clone(),
        },
    )?;

    let message = match &outcome {
        ReconcileOutcome::Applied(_) => "override applied",
        ReconcileOutcome::AlreadyApplied(_) => "override matched the recorded outcome",
    };

    Ok(Json(ApiResponse::success_with_message(
        summarize(outcome.purchase(), 0)?,
        message,
    )))
}

/// Run the expiry sweep on demand. The background task covers the steady
/// state; this exists so operators can force a pass after clock or outage
/// incidents.
#[utoipa::path(
    post,
    path = "/admin/sweep-expired",
    responses(
        (status = 200, description = "Sweep completed", body = ApiResponse<EmptyData>),
        (status = 401, description = "Missing or invalid admin token", body = ApiResponse<EmptyData>)
    ),
    tag = "Administration"
)]
pub async fn sweep_expired(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<ApiResponse<EmptyData>>> {
    auth::require_admin(&headers)?;
    let mut conn = state.db()?;

    let swept = store::expire_overdue(&mut conn, chrono::Utc::now().naive_utc())?;

    Ok(Json(ApiResponse::success_with_message(
        EmptyData {},
        format!("expired {} overdue purchases", swept),
    )))
}
