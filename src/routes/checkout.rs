use crate::auth;
use crate::catalog::Plan;
use crate::error::{AppError, AppResult};
use crate::gateway::AuthorizationHandle;
use crate::model::Purchase;
use crate::reconcile::{self, ReconcileOutcome};
use crate::routes::status::summarize;
use crate::store;
use crate::types::{
    ApiResponse, BeginCheckoutRequest, CheckoutSessionResponse, CheckoutType, ConfirmRequest,
    EmptyData, Evidence, EvidenceOutcome, EvidenceSource, NextAction, PaymentGateway,
    PurchaseStatus, SessionTokenResponse, StatusResponse,
};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use diesel::sqlite::SqliteConnection;
use uuid::Uuid;

/// Issue the anti-forgery token the checkout page must present on its next
/// state-mutating call.
#[utoipa::path(
    post,
    path = "/checkout/session-token",
    responses(
        (status = 200, description = "Token issued", body = ApiResponse<SessionTokenResponse>),
        (status = 401, description = "Missing user identity", body = ApiResponse<EmptyData>)
    ),
    tag = "Checkout"
)]
pub async fn issue_session_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<ApiResponse<SessionTokenResponse>>> {
    let user_id = auth::require_user(&headers)?;
    let token = auth::issue_checkout_token(&state.token_keys, &user_id)?;

    Ok(Json(ApiResponse::success(SessionTokenResponse {
        token,
        expires_in_secs: auth::CHECKOUT_TOKEN_TTL_SECS,
    })))
}

#[utoipa::path(
    post,
    path = "/checkout/begin",
    request_body = BeginCheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = ApiResponse<CheckoutSessionResponse>),
        (status = 400, description = "Invalid switch or malformed request", body = ApiResponse<EmptyData>),
        (status = 401, description = "Missing or reused checkout token", body = ApiResponse<EmptyData>),
        (status = 402, description = "Payment declined at authorization", body = ApiResponse<EmptyData>),
        (status = 503, description = "Requested gateway not enabled", body = ApiResponse<EmptyData>)
    ),
    tag = "Checkout"
)]
pub async fn begin_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BeginCheckoutRequest>,
) -> AppResult<Json<ApiResponse<CheckoutSessionResponse>>> {
    let user_id = auth::require_user(&headers)?;
    let mut conn = state.db()?;
    auth::consume_checkout_token(&mut conn, &state.token_keys, &headers, &user_id)?;

    let plan = state.catalog.get_plan(&payload.plan_id)?.clone();

    let claimed_switch_id = match payload.checkout_type {
        CheckoutType::New => None,
        CheckoutType::Switch => Some(claim_switch_source(
            &mut conn,
            &user_id,
            &plan,
            payload.existing_purchase_id.as_deref(),
        )?),
    };

    match run_checkout(&mut conn, &state, &user_id, &plan, &payload).await {
        Ok(session) => Ok(Json(ApiResponse::success(session))),
        Err(e) => {
            // A checkout that never reached authorization must leave the
            // record it meant to replace active and unaffected.
            if let Some(old_id) = claimed_switch_id {
                if let Err(release_err) = store::release_switch_claim(&mut conn, &old_id) {
                    tracing::error!(
                        purchase_id = %old_id,
                        error = %release_err,
                        "failed to release switch claim after checkout error"
                    );
                }
            }
            Err(e)
        }
    }
}

fn claim_switch_source(
    conn: &mut SqliteConnection,
    user_id: &str,
    target_plan: &Plan,
    existing_purchase_id: Option<&str>,
) -> AppResult<String> {
    let existing_id = existing_purchase_id.ok_or_else(|| {
        AppError::InvalidSwitch("switch requires the purchase being replaced".to_string())
    })?;

    let existing = store::find(conn, existing_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(existing_id.to_string()))?;

    if existing.user_id != user_id {
        return Err(AppError::Unauthorized(
            "purchase belongs to a different user".to_string(),
        ));
    }
    if existing.status != PurchaseStatus::Active {
        return Err(AppError::InvalidSwitch(
            "only an active purchase can be switched".to_string(),
        ));
    }
    if existing.feature_key != target_plan.feature_key {
        return Err(AppError::InvalidSwitch(
            "target plan covers a different feature".to_string(),
        ));
    }
    if existing.plan_id == target_plan.id {
        return Err(AppError::InvalidSwitch(
            "target plan is already the current plan".to_string(),
        ));
    }

    // The claim doubles as the per-(user, feature) serialization of switch
    // checkouts: of two concurrent attempts, exactly one wins this update.
    if !store::claim_switch(conn, &existing.id, &target_plan.id)? {
        return Err(AppError::InvalidSwitch(
            "another switch is already in progress for this purchase".to_string(),
        ));
    }

    Ok(existing.id)
}

async fn run_checkout(
    conn: &mut SqliteConnection,
    state: &AppState,
    user_id: &str,
    plan: &Plan,
    payload: &BeginCheckoutRequest,
) -> AppResult<CheckoutSessionResponse> {
    let gateway = state.gateways.resolve(payload.gateway)?;

    if payload.gateway == PaymentGateway::Free && plan.price_cents != 0 {
        return Err(AppError::BadRequest(
            "the free gateway only covers zero-price plans".to_string(),
        ));
    }

    let purchase = Purchase::new_draft(
        user_id.to_string(),
        plan,
        payload.gateway,
        payload.auto_renew,
    )?;
    store::insert(conn, &purchase)?;
    tracing::info!(
        purchase_id = %purchase.id,
        plan_id = %plan.id,
        gateway = payload.gateway.as_str(),
        checkout_type = ?payload.checkout_type,
        "checkout started"
    );

    // Zero-amount plans settle in this very request; no external round trip.
    let handle = if plan.price_cents == 0 {
        AuthorizationHandle::Immediate {
            transaction_id: format!("free_{}", Uuid::new_v4()),
        }
    } else {
        match gateway.create_authorization(&purchase, plan.price_cents).await {
            Ok(handle) => handle,
            Err(AppError::GatewayDeclined(reason)) => {
                // The decline is authoritative failure evidence; walk the
                // record through its normal edges rather than abandoning it
                // in draft.
                store::mark_pending_payment(conn, &purchase.id, None)?;
                let evidence = Evidence {
                    purchase_id: purchase.id.clone(),
                    transaction_id: None,
                    outcome: EvidenceOutcome::Failure,
                    amount_cents: None,
                    reason: Some(reason.clone()),
                };
                reconcile::apply_evidence(conn, &evidence, &EvidenceSource::GatewayCallback)?;
                return Err(AppError::GatewayDeclined(reason));
            }
            // Timeouts and outages leave the purchase in draft for the
            // cleanup sweep; nothing was authorized.
            Err(e) => return Err(e),
        }
    };

    let session = match handle {
        AuthorizationHandle::Immediate { transaction_id } => {
            if !store::mark_pending_payment(conn, &purchase.id, None)? {
                return Err(AppError::ConflictingTransition(
                    "draft purchase changed concurrently".to_string(),
                ));
            }
            let evidence = Evidence {
                purchase_id: purchase.id.clone(),
                transaction_id: Some(transaction_id),
                outcome: EvidenceOutcome::Success,
                amount_cents: Some(plan.price_cents),
                reason: None,
            };
            let outcome =
                reconcile::apply_evidence(conn, &evidence, &EvidenceSource::GatewayCallback)?;

            CheckoutSessionResponse {
                purchase_id: purchase.id.clone(),
                status: outcome.purchase().status,
                next_action: NextAction::Complete,
                confirm_token: None,
            }
        }
        AuthorizationHandle::CardIntent {
            intent_id,
            client_secret,
        } => {
            if !store::mark_pending_payment(conn, &purchase.id, Some(&intent_id))? {
                return Err(AppError::ConflictingTransition(
                    "draft purchase changed concurrently".to_string(),
                ));
            }
            CheckoutSessionResponse {
                purchase_id: purchase.id.clone(),
                status: PurchaseStatus::PendingPayment,
                next_action: NextAction::ConfirmCard {
                    payment_intent_id: intent_id,
                    client_secret,
                },
                confirm_token: Some(auth::issue_checkout_token(&state.token_keys, user_id)?),
            }
        }
        AuthorizationHandle::Redirect { url, order_id } => {
            if !store::mark_pending_payment(conn, &purchase.id, Some(&order_id))? {
                return Err(AppError::ConflictingTransition(
                    "draft purchase changed concurrently".to_string(),
                ));
            }
            CheckoutSessionResponse {
                purchase_id: purchase.id.clone(),
                status: PurchaseStatus::PendingPayment,
                next_action: NextAction::Redirect { url },
                confirm_token: Some(auth::issue_checkout_token(&state.token_keys, user_id)?),
            }
        }
        AuthorizationHandle::BankInstructions { reference, details } => {
            if !store::mark_pending_payment(conn, &purchase.id, Some(&reference))? {
                return Err(AppError::ConflictingTransition(
                    "draft purchase changed concurrently".to_string(),
                ));
            }
            // Finalized later by administrator override; there is no client
            // confirmation step to hand a token to.
            CheckoutSessionResponse {
                purchase_id: purchase.id.clone(),
                status: PurchaseStatus::PendingPayment,
                next_action: NextAction::BankTransfer { reference, details },
                confirm_token: None,
            }
        }
    };

    Ok(session)
}

/// Client-side confirmation: the caller reports the outcome of the
/// gateway-specific handshake it just completed. Optimistic until the
/// gateway callback agrees; the reconciler holds the precedence rules.
#[utoipa::path(
    post,
    path = "/checkout/confirm",
    request_body = ConfirmRequest,
    responses(
        (status = 200, description = "Evidence applied or already recorded", body = ApiResponse<StatusResponse>),
        (status = 401, description = "Missing or reused checkout token", body = ApiResponse<EmptyData>),
        (status = 404, description = "Unknown purchase", body = ApiResponse<EmptyData>),
        (status = 409, description = "Evidence conflicts with recorded state", body = ApiResponse<EmptyData>)
    ),
    tag = "Checkout"
)]
pub async fn confirm_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ConfirmRequest>,
) -> AppResult<Json<ApiResponse<StatusResponse>>> {
    let user_id = auth::require_user(&headers)?;
    let mut conn = state.db()?;
    auth::consume_checkout_token(&mut conn, &state.token_keys, &headers, &user_id)?;

    let purchase = store::find(&mut conn, &payload.purchase_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(payload.purchase_id.clone()))?;
    if purchase.user_id != user_id {
        return Err(AppError::Unauthorized(
            "purchase belongs to a different user".to_string(),
        ));
    }
    // Bank transfers have no client handshake; only an administrator can
    // attest that the money arrived.
    if purchase.payment_gateway == PaymentGateway::Bank {
        return Err(AppError::BadRequest(
            "bank transfers are finalized by an administrator".to_string(),
        ));
    }

    let evidence = Evidence {
        purchase_id: payload.purchase_id.clone(),
        transaction_id: payload.transaction_id.clone(),
        outcome: payload.outcome,
        amount_cents: payload.amount_cents,
        reason: payload.reason.clone(),
    };

    let outcome = reconcile::apply_evidence(&mut conn, &evidence, &EvidenceSource::Client)?;
    let message = match &outcome {
        ReconcileOutcome::Applied(_) => "payment confirmation recorded",
        ReconcileOutcome::AlreadyApplied(_) => "purchase already settled; duplicate ignored",
    };
    let summary = summarize(outcome.purchase(), 0)?;

    Ok(Json(ApiResponse::success_with_message(summary, message)))
}

/// User-initiated cancellation of an active purchase.
#[utoipa::path(
    post,
    path = "/purchases/{id}/cancel",
    params(("id" = String, Path, description = "Purchase id")),
    responses(
        (status = 200, description = "Purchase cancelled", body = ApiResponse<StatusResponse>),
        (status = 401, description = "Missing or reused checkout token", body = ApiResponse<EmptyData>),
        (status = 409, description = "Purchase is not active", body = ApiResponse<EmptyData>)
    ),
    tag = "Purchases"
)]
pub async fn cancel_purchase(
    State(state): State<AppState>,
    Path(purchase_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<ApiResponse<StatusResponse>>> {
    let user_id = auth::require_user(&headers)?;
    let mut conn = state.db()?;
    auth::consume_checkout_token(&mut conn, &state.token_keys, &headers, &user_id)?;

    let purchase = store::find(&mut conn, &purchase_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(purchase_id.clone()))?;
    if purchase.user_id != user_id {
        return Err(AppError::Unauthorized(
            "purchase belongs to a different user".to_string(),
        ));
    }

    if !store::cancel(&mut conn, &purchase_id)? {
        return Err(AppError::ConflictingTransition(
            "only an active purchase can be cancelled".to_string(),
        ));
    }
    tracing::info!(purchase_id = %purchase_id, user_id = %user_id, "purchase cancelled");

    let updated = store::find(&mut conn, &purchase_id)?
        .ok_or_else(|| AppError::PurchaseNotFound(purchase_id.clone()))?;
    Ok(Json(ApiResponse::success_with_message(
        summarize(&updated, 0)?,
        "purchase cancelled",
    )))
}
