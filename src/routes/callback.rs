use crate::error::AppError;
use crate::gateway::{self, SIGNATURE_HEADER};
use crate::reconcile::{self, ReconcileOutcome};
use crate::types::{EvidenceSource, PaymentGateway};
use crate::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;

/// Asynchronous gateway callback. The body is signed by the gateway; the
/// response code doubles as delivery acknowledgment: 2xx stops redelivery,
/// 5xx asks the gateway to retry.
pub async fn gateway_callback(
    State(state): State<AppState>,
    Path(gateway_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let gateway: PaymentGateway = match gateway_name.parse() {
        Ok(g) => g,
        Err(_) => return (StatusCode::NOT_FOUND, "unknown gateway"),
    };

    let gateway_ref = match state.gateways.resolve(gateway) {
        Ok(g) => g,
        Err(_) => return (StatusCode::NOT_FOUND, "gateway not enabled"),
    };

    let secret = match gateway_ref.webhook_secret() {
        Some(secret) => secret,
        None => return (StatusCode::BAD_REQUEST, "gateway does not deliver callbacks"),
    };

    let signature = match headers.get(SIGNATURE_HEADER).and_then(|h| h.to_str().ok()) {
        Some(sig) => sig,
        None => return (StatusCode::UNAUTHORIZED, "missing callback signature"),
    };
    if let Err(e) = gateway::verify_callback_signature(secret, &body, signature) {
        tracing::warn!(gateway = gateway.as_str(), error = %e, "callback signature rejected");
        return (StatusCode::UNAUTHORIZED, "invalid callback signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(gateway = gateway.as_str(), error = %e, "unparseable callback body");
            return (StatusCode::BAD_REQUEST, "invalid callback payload");
        }
    };

    let evidence = match gateway_ref.extract_evidence(&payload) {
        Ok(Some(evidence)) => evidence,
        // Event types this service does not act on are still acknowledged,
        // otherwise the gateway redelivers them forever.
        Ok(None) => return (StatusCode::OK, "ignored"),
        Err(e) => {
            tracing::warn!(gateway = gateway.as_str(), error = %e, "malformed callback event");
            return (StatusCode::BAD_REQUEST, "malformed callback event");
        }
    };

    let mut conn = match state.db() {
        Ok(conn) => conn,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "processing failed"),
    };

    match reconcile::apply_evidence(&mut conn, &evidence, &EvidenceSource::GatewayCallback) {
        Ok(ReconcileOutcome::Applied(_)) | Ok(ReconcileOutcome::AlreadyApplied(_)) => {
            (StatusCode::OK, "OK")
        }
        // Conflicts are permanent: the payload is already logged for manual
        // reconciliation, and a retry would conflict again.
        Err(AppError::ConflictingTransition(_)) | Err(AppError::PurchaseNotFound(_)) => {
            (StatusCode::OK, "ignored")
        }
        Err(e) => {
            tracing::error!(
                gateway = gateway.as_str(),
                purchase_id = %evidence.purchase_id,
                error = %e,
                "callback processing failed"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "processing failed")
        }
    }
}
