use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sqlite::SqliteConnection;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use uuid::Uuid;

/// Header carrying the identity established by the authentication
/// collaborator. This service trusts it and performs no authentication of
/// its own.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the anti-forgery checkout token.
pub const CHECKOUT_TOKEN_HEADER: &str = "x-checkout-token";
/// Header carrying the administration collaborator's shared secret.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Checkout tokens are short-lived; they cover one page-load worth of a
/// checkout step.
pub const CHECKOUT_TOKEN_TTL_SECS: u64 = 600;

/// Claims of the signed, single-use token passed between checkout steps.
/// The `jti` is consumed on first use, so a replayed token is rejected even
/// inside its validity window.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckoutClaims {
    pub sub: String,
    pub jti: String,
    pub iat: usize,
    pub exp: usize,
}

pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let secret = env::var("CHECKOUT_TOKEN_SECRET")
            .map_err(|_| "CHECKOUT_TOKEN_SECRET environment variable must be set")?;
        Ok(Self::from_secret(secret.as_bytes()))
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

pub fn issue_checkout_token(keys: &TokenKeys, user_id: &str) -> AppResult<String> {
    let now = Utc::now().timestamp() as usize;
    let claims = CheckoutClaims {
        sub: user_id.to_string(),
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + CHECKOUT_TOKEN_TTL_SECS as usize,
    };

    encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
        .map_err(|e| AppError::Internal(format!("failed to sign checkout token: {}", e)))
}

/// Validate and consume a checkout token for `user_id`. Consumption records
/// the `jti` in the spent-token ledger; a second presentation of the same
/// token fails even though the signature still verifies.
pub fn consume_checkout_token(
    conn: &mut SqliteConnection,
    keys: &TokenKeys,
    headers: &HeaderMap,
    expected_user: &str,
) -> AppResult<()> {
    let token = headers
        .get(CHECKOUT_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing checkout token".to_string()))?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;

    let token_data = decode::<CheckoutClaims>(token, &keys.decoding, &validation)
        .map_err(|_| AppError::Unauthorized("invalid checkout token".to_string()))?;

    if token_data.claims.sub != expected_user {
        return Err(AppError::Unauthorized(
            "checkout token does not belong to the acting session".to_string(),
        ));
    }

    spend_jti(conn, &token_data.claims)
}

fn spend_jti(conn: &mut SqliteConnection, claims: &CheckoutClaims) -> AppResult<()> {
    use crate::schema::spent_tokens::dsl::*;

    let now = Utc::now().naive_utc();

    // Ledger hygiene: tokens past their expiry can never verify again, so
    // their jti rows are dead weight.
    diesel::delete(spent_tokens.filter(expires_at.lt(now))).execute(conn)?;

    let expiry = chrono::DateTime::from_timestamp(claims.exp as i64, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or(now);

    let inserted = diesel::insert_into(spent_tokens)
        .values((
            jti.eq(&claims.jti),
            user_id.eq(&claims.sub),
            expires_at.eq(expiry),
        ))
        .execute(conn);

    match inserted {
        Ok(_) => Ok(()),
        Err(diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Err(
            AppError::Unauthorized("checkout token already used".to_string()),
        ),
        Err(e) => Err(e.into()),
    }
}

pub fn require_user(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| AppError::Unauthorized("missing user identity".to_string()))
}

/// Administration collaborator calls carry a shared secret configured via
/// `ADMIN_API_TOKEN`.
pub fn require_admin(headers: &HeaderMap) -> AppResult<()> {
    let expected = env::var("ADMIN_API_TOKEN")
        .map_err(|_| AppError::Unauthorized("admin access not configured".to_string()))?;

    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing admin token".to_string()))?;

    if presented != expected {
        return Err(AppError::Unauthorized("invalid admin token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_for_owner() {
        let keys = TokenKeys::from_secret(b"test-secret");
        let token = issue_checkout_token(&keys, "user-1").unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        let data = decode::<CheckoutClaims>(&token, &keys.decoding, &validation).unwrap();
        assert_eq!(data.claims.sub, "user-1");
        assert!(!data.claims.jti.is_empty());
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let keys = TokenKeys::from_secret(b"test-secret");
        let a = issue_checkout_token(&keys, "user-1").unwrap();
        let b = issue_checkout_token(&keys, "user-1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_token_fails_validation() {
        let keys = TokenKeys::from_secret(b"test-secret");
        let other = TokenKeys::from_secret(b"different-secret");
        let token = issue_checkout_token(&other, "user-1").unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        assert!(decode::<CheckoutClaims>(&token, &keys.decoding, &validation).is_err());
    }
}
