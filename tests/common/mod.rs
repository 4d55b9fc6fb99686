use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use planhub_billing::auth::{TokenKeys, CHECKOUT_TOKEN_HEADER, USER_ID_HEADER};
use planhub_billing::catalog::{Catalog, Plan};
use planhub_billing::gateway::{BankGateway, GatewayRegistry, PaypalGateway, StripeGateway};
use planhub_billing::{AppState, DbConnection};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

pub const TEST_TOKEN_SECRET: &[u8] = b"test-checkout-secret";
pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_stripe_test";

/// Temp-file SQLite app fixture with automatic cleanup, in the shape the
/// route tests need: a ready `AppState` plus direct pool access for
/// seeding and asserting on rows.
pub struct TestApp {
    pub state: AppState,
    db_path: String,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_registry(test_gateways())
    }

    pub fn with_registry(gateways: GatewayRegistry) -> Self {
        let db_path = format!("test_{}.db", uuid::Uuid::new_v4());
        planhub_billing::run_migrations(&db_path).expect("failed to run test migrations");

        let manager = ConnectionManager::<SqliteConnection>::new(&db_path);
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .expect("failed to build test pool");

        // Admin routes read the shared secret from the environment.
        std::env::set_var("ADMIN_API_TOKEN", TEST_ADMIN_TOKEN);

        let state = AppState {
            pool,
            catalog: Arc::new(Catalog::from_plans(test_plans())),
            gateways: Arc::new(gateways),
            token_keys: Arc::new(TokenKeys::from_secret(TEST_TOKEN_SECRET)),
        };

        Self { state, db_path }
    }

    pub fn router(&self) -> Router {
        planhub_billing::router(self.state.clone())
    }

    pub fn conn(&self) -> DbConnection {
        self.state.db().expect("failed to get test connection")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

pub fn test_plans() -> Vec<Plan> {
    vec![
        Plan {
            id: "starter-free".to_string(),
            name: "Starter".to_string(),
            feature_key: "api-access".to_string(),
            feature_name: "API Access".to_string(),
            price_cents: 0,
            duration_days: 30,
            one_time: false,
            request_limit: 1_000,
        },
        Plan {
            id: "pro-monthly".to_string(),
            name: "Pro Monthly".to_string(),
            feature_key: "api-access".to_string(),
            feature_name: "API Access".to_string(),
            price_cents: 1999,
            duration_days: 30,
            one_time: false,
            request_limit: 50_000,
        },
        Plan {
            id: "team-monthly".to_string(),
            name: "Team Monthly".to_string(),
            feature_key: "api-access".to_string(),
            feature_name: "API Access".to_string(),
            price_cents: 4999,
            duration_days: 30,
            one_time: false,
            request_limit: 250_000,
        },
        Plan {
            id: "archive-lifetime".to_string(),
            name: "Archive Lifetime".to_string(),
            feature_key: "archive".to_string(),
            feature_name: "Archive Exports".to_string(),
            price_cents: 50_000,
            duration_days: 0,
            one_time: true,
            request_limit: 0,
        },
    ]
}

pub fn test_gateways() -> GatewayRegistry {
    let client = reqwest::Client::new();
    GatewayRegistry::new(
        Some(StripeGateway::new(
            "sk_test_123".to_string(),
            STRIPE_WEBHOOK_SECRET.to_string(),
            client.clone(),
        )),
        Some(PaypalGateway::new(
            "paypal-client".to_string(),
            "paypal-secret".to_string(),
            "whsec_paypal_test".to_string(),
            "https://api-m.sandbox.paypal.com".to_string(),
            client,
        )),
        Some(BankGateway::new(
            "ACME Bank, IBAN DE00 1234 5678".to_string(),
        )),
        true,
    )
}

pub async fn issue_token(app: &Router, user: &str) -> String {
    let req = Request::builder()
        .method("POST")
        .uri("/checkout/session-token")
        .header(USER_ID_HEADER, user)
        .body(Body::empty())
        .unwrap();

    let res = app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), axum::http::StatusCode::OK);
    let body = body_json(res).await;
    body["data"]["token"].as_str().unwrap().to_string()
}

pub fn post_json(
    uri: &str,
    user: &str,
    checkout_token: Option<&str>,
    payload: &serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(USER_ID_HEADER, user);
    if let Some(token) = checkout_token {
        builder = builder.header(CHECKOUT_TOKEN_HEADER, token);
    }
    builder
        .body(Body::from(serde_json::to_vec(payload).unwrap()))
        .unwrap()
}

pub fn get_request(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(USER_ID_HEADER, user)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(res: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// HMAC-SHA256 body signature in the shape the callback route verifies.
pub fn sign_callback(secret: &str, body: &[u8]) -> String {
    use base64::prelude::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}
