pub mod auth;
pub mod catalog;
pub mod error;
pub mod gateway;
pub mod model;
pub mod reconcile;
pub mod routes;
pub mod schema;
pub mod store;
pub mod types;

use auth::TokenKeys;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use catalog::Catalog;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use error::{AppError, AppResult};
use gateway::GatewayRegistry;
use routes::admin::{override_purchase, sweep_expired};
use routes::callback::gateway_callback;
use routes::checkout::{begin_checkout, cancel_purchase, confirm_checkout, issue_session_token};
use routes::status::purchase_status;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use types::{
    AdminOverrideRequest, ApiResponse, BeginCheckoutRequest, CheckoutSessionResponse, CheckoutType,
    ConfirmRequest, EmptyData, EvidenceOutcome, NextAction, PaymentGateway, PurchaseStatus,
    SessionTokenResponse, StatusPhase, StatusResponse,
};
use utoipa::OpenApi;

/// How often the background sweep retires purchases past their expiry.
const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 3600;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub catalog: Arc<Catalog>,
    pub gateways: Arc<GatewayRegistry>,
    pub token_keys: Arc<TokenKeys>,
}

impl AppState {
    /// Get a database connection from the pool
    pub fn db(&self) -> AppResult<DbConnection> {
        self.pool.get().map_err(|_| AppError::DatabaseConnection)
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::checkout::issue_session_token,
        routes::checkout::begin_checkout,
        routes::checkout::confirm_checkout,
        routes::checkout::cancel_purchase,
        routes::status::purchase_status,
        routes::admin::override_purchase,
        routes::admin::sweep_expired,
        health_check
    ),
    components(
        schemas(
            ApiResponse<EmptyData>, EmptyData, BeginCheckoutRequest, CheckoutSessionResponse,
            CheckoutType, ConfirmRequest, AdminOverrideRequest, SessionTokenResponse,
            StatusResponse, StatusPhase, NextAction, PurchaseStatus, PaymentGateway,
            EvidenceOutcome
        )
    ),
    tags(
        (name = "Checkout", description = "Checkout orchestration endpoints"),
        (name = "Purchases", description = "Purchase status and lifecycle endpoints"),
        (name = "Administration", description = "Administrator override endpoints"),
        (name = "Health", description = "Health check endpoints")
    ),
    info(
        title = "PlanHub Billing API",
        version = "1.0.0",
        description = "API for plan checkout, payment confirmation and purchase lifecycle"
    )
)]
struct ApiDoc;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = serde_json::Value)
    ),
    tag = "Health"
)]
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn openapi_spec() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn swagger_ui() -> impl IntoResponse {
    Html(include_str!("../static/swagger.html"))
}

/// Assemble the application router. Tests build their own `AppState` and
/// call this directly.
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/checkout/session-token", post(issue_session_token))
        .route("/checkout/begin", post(begin_checkout))
        .route("/checkout/confirm", post(confirm_checkout))
        .route("/purchases/{id}/status", get(purchase_status))
        .route("/purchases/{id}/cancel", post(cancel_purchase))
        .route("/gateways/{gateway}/callback", post(gateway_callback))
        .route("/admin/purchases/{id}/override", post(override_purchase))
        .route("/admin/sweep-expired", post(sweep_expired))
        .route("/api-doc/openapi.json", get(openapi_spec))
        .route("/explore", get(swagger_ui))
        .with_state(app_state)
}

pub fn run() {
    tokio::runtime::Runtime::new().unwrap().block_on(async {
        // Run database migrations on startup
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "billing.db".to_string());
        if let Err(e) = run_migrations(&database_url) {
            tracing::error!("failed to run migrations: {}", e);
            std::process::exit(1);
        }

        let catalog = match Catalog::from_env() {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::error!("failed to load plan catalog: {}", e);
                std::process::exit(1);
            }
        };

        let gateways = match GatewayRegistry::from_env() {
            Ok(gateways) => gateways,
            Err(e) => {
                tracing::error!("failed to configure payment gateways: {}", e);
                std::process::exit(1);
            }
        };

        let token_keys = match TokenKeys::from_env() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("failed to load checkout token secret: {}", e);
                std::process::exit(1);
            }
        };

        let manager = ConnectionManager::<SqliteConnection>::new(&database_url);
        let pool = match Pool::builder().build(manager) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("failed to build connection pool: {}", e);
                std::process::exit(1);
            }
        };

        let app_state = AppState {
            pool,
            catalog: Arc::new(catalog),
            gateways: Arc::new(gateways),
            token_keys: Arc::new(token_keys),
        };

        spawn_expiry_sweep(app_state.clone());

        let app = router(app_state);

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .expect("PORT must be a valid number");

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("listening on {}", addr);

        axum::serve(
            tokio::net::TcpListener::bind(addr).await.unwrap(),
            app.into_make_service(),
        )
        .await
        .unwrap();
    });
}

/// Background task walking `active -> expired` once purchases pass their
/// expiry date.
fn spawn_expiry_sweep(app_state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match app_state.db() {
                Ok(mut conn) => {
                    if let Err(e) = store::expire_overdue(&mut conn, chrono::Utc::now().naive_utc())
                    {
                        tracing::error!("expiry sweep failed: {}", e);
                    }
                }
                Err(e) => tracing::error!("expiry sweep could not get a connection: {}", e),
            }
        }
    });
}

pub fn run_migrations(database_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    use diesel::Connection;
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

    let mut connection = SqliteConnection::establish(database_url)?;
    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| format!("migration error: {}", e))?;

    Ok(())
}
