// History Reconcile - Web Server
// JSON API over the reconciliation orchestrator (reports, summary, backfill, prune)

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use history_reconcile::{
    Category, Config, ReconcileError, ReconcileSettings, ReconciliationOrchestrator, SqliteStore,
};

type Orchestrator = ReconciliationOrchestrator<SqliteStore, SqliteStore>;

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        }),
    )
        .into_response()
}

fn status_for(err: &ReconcileError) -> StatusCode {
    match err {
        ReconcileError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ReconcileError::OperationInProgress { .. } => StatusCode::CONFLICT,
        ReconcileError::UnknownCategory(_) => StatusCode::NOT_FOUND,
    }
}

/// Run a blocking orchestrator call off the async runtime
async fn run_blocking<T, F>(state: AppState, f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Orchestrator) -> Result<T, ReconcileError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&state.orchestrator)).await {
        Ok(Ok(data)) => ApiResponse::ok(data),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "request failed");
            error_response(status_for(&e), e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "worker task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    }
}

fn parse_category(raw: &str) -> Result<Category, Response> {
    raw.parse::<Category>()
        .map_err(|e| error_response(status_for(&e), e.to_string()))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/users/:user/reports - Reports for every category
async fn get_reports(State(state): State<AppState>, Path(user): Path<String>) -> Response {
    run_blocking(state, move |o| o.get_reports(&user)).await
}

/// GET /api/users/:user/reports/:category - Report for one category
async fn get_report(
    State(state): State<AppState>,
    Path((user, category)): Path<(String, String)>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(c) => c,
        Err(response) => return response,
    };
    run_blocking(state, move |o| o.get_report(&user, category)).await
}

/// GET /api/users/:user/summary - Totals across categories
async fn get_summary(State(state): State<AppState>, Path(user): Path<String>) -> Response {
    run_blocking(state, move |o| o.summary(&user)).await
}

/// POST /api/users/:user/backfill/:category - Backfill missing dates
async fn post_backfill(
    State(state): State<AppState>,
    Path((user, category)): Path<(String, String)>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(c) => c,
        Err(response) => return response,
    };
    run_blocking(state, move |o| o.run_backfill(&user, category)).await
}

/// POST /api/users/:user/prune/:category - Prune duplicate entries
async fn post_prune(
    State(state): State<AppState>,
    Path((user, category)): Path<(String, String)>,
) -> Response {
    let category = match parse_category(&category) {
        Ok(c) => c,
        Err(response) => return response,
    };
    run_blocking(state, move |o| o.run_prune(&user, category)).await
}

// ============================================================================
// Main Server
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RECONCILE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("history_reconcile=info,reconcile_server=info,warn"));

    let format = std::env::var("RECONCILE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false)).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load(None)?;
    let store = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .with_context(|| format!("Failed to open {}", config.store.db_path.display()))?,
    );
    tracing::info!(db = %config.store.db_path.display(), "database opened");

    let state = AppState {
        orchestrator: Arc::new(ReconciliationOrchestrator::new(
            store.clone(),
            store,
            ReconcileSettings::from(&config),
        )),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/users/:user/reports", get(get_reports))
        .route("/users/:user/reports/:category", get(get_report))
        .route("/users/:user/summary", get(get_summary))
        .route("/users/:user/backfill/:category", post(post_backfill))
        .route("/users/:user/prune/:category", post(post_prune))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;

    tracing::info!(bind = %config.server.bind, "server running");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
