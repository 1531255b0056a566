// Insurance SCD2 Loader - Web Server
// REST API with Axum: load batches, inspect history, audit tables

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use insurance_scd2::{
    audit_table, ensure_tables, fetch_history, load_extracted, manifest_for, open_database,
    table_stats, AuditReport, BatchOutcome, ChangePolicy, LoadOptions, Record, TableManifest,
    TableStats, UpsertError, VersionRow, Versioning,
};

#[derive(Parser, Debug)]
#[command(name = "scd2-server", version)]
struct ServerArgs {
    #[arg(long, env = "SCD2_DB_PATH", default_value = "insurance.db")]
    db: PathBuf,

    #[arg(long, env = "SCD2_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// Default no-op policy when a request carries no options
    #[arg(long, value_enum, env = "SCD2_CHANGE_POLICY", default_value_t = ChangePolicy::SuppressUnchanged)]
    policy: ChangePolicy,

    #[arg(long, env = "SCD2_STRICT")]
    strict: bool,

    #[arg(long, value_enum, env = "SCD2_FACT_VERSIONING", default_value_t = Versioning::Scd2)]
    fact_versioning: Versioning,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    options: LoadOptions,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// POST body for a load
#[derive(Deserialize)]
struct LoadRequest {
    records: Vec<Record>,
    /// Overrides the server defaults for this batch
    #[serde(default)]
    options: Option<LoadOptions>,
}

// ============================================================================
// Errors
// ============================================================================

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<UpsertError> for ApiError {
    fn from(e: UpsertError) -> Self {
        let status = match &e {
            UpsertError::MissingKey { .. } | UpsertError::TypeMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            UpsertError::KeyArity { .. } => StatusCode::BAD_REQUEST,
            UpsertError::InvariantViolation { .. } => StatusCode::CONFLICT,
            UpsertError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR || status == StatusCode::CONFLICT {
            error!(error = %e, "request failed");
        }
        ApiError::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::err(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn lookup(entity: &str) -> Result<&'static TableManifest, ApiError> {
    manifest_for(entity)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("Unknown entity `{}`", entity)))
}

fn lock(state: &AppState) -> Result<MutexGuard<'_, Connection>, ApiError> {
    state
        .db
        .lock()
        .map_err(|_| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Database lock poisoned"))
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/:entity/load - Apply one batch of records
async fn load_entity(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(request): Json<LoadRequest>,
) -> ApiResult<BatchOutcome> {
    let manifest = lookup(&entity)?;
    let options = request.options.unwrap_or(state.options);

    let mut conn = lock(&state)?;
    let outcome = load_extracted(&mut conn, manifest, &request.records, &options)?;

    Ok(Json(ApiResponse::ok(outcome)))
}

/// GET /api/:entity/stats - Version counts
async fn get_stats(State(state): State<AppState>, Path(entity): Path<String>) -> ApiResult<TableStats> {
    let manifest = lookup(&entity)?;
    let conn = lock(&state)?;
    Ok(Json(ApiResponse::ok(table_stats(&conn, manifest)?)))
}

/// GET /api/:entity/audit - History audit
async fn get_audit(State(state): State<AppState>, Path(entity): Path<String>) -> ApiResult<AuditReport> {
    let manifest = lookup(&entity)?;
    let conn = lock(&state)?;
    Ok(Json(ApiResponse::ok(audit_table(&conn, manifest)?)))
}

/// GET /api/:entity/history/*key - Every version of one key (bob: /H1/P1)
async fn get_history(
    State(state): State<AppState>,
    Path((entity, key)): Path<(String, String)>,
) -> ApiResult<Vec<VersionRow>> {
    let manifest = lookup(&entity)?;
    let parts: Vec<String> = key
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    let key = manifest.parse_key(&parts)?;
    let conn = lock(&state)?;
    Ok(Json(ApiResponse::ok(fetch_history(&conn, manifest, &key)?)))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")))
        .init();

    let args = ServerArgs::parse();

    let conn = open_database(&args.db)?;
    ensure_tables(&conn)?;
    info!(db = %args.db.display(), "database ready");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        options: LoadOptions {
            change_policy: args.policy,
            strict: args.strict,
            fact_versioning: args.fact_versioning,
        },
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/:entity/load", post(load_entity))
        .route("/:entity/stats", get(get_stats))
        .route("/:entity/audit", get(get_audit))
        .route("/:entity/history/*key", get(get_history))
        .with_state(state);

    let app = Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;

    println!("🚀 Server running on http://{}", args.bind);
    println!("   API: http://{}/api/agents/stats", args.bind);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
