//! HTTP API
//!
//! Chain watchers, validators and operators all talk to the coordinator here:
//!
//! | Route | Caller |
//! |---|---|
//! | `POST /v1/deposits` | watcher: report a deposit and its confirmations |
//! | `POST /v1/transactions/{id}/execution` | watcher: target-chain result for an attempt |
//! | `GET /v1/transactions/{id}`, `/by-source/{bridge}/{hash}`, `/{id}/attestations` | anyone |
//! | `GET /v1/validators/{id}/requests` | validator: work still waiting on it |
//! | `POST /v1/validators/{id}/heartbeat` | validator: timestamp signed with its key |
//! | `POST /v1/attestations` | validator: signed payload hash |
//! | `GET /v1/bridges[/{id}[/tokens\|/validators]]` | anyone |
//! | `/v1/admin/*` | operator, bearer token; not mounted without `ADMIN_TOKEN` |
//! | `/health`, `/healthz`, `/readyz`, `/metrics` | monitoring |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use bridge_common::{BridgeStatus, TransactionStatus};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coordinator::TransactionCoordinator;
use crate::db::PersistenceStore;
use crate::error::BridgeError;
use crate::metrics;
use crate::models::{
    Attestation, AttestationRequest, Bridge, BridgeTransaction, BridgeUpdate, Deposit,
    ExecutionOutcome, NewBridge, NewToken, SupportedToken, TokenUpdate, Validator,
};
use crate::registry::BridgeRegistry;
use crate::tokens::TokenRegistry;
use crate::validators::ValidatorSet;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TransactionCoordinator>,
    pub bridges: Arc<BridgeRegistry>,
    pub validators: Arc<ValidatorSet>,
    pub tokens: Arc<TokenRegistry>,
    pub store: Arc<dyn PersistenceStore>,
    pub admin_token: Option<Arc<str>>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, BridgeError>;

// ============================================================================
// Watchers
// ============================================================================

async fn report_deposit(
    State(state): State<AppState>,
    Json(deposit): Json<Deposit>,
) -> ApiResult<BridgeTransaction> {
    Ok(Json(state.coordinator.report_deposit(&deposit).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExecutionReport {
    pub attempt_id: i64,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Serialize)]
struct ExecutionResponse {
    transaction: BridgeTransaction,
    refund_required: bool,
}

async fn report_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(report): Json<ExecutionReport>,
) -> ApiResult<ExecutionResponse> {
    let result = state
        .coordinator
        .report_target_execution_result(id, report.attempt_id, report.outcome)
        .await?;
    Ok(Json(ExecutionResponse {
        refund_required: result.refund.is_some() || result.transaction.refund_required,
        transaction: result.transaction,
    }))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<BridgeTransaction> {
    Ok(Json(state.coordinator.get(id).await?))
}

async fn get_transaction_by_source(
    State(state): State<AppState>,
    Path((bridge_id, source_tx_hash)): Path<(i64, String)>,
) -> ApiResult<BridgeTransaction> {
    Ok(Json(
        state
            .coordinator
            .find_by_source(bridge_id, &source_tx_hash)
            .await?,
    ))
}

async fn list_attestations(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Attestation>> {
    Ok(Json(state.coordinator.attestations(id).await?))
}

// ============================================================================
// Validators
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitAttestation {
    pub transaction_id: i64,
    pub validator_id: i64,
    pub signature: String,
}

#[derive(Debug, Serialize)]
struct AttestationResponse {
    accepted: bool,
    attestation_count: i64,
    status: TransactionStatus,
}

async fn submit_attestation(
    State(state): State<AppState>,
    Json(body): Json<SubmitAttestation>,
) -> ApiResult<AttestationResponse> {
    let outcome = state
        .coordinator
        .submit_attestation(body.transaction_id, body.validator_id, &body.signature)
        .await?;
    Ok(Json(AttestationResponse {
        accepted: outcome.accepted,
        attestation_count: outcome.attestation_count,
        status: outcome.transaction.status,
    }))
}

async fn pending_requests(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<AttestationRequest>> {
    Ok(Json(state.coordinator.pending_requests_for(id).await?))
}

/// Unix seconds, signed over `compute_heartbeat_hash(validator_id, timestamp)`
#[derive(Debug, Deserialize)]
pub struct SignedHeartbeat {
    pub timestamp: i64,
    pub signature: String,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SignedHeartbeat>,
) -> ApiResult<Validator> {
    Ok(Json(
        state
            .validators
            .signed_heartbeat(id, body.timestamp, &body.signature)
            .await?,
    ))
}

// ============================================================================
// Configuration reads
// ============================================================================

async fn list_bridges(State(state): State<AppState>) -> ApiResult<Vec<Bridge>> {
    Ok(Json(state.bridges.list().await?))
}

async fn get_bridge(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Bridge> {
    Ok(Json(state.bridges.get(id).await?))
}

async fn list_tokens(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<SupportedToken>> {
    Ok(Json(state.tokens.list(id).await?))
}

async fn list_validators(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<Validator>> {
    Ok(Json(state.validators.list(id).await?))
}

// ============================================================================
// Admin
// ============================================================================

/// Compare without short-circuiting on the first differing byte
fn token_matches(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match (state.admin_token.as_deref(), presented) {
        (Some(expected), Some(token)) if token_matches(expected, token) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized",
                message: "missing or invalid admin token".to_string(),
            }),
        )
            .into_response(),
    }
}

async fn create_bridge(
    State(state): State<AppState>,
    Json(bridge): Json<NewBridge>,
) -> Result<(StatusCode, Json<Bridge>), BridgeError> {
    Ok((StatusCode::CREATED, Json(state.bridges.create(bridge).await?)))
}

async fn update_bridge(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<BridgeUpdate>,
) -> ApiResult<Bridge> {
    Ok(Json(state.bridges.update(id, update).await?))
}

#[derive(Debug, Deserialize)]
pub struct SetBridgeStatus {
    pub status: BridgeStatus,
}

async fn set_bridge_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<SetBridgeStatus>,
) -> ApiResult<Bridge> {
    Ok(Json(state.bridges.set_status(id, body.status).await?))
}

#[derive(Debug, Deserialize)]
pub struct RegisterValidator {
    pub address: String,
    pub public_key: String,
}

async fn register_validator(
    State(state): State<AppState>,
    Path(bridge_id): Path<i64>,
    Json(body): Json<RegisterValidator>,
) -> Result<(StatusCode, Json<Validator>), BridgeError> {
    let validator = state
        .validators
        .register(bridge_id, &body.address, &body.public_key)
        .await?;
    Ok((StatusCode::CREATED, Json(validator)))
}

#[derive(Debug, Deserialize)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: String,
}

async fn suspend_validator(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ReasonBody>,
) -> ApiResult<Validator> {
    Ok(Json(state.validators.suspend(id, &body.reason).await?))
}

#[derive(Debug, Deserialize)]
pub struct RotateKey {
    pub public_key: String,
}

async fn rotate_validator_key(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<RotateKey>,
) -> ApiResult<Validator> {
    Ok(Json(state.validators.rotate_key(id, &body.public_key).await?))
}

async fn add_token(
    State(state): State<AppState>,
    Path(bridge_id): Path<i64>,
    Json(token): Json<NewToken>,
) -> Result<(StatusCode, Json<SupportedToken>), BridgeError> {
    Ok((StatusCode::CREATED, Json(state.tokens.add(bridge_id, token).await?)))
}

async fn update_token(
    State(state): State<AppState>,
    Path((bridge_id, symbol)): Path<(i64, String)>,
    Json(update): Json<TokenUpdate>,
) -> ApiResult<SupportedToken> {
    Ok(Json(state.tokens.update(bridge_id, &symbol, update).await?))
}

async fn enable_token(
    State(state): State<AppState>,
    Path((bridge_id, symbol)): Path<(i64, String)>,
) -> ApiResult<SupportedToken> {
    Ok(Json(state.tokens.set_enabled(bridge_id, &symbol, true).await?))
}

async fn disable_token(
    State(state): State<AppState>,
    Path((bridge_id, symbol)): Path<(i64, String)>,
) -> ApiResult<SupportedToken> {
    Ok(Json(state.tokens.set_enabled(bridge_id, &symbol, false).await?))
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ReasonBody>,
) -> ApiResult<BridgeTransaction> {
    Ok(Json(state.coordinator.cancel(id, &body.reason).await?))
}

// ============================================================================
// Health and metrics
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub store_ok: bool,
    pub bridges: usize,
    pub pending: Vec<StatusCount>,
}

#[derive(Debug, Serialize)]
pub struct StatusCount {
    pub status: TransactionStatus,
    pub count: i64,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store_ok = state.store.ping().await.is_ok();
    let bridges = state.bridges.list().await.map(|b| b.len()).unwrap_or(0);

    let mut pending = Vec::new();
    for status in TransactionStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
        if let Ok(count) = state.coordinator.count_by_status(status).await {
            pending.push(StatusCount { status, count });
        }
    }

    Json(HealthResponse {
        status: if store_ok { "healthy" } else { "degraded" }.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        store_ok,
        bridges,
        pending,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness probe (the store must answer)
async fn readiness(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => "OK".into_response(),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response()
        }
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

/// Build the full router. Admin routes are only mounted when a token is configured.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/v1/deposits", post(report_deposit))
        .route("/v1/transactions/{id}", get(get_transaction))
        .route("/v1/transactions/{id}/attestations", get(list_attestations))
        .route("/v1/transactions/{id}/execution", post(report_execution))
        .route(
            "/v1/transactions/by-source/{bridge_id}/{source_tx_hash}",
            get(get_transaction_by_source),
        )
        .route("/v1/attestations", post(submit_attestation))
        .route("/v1/validators/{id}/requests", get(pending_requests))
        .route("/v1/validators/{id}/heartbeat", post(heartbeat))
        .route("/v1/bridges", get(list_bridges))
        .route("/v1/bridges/{id}", get(get_bridge))
        .route("/v1/bridges/{id}/tokens", get(list_tokens))
        .route("/v1/bridges/{id}/validators", get(list_validators));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/bridges", post(create_bridge))
            .route("/bridges/{id}", patch(update_bridge))
            .route("/bridges/{id}/status", post(set_bridge_status))
            .route("/bridges/{id}/validators", post(register_validator))
            .route("/bridges/{id}/tokens", post(add_token))
            .route("/bridges/{id}/tokens/{symbol}", patch(update_token))
            .route("/bridges/{id}/tokens/{symbol}/enable", post(enable_token))
            .route("/bridges/{id}/tokens/{symbol}/disable", post(disable_token))
            .route("/validators/{id}/suspend", post(suspend_validator))
            .route("/validators/{id}/rotate-key", post(rotate_validator_key))
            .route("/transactions/{id}/cancel", post(cancel_transaction))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        app = app.nest("/v1/admin", admin);
    }

    app.with_state(state)
}

/// Start the HTTP server
pub async fn start_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let admin_enabled = state.admin_token.is_some();
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health  - Full health status (JSON)");
    info!("  /metrics - Prometheus metrics");
    if !admin_enabled {
        warn!("ADMIN_TOKEN not set, /v1/admin routes disabled");
    }

    metrics::UP.set(1.0);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
