//! Axum REST API handlers.

use std::sync::Arc;

use agri_lifecycle::{available_actions, Action, Address, Product, Role, Stage, StageStep};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::db::EventMirror;
use crate::dispatcher::Confirmation;
use crate::errors::{Result, TrackerError};
use crate::events::{TrailSummary, TransactionRecord};
use crate::projector::{self, LedgerProjector, ProgressionViolation};
use crate::session::{Session, SessionInfo};

#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<Session>,
    /// Event mirror, when the indexer is running.
    pub pool: Option<SqlitePool>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session", get(get_session))
        .route("/session/account", post(switch_account).delete(disconnect))
        .route("/session/reconnect", post(reconnect))
        .route("/products", get(list_products).post(register_product))
        .route("/products/:id", get(get_product))
        .route("/products/:id/progress", get(get_progress))
        .route("/products/:id/actions", get(get_actions).post(dispatch_action))
        .route("/products/:id/transactions", get(get_product_transactions))
        .route("/participants", post(register_participant))
        .route("/participants/:address", get(get_participant))
        .route("/transactions", get(get_transactions))
        .route("/transactions/summary", get(get_summary))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

fn status_for(err: &TrackerError) -> StatusCode {
    match err {
        TrackerError::Unauthorized(_) => StatusCode::FORBIDDEN,
        TrackerError::InvalidTransition(_)
        | TrackerError::TerminalState(_)
        | TrackerError::DuplicateParticipant(_)
        | TrackerError::AlreadyInProgress { .. } => StatusCode::CONFLICT,
        TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
        TrackerError::GatewayUnavailable(_) | TrackerError::NetworkMismatch { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TrackerError::Unknown { .. } | TrackerError::Unconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
        TrackerError::Rejected(_) | TrackerError::ActionFailed => StatusCode::UNPROCESSABLE_ENTITY,
        TrackerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        TrackerError::Http(_) => StatusCode::BAD_GATEWAY,
        TrackerError::Database(_)
        | TrackerError::Migrate(_)
        | TrackerError::Json(_)
        | TrackerError::Io(_)
        | TrackerError::Config(_)
        | TrackerError::NotDeployed(_)
        | TrackerError::EventParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for TrackerError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!("Request failed: {self}");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ledger_link: &'static str,
}

#[derive(Deserialize)]
pub struct AccountRequest {
    pub account: String,
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub search: Option<String>,
}

#[derive(Serialize)]
pub struct ProductsResponse {
    pub count: usize,
    pub products: Vec<ProductView>,
}

#[derive(Serialize)]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    pub stage_label: &'static str,
}

impl From<Product> for ProductView {
    fn from(product: Product) -> Self {
        let stage_label = product.stage.label();
        Self {
            product,
            stage_label,
        }
    }
}

#[derive(Serialize)]
pub struct ProgressResponse {
    pub product_id: u64,
    pub stage: Stage,
    pub steps: Vec<StageStep>,
}

#[derive(Deserialize)]
pub struct CallerParams {
    pub caller: Option<String>,
}

#[derive(Serialize)]
pub struct ActionsResponse {
    pub product_id: u64,
    pub caller: Option<Address>,
    pub role: Role,
    pub stage: Stage,
    pub actions: Vec<Action>,
}

#[derive(Deserialize)]
pub struct RegisterProductRequest {
    pub caller: Option<String>,
    pub name: String,
    pub description: String,
}

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub caller: Option<String>,
    pub action: String,
}

#[derive(Deserialize)]
pub struct RegisterParticipantRequest {
    pub caller: Option<String>,
    pub address: String,
    pub role: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Serialize)]
pub struct ParticipantView {
    pub address: Address,
    pub role: Role,
    pub name: Option<String>,
    pub location: Option<String>,
}

#[derive(Deserialize)]
pub struct SourceParams {
    pub source: Option<String>,
}

#[derive(Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub explorer_url: String,
}

#[derive(Serialize)]
pub struct TransactionsResponse {
    pub source: &'static str,
    pub count: usize,
    pub transactions: Vec<TransactionView>,
}

#[derive(Serialize)]
pub struct SummaryResponse {
    pub source: &'static str,
    #[serde(flatten)]
    pub summary: TrailSummary,
    pub violations: Vec<ProgressionViolation>,
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

/// Explicit caller, else the session's connected account.
async fn caller_or_session(state: &ApiState, caller: Option<&str>) -> Result<Address> {
    match caller {
        Some(raw) => Ok(Address::parse(raw)?),
        None => state
            .session
            .identity()
            .await
            .map(|identity| identity.account)
            .ok_or_else(|| TrackerError::InvalidInput("no caller given and no account connected".to_string())),
    }
}

fn projector_for(state: &ApiState, source: Option<&str>) -> Result<(&'static str, LedgerProjector)> {
    match source.unwrap_or("ledger") {
        "ledger" => Ok((
            "ledger",
            state.session.projector().with_source(Arc::new(
                crate::gateway::LedgerEvents(state.session.gateway()),
            )),
        )),
        "mirror" => {
            let pool = state
                .pool
                .clone()
                .ok_or_else(|| TrackerError::InvalidInput("event mirror is not enabled".to_string()))?;
            Ok((
                "mirror",
                state
                    .session
                    .projector()
                    .with_source(Arc::new(EventMirror::new(pool))),
            ))
        }
        other => Err(TrackerError::InvalidInput(format!(
            "unknown source {other:?}, expected ledger or mirror"
        ))),
    }
}

fn views(session: &Session, records: Vec<TransactionRecord>) -> Vec<TransactionView> {
    records
        .into_iter()
        .map(|record| TransactionView {
            explorer_url: session.explorer_url(&record.tx_hash),
            record,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ledger_link: if state.session.health().is_halted() {
            "halted"
        } else {
            "up"
        },
    })
}

/// `GET /session`
pub async fn get_session(State(state): State<Arc<ApiState>>) -> Json<SessionInfo> {
    Json(state.session.info().await)
}

/// `POST /session/account`
pub async fn switch_account(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AccountRequest>,
) -> Result<Json<SessionInfo>> {
    let account = Address::parse(&req.account)?;
    state.session.switch_account(account).await?;
    Ok(Json(state.session.info().await))
}

/// `DELETE /session/account`
pub async fn disconnect(State(state): State<Arc<ApiState>>) -> Json<SessionInfo> {
    state.session.disconnect().await;
    Json(state.session.info().await)
}

/// `POST /session/reconnect`
pub async fn reconnect(State(state): State<Arc<ApiState>>) -> Result<Json<SessionInfo>> {
    state.session.reconnect().await?;
    Ok(Json(state.session.info().await))
}

/// `GET /products?search=`
pub async fn list_products(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<ProductsResponse>> {
    let store = state.session.store();
    let products = match params.search.as_deref() {
        Some(needle) => store.search(needle).await?,
        None => store.list_all().await?,
    };
    Ok(Json(ProductsResponse {
        count: products.len(),
        products: products.into_iter().map(ProductView::from).collect(),
    }))
}

/// `GET /products/:id`
pub async fn get_product(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
) -> Result<Json<ProductView>> {
    Ok(Json(state.session.store().get(id).await?.into()))
}

/// `GET /products/:id/progress`
pub async fn get_progress(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
) -> Result<Json<ProgressResponse>> {
    let stage = state.session.store().refresh_stage(id).await?;
    Ok(Json(ProgressResponse {
        product_id: id,
        stage,
        steps: stage.progress(),
    }))
}

/// `GET /products/:id/actions?caller=`
///
/// Actions the caller's role may take on the product right now.
pub async fn get_actions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
    Query(params): Query<CallerParams>,
) -> Result<Json<ActionsResponse>> {
    let caller = match params.caller.as_deref() {
        Some(raw) => Some(Address::parse(raw)?),
        None => state.session.identity().await.map(|i| i.account),
    };
    let role = match &caller {
        Some(address) => state.session.registry().resolve_role(address).await?,
        None => Role::Guest,
    };
    let stage = state.session.store().refresh_stage(id).await?;
    Ok(Json(ActionsResponse {
        product_id: id,
        caller,
        role,
        stage,
        actions: available_actions(stage, role),
    }))
}

/// `POST /products`
pub async fn register_product(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterProductRequest>,
) -> Result<(StatusCode, Json<ProductView>)> {
    let caller = caller_or_session(&state, req.caller.as_deref()).await?;
    let product = state
        .session
        .dispatcher()
        .register_product(&caller, &req.name, &req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(product.into())))
}

/// `POST /products/:id/actions`
pub async fn dispatch_action(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
    Json(req): Json<DispatchRequest>,
) -> Result<Json<Confirmation>> {
    let action: Action = req
        .action
        .parse()
        .map_err(|e| TrackerError::InvalidInput(format!("{e}")))?;
    let caller = caller_or_session(&state, req.caller.as_deref()).await?;
    let confirmation = state
        .session
        .dispatcher()
        .dispatch(id, action, &caller)
        .await?;
    Ok(Json(confirmation))
}

/// `GET /participants/:address`
pub async fn get_participant(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Result<Json<ParticipantView>> {
    let address = Address::parse(&address)?;
    let registry = state.session.registry();
    let role = registry.resolve_role(&address).await?;
    let profile = match registry.resolve_profile(&address).await {
        Ok(profile) => Some(profile),
        Err(TrackerError::NotFound(_)) if role == Role::Owner => None,
        Err(e) => return Err(e),
    };
    Ok(Json(ParticipantView {
        address,
        role,
        name: profile.as_ref().map(|p| p.name.clone()),
        location: profile.map(|p| p.location),
    }))
}

/// `POST /participants`
pub async fn register_participant(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<RegisterParticipantRequest>,
) -> Result<(StatusCode, Json<ParticipantView>)> {
    let caller = caller_or_session(&state, req.caller.as_deref()).await?;
    let address = Address::parse(&req.address)?;
    let role: Role = req
        .role
        .parse()
        .map_err(|e| TrackerError::InvalidInput(format!("{e}")))?;
    let participant = state
        .session
        .registry()
        .register(&caller, &address, role, &req.name, &req.location)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ParticipantView {
            address: participant.address,
            role: participant.role,
            name: Some(participant.name),
            location: Some(participant.location),
        }),
    ))
}

/// `GET /transactions?source=ledger|mirror`
pub async fn get_transactions(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SourceParams>,
) -> Result<Json<TransactionsResponse>> {
    let (source, projector) = projector_for(&state, params.source.as_deref())?;
    let records = projector.rebuild_all().await?;
    Ok(Json(TransactionsResponse {
        source,
        count: records.len(),
        transactions: views(&state.session, records),
    }))
}

/// `GET /products/:id/transactions`
pub async fn get_product_transactions(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u64>,
    Query(params): Query<SourceParams>,
) -> Result<Json<TransactionsResponse>> {
    let (source, projector) = projector_for(&state, params.source.as_deref())?;
    let records = projector.history(id).await?;
    Ok(Json(TransactionsResponse {
        source,
        count: records.len(),
        transactions: views(&state.session, records),
    }))
}

/// `GET /transactions/summary`
pub async fn get_summary(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SourceParams>,
) -> Result<Json<SummaryResponse>> {
    let (source, projector) = projector_for(&state, params.source.as_deref())?;
    let records = projector.rebuild_all().await?;
    Ok(Json(SummaryResponse {
        source,
        summary: projector::summarize(&records),
        violations: projector::verify_progression(&records, true),
    }))
}
