//! HTTP surface of a CertChain node
//!
//! Serves the peer wire contract (`/chain`, `/block`, `/credits/:wallet/sync`,
//! `/credits/:wallet/update`) next to the service endpoints used by wallets
//! and administrators.

use axum::{
    extract::{Path, Request, State},
    http::{self, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::blockchain::Block;
use crate::credit::{BankStats, BankTransaction, CreditGrant, CreditToken, LedgerInfo, TransferOutcome};
use crate::error::ChainError;
use crate::node::{CertNode, CertificateReceipt, WalletSummary};
use crate::sync::{
    BlockSubmission, BlockSubmissionResponse, BroadcastResult, ChainResponse, WalletTokensResponse,
    WalletUpdateRequest, WalletUpdateResponse,
};

const ADMIN_KEY_HEADER: &str = "x-api-key";
const ADMIN_TRANSACTION_LIMIT: usize = 50;

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<CertNode>,
    stats: Arc<RwLock<ApiStats>>,
}

impl ApiState {
    pub fn new(node: Arc<CertNode>) -> Self {
        Self {
            node,
            stats: Arc::new(RwLock::new(ApiStats::new())),
        }
    }
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
    NotFound(String),
    Unauthorized,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    available: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<usize>,
}

impl ErrorResponse {
    fn new(error: String) -> Self {
        Self {
            success: false,
            error,
            available: None,
            required: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Chain(e) => match e {
                ChainError::InsufficientCredits { available, required } => (
                    StatusCode::PAYMENT_REQUIRED,
                    ErrorResponse {
                        available: Some(available),
                        required: Some(required),
                        ..ErrorResponse::new(e.to_string())
                    },
                ),
                ChainError::InsufficientTokens { available, required } => (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse {
                        available: Some(available),
                        required: Some(required),
                        ..ErrorResponse::new(e.to_string())
                    },
                ),
                ChainError::TokenNotFound(_) => (StatusCode::NOT_FOUND, ErrorResponse::new(e.to_string())),
                ChainError::InvalidBlock(_)
                | ChainError::AlreadySpent(_)
                | ChainError::EmptyPendingBuffer
                | ChainError::InvalidInput(_) => (StatusCode::BAD_REQUEST, ErrorResponse::new(e.to_string())),
                ChainError::NetworkError(_)
                | ChainError::PersistenceError(_)
                | ChainError::IoError(_)
                | ChainError::SerializationError(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(e.to_string()))
                }
            },
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new("Unauthorized: Valid API key required for admin actions".to_string()),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub wallet_id: String,
    pub amount: usize,
    #[serde(default)]
    pub payment_reference: Option<String>,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub wallet_id: String,
    pub amount: usize,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct TransferRequest {
    pub from_wallet_id: String,
    pub to_wallet_id: String,
    pub amount: usize,
}

#[derive(Deserialize)]
pub struct CertificateRequest {
    pub certificate: serde_json::Value,
    #[serde(default)]
    pub wallet_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RegisterNodesRequest {
    pub nodes: Vec<String>,
}

#[derive(Deserialize)]
pub struct RegisterWalletRequest {
    pub wallet_id: String,
}

#[derive(Serialize)]
struct GrantResponse {
    success: bool,
    message: String,
    #[serde(flatten)]
    grant: CreditGrant,
}

#[derive(Serialize)]
struct WalletTokenDetail {
    wallet_id: String,
    token_count: usize,
    available_count: usize,
    tokens: Vec<CreditToken>,
}

#[derive(Serialize)]
struct TransactionsResponse {
    transaction_count: usize,
    transactions: Vec<BankTransaction>,
}

#[derive(Serialize)]
struct AdminTransactionsResponse {
    transaction_count: usize,
    transactions: Vec<BankTransaction>,
    stats: BankStats,
}

#[derive(Serialize)]
struct CertificateResponse {
    message: String,
    #[serde(flatten)]
    receipt: CertificateReceipt,
}

#[derive(Serialize)]
struct MineResponse {
    message: String,
    block: Block,
    broadcast: BroadcastResult,
}

#[derive(Serialize)]
struct NodesResponse {
    nodes: Vec<String>,
}

#[derive(Serialize)]
struct ResolveResponse {
    message: String,
    replaced: bool,
    chain: Vec<Block>,
}

#[derive(Serialize)]
struct WalletsResponse {
    wallet_count: usize,
    wallets: Vec<WalletSummary>,
}

#[derive(Serialize)]
struct LedgerInfoResponse {
    ledger_info: LedgerInfo,
    wallets: Vec<WalletSummary>,
}

#[derive(Serialize)]
struct ApiStatsResponse {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    uptime_seconds: u64,
}

fn require_wallet_id(wallet_id: &str) -> Result<(), ApiError> {
    if wallet_id.trim().is_empty() {
        return Err(ApiError::InvalidInput("Wallet ID is required".to_string()));
    }
    Ok(())
}

fn require_amount(amount: usize, max: usize) -> Result<(), ApiError> {
    if amount == 0 {
        return Err(ApiError::InvalidInput("Amount must be positive".to_string()));
    }
    if amount > max {
        return Err(ApiError::InvalidInput(format!("Amount must not exceed {}", max)));
    }
    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Request statistics middleware
async fn stats_middleware(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;

    let success = response.status().is_success();
    state.stats.write().await.record_request(success);

    response
}

/// Detailed request logging middleware. Logs method, path, status, duration
/// and current `NodeState`.
async fn logging_middleware(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();
    let node_state = state.node.state().await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        node_state = ?node_state,
        "api.request"
    );

    response
}

/// Admin routes need the configured key in `x-api-key`. An empty key turns
/// the check off.
async fn admin_auth_middleware(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let expected = &state.node.config().node.admin_api_key;
    if !expected.is_empty() {
        let supplied = req.headers().get(ADMIN_KEY_HEADER).and_then(|v| v.to_str().ok());
        if supplied != Some(expected.as_str()) {
            return ApiError::Unauthorized.into_response();
        }
    }
    next.run(req).await
}

// ============================================================================
// API Server
// ============================================================================

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(vec![
            http::header::CONTENT_TYPE,
            http::HeaderName::from_static(ADMIN_KEY_HEADER),
        ])
        .allow_credentials(true)
}

/// Build the API router with all endpoints (for testing)
pub fn build_api_router(node: Arc<CertNode>) -> Router {
    let state = ApiState::new(node);

    let admin_routes = Router::new()
        .route("/admin/credits/issue", post(admin_issue_credits))
        .route("/admin/transactions", get(admin_transactions))
        .route("/admin/reset-credits", post(admin_reset_credits))
        .route("/reset", post(reset_chain))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        // Peer wire contract
        .route("/chain", get(get_chain))
        .route("/block", post(receive_block))
        .route("/credits/:wallet_id/sync", get(get_wallet_sync))
        .route("/credits/:wallet_id/update", post(update_wallet_from_peer))
        // Chain
        .route("/block/:index", get(get_block))
        .route("/certificates", post(submit_certificate))
        .route("/mine", post(mine_block))
        .route("/wallet/:student_id", get(get_student_certificates))
        // Credits
        .route("/credits/purchase", post(purchase_credits))
        .route("/credits/transfer", post(transfer_credits))
        .route("/credits/transactions/:wallet_id", get(get_wallet_transactions))
        .route("/credits/:wallet_id", get(get_wallet_balance))
        .route("/credits/:wallet_id/tokens", get(get_wallet_tokens))
        .route("/wallets", get(list_wallets))
        .route("/wallets/register", post(register_wallet))
        .route("/ledger/info", get(ledger_info))
        // Peers
        .route("/nodes", get(list_nodes))
        .route("/nodes/register", post(register_nodes))
        .route("/nodes/resolve", get(resolve_nodes))
        // System
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        .merge(admin_routes)
        // logging before stats so we always record timing and node-state
        .layer(middleware::from_fn_with_state(state.clone(), logging_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), stats_middleware))
        .with_state(state)
        .layer(cors_layer())
}

/// Serve the router on `addr` until `shutdown` resolves.
pub async fn run_api_server<F>(node: Arc<CertNode>, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_api_router(node.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Node {} running on {}", node.config().node.node_id, addr);
    info!("Public URL configured as: {}", node.config().node.public_url);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn get_chain(State(state): State<ApiState>) -> Json<ChainResponse> {
    let (chain, length) = state.node.chain_snapshot().await;
    Json(ChainResponse { chain, length })
}

async fn receive_block(
    State(state): State<ApiState>,
    Json(submission): Json<BlockSubmission>,
) -> (StatusCode, Json<BlockSubmissionResponse>) {
    let index = submission.block.index;
    if state.node.accept_block_from_peer(submission.block).await {
        (
            StatusCode::OK,
            Json(BlockSubmissionResponse {
                accepted: true,
                message: format!("Block {} added to chain", index),
            }),
        )
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(BlockSubmissionResponse {
                accepted: false,
                message: format!("Block {} rejected", index),
            }),
        )
    }
}

async fn get_wallet_sync(State(state): State<ApiState>, Path(wallet_id): Path<String>) -> Json<WalletTokensResponse> {
    let tokens = state.node.wallet_tokens(&wallet_id).await;
    Json(WalletTokensResponse {
        wallet_id,
        token_count: tokens.len(),
        tokens,
    })
}

async fn update_wallet_from_peer(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
    Json(request): Json<WalletUpdateRequest>,
) -> Json<WalletUpdateResponse> {
    Json(state.node.receive_wallet_update(&wallet_id, request.tokens).await)
}

async fn get_block(State(state): State<ApiState>, Path(index): Path<u64>) -> Result<Json<Block>, ApiError> {
    state
        .node
        .get_block(index)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Block {} not found", index)))
}

async fn submit_certificate(
    State(state): State<ApiState>,
    Json(request): Json<CertificateRequest>,
) -> Result<(StatusCode, Json<CertificateResponse>), ApiError> {
    if request.certificate.is_null() {
        return Err(ApiError::InvalidInput("Certificate data is required".to_string()));
    }
    let receipt = state
        .node
        .submit_certificate(request.certificate, request.wallet_id.as_deref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CertificateResponse {
            message: "Certificate added to pending certificates".to_string(),
            receipt,
        }),
    ))
}

async fn mine_block(State(state): State<ApiState>) -> Result<Json<MineResponse>, ApiError> {
    let (block, broadcast) = state.node.seal_and_broadcast().await?;
    Ok(Json(MineResponse {
        message: "New block created".to_string(),
        block,
        broadcast,
    }))
}

async fn get_student_certificates(
    State(state): State<ApiState>,
    Path(student_id): Path<String>,
) -> Json<serde_json::Value> {
    let certificates = state.node.certificates_for_student(&student_id).await;
    Json(serde_json::json!({
        "student_id": student_id,
        "certificate_count": certificates.len(),
        "certificates": certificates,
    }))
}

async fn get_wallet_balance(State(state): State<ApiState>, Path(wallet_id): Path<String>) -> Json<WalletSummary> {
    state.node.sync_wallet_with_peers(&wallet_id).await;
    Json(state.node.wallet_summary(&wallet_id).await)
}

async fn get_wallet_tokens(State(state): State<ApiState>, Path(wallet_id): Path<String>) -> Json<WalletTokenDetail> {
    state.node.sync_wallet_with_peers(&wallet_id).await;
    let tokens = state.node.wallet_tokens(&wallet_id).await;
    Json(WalletTokenDetail {
        token_count: tokens.len(),
        available_count: tokens.iter().filter(|t| !t.spent).count(),
        wallet_id,
        tokens,
    })
}

async fn purchase_credits(
    State(state): State<ApiState>,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<GrantResponse>), ApiError> {
    require_wallet_id(&request.wallet_id)?;
    require_amount(request.amount, state.node.config().chain.max_credit_amount)?;

    let grant = state
        .node
        .purchase_credits(&request.wallet_id, request.amount, request.payment_reference)
        .await;
    state.node.broadcast_wallet_update(&request.wallet_id).await;

    Ok((
        StatusCode::CREATED,
        Json(GrantResponse {
            success: true,
            message: format!("Issued {} credit tokens to wallet {}", request.amount, request.wallet_id),
            grant,
        }),
    ))
}

async fn transfer_credits(
    State(state): State<ApiState>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferOutcome>, ApiError> {
    require_wallet_id(&request.from_wallet_id)?;
    require_wallet_id(&request.to_wallet_id)?;
    require_amount(request.amount, state.node.config().chain.max_credit_amount)?;

    tokio::join!(
        state.node.sync_wallet_with_peers(&request.from_wallet_id),
        state.node.sync_wallet_with_peers(&request.to_wallet_id),
    );
    let outcome = state
        .node
        .transfer_tokens(&request.from_wallet_id, &request.to_wallet_id, request.amount)
        .await?;
    tokio::join!(
        state.node.broadcast_wallet_update(&request.from_wallet_id),
        state.node.broadcast_wallet_update(&request.to_wallet_id),
    );
    Ok(Json(outcome))
}

async fn get_wallet_transactions(
    State(state): State<ApiState>,
    Path(wallet_id): Path<String>,
) -> Json<TransactionsResponse> {
    let transactions = state.node.transaction_history(Some(&wallet_id)).await;
    Json(TransactionsResponse {
        transaction_count: transactions.len(),
        transactions,
    })
}

async fn list_wallets(State(state): State<ApiState>) -> Json<WalletsResponse> {
    let wallets = state.node.wallets().await;
    Json(WalletsResponse {
        wallet_count: wallets.len(),
        wallets,
    })
}

async fn register_wallet(
    State(state): State<ApiState>,
    Json(request): Json<RegisterWalletRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    require_wallet_id(&request.wallet_id)?;
    let created = state.node.register_wallet(&request.wallet_id).await;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "success": true,
            "message": format!("Wallet {} registered", request.wallet_id),
            "wallet_id": request.wallet_id,
            "created": created,
        })),
    ))
}

async fn ledger_info(State(state): State<ApiState>) -> Json<LedgerInfoResponse> {
    Json(LedgerInfoResponse {
        ledger_info: state.node.ledger_info().await,
        wallets: state.node.wallets().await,
    })
}

async fn list_nodes(State(state): State<ApiState>) -> Json<NodesResponse> {
    Json(NodesResponse {
        nodes: state.node.peers().urls(),
    })
}

async fn register_nodes(
    State(state): State<ApiState>,
    Json(request): Json<RegisterNodesRequest>,
) -> Json<serde_json::Value> {
    let added = state.node.register_peers(&request.nodes);
    Json(serde_json::json!({
        "message": "New nodes have been added",
        "added": added,
        "total_nodes": state.node.peers().urls(),
    }))
}

async fn resolve_nodes(State(state): State<ApiState>) -> Json<ResolveResponse> {
    let replaced = state.node.resolve_conflicts().await;
    let (chain, _) = state.node.chain_snapshot().await;
    let message = if replaced {
        "Our chain was replaced"
    } else {
        "Our chain is authoritative"
    };
    Json(ResolveResponse {
        message: message.to_string(),
        replaced,
        chain,
    })
}

async fn health_check(State(state): State<ApiState>) -> Response {
    let mut response = Json(state.node.health().await).into_response();
    response
        .headers_mut()
        .insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn get_api_stats(State(state): State<ApiState>) -> Json<ApiStatsResponse> {
    let stats = state.stats.read().await;
    Json(ApiStatsResponse {
        total_requests: stats.total_requests,
        successful_requests: stats.successful_requests,
        failed_requests: stats.failed_requests,
        uptime_seconds: stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
    })
}

async fn admin_issue_credits(
    State(state): State<ApiState>,
    Json(request): Json<IssueRequest>,
) -> Result<(StatusCode, Json<GrantResponse>), ApiError> {
    require_wallet_id(&request.wallet_id)?;
    require_amount(request.amount, state.node.config().chain.max_credit_amount)?;

    let grant = state
        .node
        .issue_tokens(&request.wallet_id, request.amount, request.reason)
        .await;
    state.node.broadcast_wallet_update(&request.wallet_id).await;

    Ok((
        StatusCode::CREATED,
        Json(GrantResponse {
            success: true,
            message: format!("Issued {} credit tokens to wallet {}", request.amount, request.wallet_id),
            grant,
        }),
    ))
}

async fn admin_transactions(State(state): State<ApiState>) -> Json<AdminTransactionsResponse> {
    let all = state.node.transaction_history(None).await;
    let transaction_count = all.len();
    let transactions = all.into_iter().rev().take(ADMIN_TRANSACTION_LIMIT).collect();
    Json(AdminTransactionsResponse {
        transaction_count,
        transactions,
        stats: state.node.bank_stats().await,
    })
}

async fn admin_reset_credits(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let backup = state.node.reset_credits().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Credit ledger has been reset",
        "backup": backup,
    })))
}

async fn reset_chain(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let genesis_block = state.node.reset_chain().await;
    Json(serde_json::json!({
        "message": "Chain reset to genesis block",
        "genesis_block": genesis_block,
    }))
}
