//! Relay HTTP server
//!
//! The receiving side of the ticket protocol, plus health and metrics.
//!
//! # Routes
//!
//! - `POST /ticket` - Request an upload ticket (body: `{"from": ..., "to": ...}`)
//! - `POST /ticket/{id}/proof` - Submit a solved puzzle (body: `{"proof": ...}`)
//! - `POST /incoming/{ticket}/header` - Upload the message header (JSON)
//! - `POST /incoming/{ticket}/catalog` - Upload the encrypted catalog (bytes)
//! - `POST /incoming/{ticket}/block/{id}` - Upload one encrypted block or attachment (bytes)
//! - `POST /incoming/{ticket}/complete` - Queue the uploaded message for delivery
//! - `DELETE /incoming/{ticket}` - Drop an upload and its ticket
//! - `GET /health` - Liveness
//! - `GET /metrics` - Prometheus metrics

mod tickets;

pub use tickets::TicketStore;

use crate::account::AccountRepository;
use crate::address::AddressHash;
use crate::config::RelayConfig;
use crate::dispatcher::Intake;
use crate::envelope::{verify_checksums, EncryptedPart};
use crate::message::{Header, MessageArtifacts, MessageId};
use crate::metrics;
use crate::pow::ProofOfWork;
use crate::queue::{QueueError, QueueStore, Section};
use crate::transport::{ErrorResponse, ProofSubmission, Ticket, TicketRequest};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Size of the random puzzle challenge
const CHALLENGE_SIZE: usize = 32;

/// Server and ticket store errors
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt ticket record: {0}")]
    Corrupt(String),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations
pub type Result<T> = std::result::Result<T, TicketError>;

/// How tickets are handed out
#[derive(Debug, Clone)]
pub struct TicketPolicy {
    /// Puzzle difficulty; zero issues every ticket pre-authorised
    pub pow_bits: u32,
    pub ticket_ttl: Duration,
    pub trusted_senders: HashSet<AddressHash>,
    pub max_body_size: usize,
}

impl Default for TicketPolicy {
    fn default() -> Self {
        let config = RelayConfig::default();
        Self::from_config(&config)
    }
}

impl TicketPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            pow_bits: config.pow.bits,
            ticket_ttl: Duration::from_secs(config.pow.ticket_ttl_secs),
            trusted_senders: config.trusted_senders.iter().cloned().collect(),
            max_body_size: config.server.max_body_size,
        }
    }

    fn issue(&self, request: &TicketRequest) -> Ticket {
        let ttl = chrono::Duration::from_std(self.ticket_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let pre_authorised = self.pow_bits == 0 || self.trusted_senders.contains(&request.from);

        let pow = (!pre_authorised).then(|| {
            let mut challenge = vec![0u8; CHALLENGE_SIZE];
            rand::thread_rng().fill_bytes(&mut challenge);
            ProofOfWork::new(self.pow_bits, challenge, 0)
        });

        Ticket {
            id: Uuid::new_v4(),
            from: request.from.clone(),
            to: request.to.clone(),
            valid: pre_authorised,
            expires_at: Utc::now() + ttl,
            message_id: MessageId::new(),
            pow,
        }
    }
}

/// Parts received so far under one ticket
#[derive(Debug, Default)]
struct StagedUpload {
    header: Option<Header>,
    catalog: Option<Vec<u8>>,
    parts: BTreeMap<Uuid, Vec<u8>>,
}

/// Shared server state
struct AppState {
    policy: TicketPolicy,
    tickets: Mutex<TicketStore>,
    uploads: Mutex<HashMap<Uuid, StagedUpload>>,
    queue: Arc<dyn QueueStore>,
    accounts: Arc<dyn AccountRepository>,
    intake: Intake,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "Request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Relay HTTP server
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(
        policy: TicketPolicy,
        tickets: TicketStore,
        queue: Arc<dyn QueueStore>,
        accounts: Arc<dyn AccountRepository>,
        intake: Intake,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                policy,
                tickets: Mutex::new(tickets),
                uploads: Mutex::new(HashMap::new()),
                queue,
                accounts,
                intake,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Self::build_router(self.state.clone())
    }

    fn build_router(state: Arc<AppState>) -> Router {
        let max_body_size = state.policy.max_body_size;

        Router::new()
            .route("/health", get(health))
            .route("/metrics", get(metrics_text))
            .route("/ticket", post(request_ticket))
            .route("/ticket/{id}/proof", post(submit_proof))
            .route("/incoming/{id}", delete(delete_upload))
            .route("/incoming/{id}/header", post(upload_header))
            .route("/incoming/{id}/catalog", post(upload_catalog))
            .route("/incoming/{id}/block/{part}", post(upload_block))
            .route("/incoming/{id}/complete", post(complete_upload))
            .layer(axum::extract::DefaultBodyLimit::max(max_body_size))
            .with_state(state)
    }

    /// Bind `addr` and serve until `shutdown` resolves
    pub async fn run<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TicketError::Bind(format!("{}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            pow_bits = self.state.policy.pow_bits,
            max_body_size = self.state.policy.max_body_size,
            "Relay server listening"
        );

        axum::serve(listener, Self::build_router(self.state))
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to set up SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_text() -> std::result::Result<impl IntoResponse, ApiError> {
    let body = metrics::encode_metrics().map_err(internal)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

async fn request_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TicketRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if !state.accounts.exists(&req.to) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No account for {}", req.to),
        ));
    }

    let ticket = state.policy.issue(&req);
    let purged = {
        let store = state.tickets.lock().await;
        let purged = store.purge_expired(Utc::now()).map_err(internal)?;
        store.insert(&ticket).map_err(internal)?;
        purged
    };
    if !purged.is_empty() {
        let mut uploads = state.uploads.lock().await;
        for id in &purged {
            if uploads.remove(id).is_some() {
                tracing::debug!(ticket_id = %id, "Dropped upload of expired ticket");
            }
        }
    }

    let kind = if ticket.valid { "preauthorised" } else { "puzzle" };
    metrics::record_ticket_issued(kind);
    tracing::info!(ticket_id = %ticket.id, from = %req.from, to = %req.to, kind, "Issued ticket");

    Ok(Json(ticket))
}

async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProofSubmission>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let store = state.tickets.lock().await;
    let mut ticket = store
        .get(&id)
        .map_err(internal)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown ticket {}", id)))?;

    if ticket.is_expired() {
        return Err(api_error(StatusCode::GONE, "Ticket expired"));
    }
    if ticket.valid {
        return Ok(Json(ticket));
    }

    let Some(mut pow) = ticket.pow.take() else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Ticket has no puzzle"));
    };
    pow.proof = req.proof;
    if !pow.is_valid() {
        tracing::debug!(ticket_id = %id, proof = req.proof, "Rejected incorrect proof");
        return Err(api_error(StatusCode::BAD_REQUEST, "Incorrect proof of work"));
    }

    store.validate(&id, req.proof).map_err(internal)?;
    ticket.valid = true;
    ticket.pow = Some(pow);

    tracing::info!(ticket_id = %id, "Ticket validated by proof of work");
    Ok(Json(ticket))
}

/// Fetch a ticket that may be used for uploads right now
async fn usable_ticket(state: &AppState, id: &Uuid) -> std::result::Result<Ticket, ApiError> {
    let ticket = state.tickets.lock().await.get(id).map_err(internal)?;
    match ticket {
        Some(ticket) if ticket.is_usable() => Ok(ticket),
        _ => Err(api_error(
            StatusCode::UNAUTHORIZED,
            format!("Ticket {} is not valid", id),
        )),
    }
}

async fn upload_header(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(header): Json<Header>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let ticket = usable_ticket(&state, &id).await?;
    if header.to.address != ticket.to {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Header recipient does not match ticket",
        ));
    }

    state.uploads.lock().await.entry(id).or_default().header = Some(header);
    tracing::debug!(ticket_id = %id, "Received header");
    Ok(StatusCode::OK)
}

async fn upload_catalog(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    usable_ticket(&state, &id).await?;

    state.uploads.lock().await.entry(id).or_default().catalog = Some(body.to_vec());
    tracing::debug!(ticket_id = %id, size = body.len(), "Received catalog");
    Ok(StatusCode::OK)
}

async fn upload_block(
    State(state): State<Arc<AppState>>,
    Path((id, part)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    usable_ticket(&state, &id).await?;

    state
        .uploads
        .lock()
        .await
        .entry(id)
        .or_default()
        .parts
        .insert(part, body.to_vec());
    tracing::debug!(ticket_id = %id, part_id = %part, size = body.len(), "Received block");
    Ok(StatusCode::OK)
}

async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let ticket = usable_ticket(&state, &id).await?;

    let artifacts = {
        let mut uploads = state.uploads.lock().await;
        let staged = uploads
            .get(&id)
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Nothing uploaded"))?;
        let header = staged
            .header
            .clone()
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Header missing"))?;
        let catalog = staged
            .catalog
            .clone()
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "Catalog missing"))?;
        if !verify_checksums(&header.catalog.checksum, &catalog) {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Catalog checksum mismatch",
            ));
        }

        let parts = uploads
            .remove(&id)
            .map(|staged| staged.parts)
            .unwrap_or_default()
            .into_iter()
            .map(|(id, data)| EncryptedPart { id, data })
            .collect();

        MessageArtifacts {
            id: ticket.message_id,
            header,
            catalog,
            parts,
        }
    };

    match state.queue.enqueue(Section::Incoming, &artifacts) {
        Ok(()) => {}
        Err(QueueError::AlreadyExists { .. }) => {
            tracing::debug!(message_id = %artifacts.id, "Message already queued");
        }
        Err(e) => return Err(internal(e)),
    }

    if let Err(e) = state.tickets.lock().await.delete(&id) {
        tracing::warn!(ticket_id = %id, error = %e, "Cannot remove used ticket");
    }
    if !state.intake.submit(artifacts.id) {
        tracing::warn!(message_id = %artifacts.id, "Dispatcher not running, message left in incoming");
    }

    tracing::info!(
        ticket_id = %id,
        message_id = %artifacts.id,
        parts = artifacts.parts.len(),
        "Accepted message"
    );
    Ok(Json(serde_json::json!({ "message_id": artifacts.id })))
}

async fn delete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let staged = state.uploads.lock().await.remove(&id).is_some();
    let ticket = state.tickets.lock().await.delete(&id).map_err(internal)?;

    if !staged && !ticket {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("Unknown ticket {}", id),
        ));
    }

    tracing::info!(ticket_id = %id, "Dropped upload");
    Ok(StatusCode::OK)
}
