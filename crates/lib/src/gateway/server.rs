//! Webhook HTTP server: one POST route for gateway events plus liveness.

use crate::buffer::ConversationBuffer;
use crate::channels::{self, MessagingGateway, UazapiClient};
use crate::config::{self, Config};
use crate::ingest::Ingestor;
use crate::llm::{ConversationEngine, OpenAiEngine};
use crate::orchestrator::TurnOrchestrator;
use crate::store::{ConversationStore, HistoryRecord, LocalStore, Role};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct AppState {
    /// Reported by the liveness endpoint.
    pub port: u16,
    pub store: Arc<dyn ConversationStore>,
    pub ingestor: Arc<Ingestor>,
    pub buffer: ConversationBuffer,
}

type HandlerError = (StatusCode, String);

/// Routes: `GET /`, `GET /health` and `POST <webhook_path>`. Other methods on the webhook get 405.
pub fn build_router(state: AppState, webhook_path: &str, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/health", get(health_http))
        .route(webhook_path, post(webhook))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Run the webhook server; binds to config.server.bind:config.server.port.
/// Fails fast when credentials are missing. Blocks until shutdown (SIGINT or SIGTERM).
/// `config_path` locates the default data directory for the file-backed store.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    config.validate()?;

    let store: Arc<dyn ConversationStore> = match config::resolve_store_dir(&config, &config_path) {
        Some(dir) => {
            let store = LocalStore::open(&dir)
                .await
                .with_context(|| format!("opening store at {}", dir.display()))?;
            log::info!("store directory {}", dir.display());
            Arc::new(store.with_history_limit(config.store.history_limit))
        }
        None => {
            log::info!("store is in memory; history is lost on restart");
            Arc::new(LocalStore::in_memory().with_history_limit(config.store.history_limit))
        }
    };
    let engine: Arc<dyn ConversationEngine> =
        Arc::new(OpenAiEngine::new(config.engine_settings()).context("building engine client")?);
    let gateway: Arc<dyn MessagingGateway> =
        Arc::new(UazapiClient::new(config.uazapi_settings()).context("building gateway client")?);

    let orchestrator = Arc::new(TurnOrchestrator::new(
        store.clone(),
        engine.clone(),
        gateway.clone(),
        config.turn_settings(),
    ));
    let buffer = ConversationBuffer::new(config.buffer_window(), orchestrator);
    let state = AppState {
        port: config.server.port,
        store,
        ingestor: Arc::new(Ingestor::new(gateway, engine)),
        buffer: buffer.clone(),
    };
    let app = build_router(state, &config.server.webhook_path, config.server.max_body_bytes);

    let bind_addr = format!("{}:{}", config.server.bind.trim(), config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!(
        "listening on {} (webhook {}, window {:?})",
        bind_addr,
        config.server.webhook_path,
        buffer.window()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(buffer))
        .await
        .context("webhook server exited")?;
    log::info!("server stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM. Buffered fragments that have not flushed yet are dropped.
async fn shutdown_signal(buffer: ConversationBuffer) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    let pending = buffer.pending_senders().await;
    if pending > 0 {
        log::warn!("shutting down with {} unflushed sender buffer(s)", pending);
    } else {
        log::info!("shutdown signal received, draining connections");
    }
}

/// GET / and GET /health: liveness JSON.
async fn health_http(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
    }))
}

/// POST webhook: normalize, persist the fragment, buffer it. The reply happens later on the
/// buffer's flush; this handler returns as soon as the fragment is buffered.
async fn webhook(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, HandlerError> {
    let event = channels::normalize(&body).map_err(|e| {
        log::debug!("webhook: rejected payload: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;
    if event.is_echo {
        return Ok(Json(json!({"ok": true, "ignored": "fromMe"})));
    }

    state
        .store
        .get_or_create_sender(&event.sender_id, event.sender_display_name.as_deref())
        .await
        .map_err(|e| internal("store", e))?;

    let fragment = state
        .ingestor
        .fragment(&event)
        .await
        .map_err(|e| internal("ingest", e))?;

    let record = HistoryRecord::new(
        &event.sender_id,
        Role::User,
        fragment.kind,
        fragment.text.clone(),
    )
    .with_external_id(event.external_message_id.clone());
    if let Err(e) = state.store.append_history(record).await {
        log::warn!("webhook: history write for {} failed: {}", event.sender_id, e);
    }

    state
        .buffer
        .append(&event.sender_id, &fragment.text, fragment.kind)
        .await;
    Ok(Json(json!({"ok": true})))
}

fn internal(label: &str, err: impl std::fmt::Display) -> HandlerError {
    log::warn!("webhook: {} failed: {}", label, err);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {}", label, err))
}
