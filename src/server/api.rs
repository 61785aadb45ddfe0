use crate::agent::ChatAgent;
use crate::cli::Args;
use crate::error::ChatError;
use crate::models::api::{
    iso_timestamp,
    ChatRequest,
    ChatResponse,
    ClearRequest,
    ClearResponse,
    ErrorResponse,
    HealthResponse,
};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use axum::{
    routing::{ get, post },
    Json,
    Router,
    extract::{ State, rejection::JsonRejection },
    response::{ IntoResponse, Response },
    http::StatusCode,
};
use chrono::Utc;
use tower_http::cors::{ Any, CorsLayer };
use tower_http::services::ServeDir;
use log::{ info, warn, error, debug };

#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<ChatAgent>,
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ChatError::InvalidRequest(message) =>
                (StatusCode::BAD_REQUEST, ErrorResponse { error: message, details: None }),
            ChatError::MisconfiguredService(reason) =>
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse { error: reason, details: None }),
            ChatError::ServiceUnavailable(reason) =>
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "Failed to process message".to_string(),
                        details: Some(reason),
                    },
                ),
        };
        (status, Json(body)).into_response()
    }
}

/// Chat, clear and health routes, plus the static front-end when `static_dir` exists.
pub fn build_router(state: AppState, static_dir: Option<&Path>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/clear", post(clear_handler));

    match static_dir {
        Some(dir) if dir.is_dir() => {
            info!("Serving front-end from {}", dir.display());
            app = app.fallback_service(ServeDir::new(dir));
        }
        Some(dir) => warn!("Static directory {} not found; front-end disabled", dir.display()),
        None => {}
    }

    app.layer(cors).with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Server is running".to_string(),
        timestamp: iso_timestamp(Utc::now()),
    })
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            warn!("Rejected chat request body: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "Invalid request body".to_string(),
                    details: Some(rejection.body_text()),
                }),
            ).into_response();
        }
    };

    let message = req.message.unwrap_or_default();
    if message.trim().is_empty() {
        return ChatError::InvalidRequest("Message is required".to_string()).into_response();
    }
    let session_id = match req.session_id.filter(|id| !id.trim().is_empty()) {
        Some(session_id) => session_id,
        None => {
            return ChatError::InvalidRequest("Session id is required".to_string()).into_response();
        }
    };
    debug!("Chat request for session {} ({} chars)", session_id, message.len());

    match state.agent.process_message(&session_id, &message).await {
        Ok(reply) =>
            Json(ChatResponse {
                reply: reply.reply,
                session_id: reply.session_id,
                timestamp: iso_timestamp(reply.timestamp),
            }).into_response(),
        Err(e) => {
            error!("Chat request for session {} failed: {}", session_id, e);
            e.into_response()
        }
    }
}

async fn clear_handler(
    State(state): State<AppState>,
    payload: Result<Json<ClearRequest>, JsonRejection>
) -> Json<ClearResponse> {
    let session_id = payload
        .ok()
        .and_then(|Json(req)| req.session_id)
        .filter(|id| !id.trim().is_empty());

    if let Some(session_id) = session_id {
        state.agent.clear_session(&session_id);
    }

    Json(ClearResponse {
        success: true,
        message: "Chat history cleared".to_string(),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining connections");
}

pub async fn start_http_server(
    app: Router,
    args: &Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.server_addr.parse::<SocketAddr>()?;

    if args.enable_tls {
        let (cert_path, key_path) = args
            .tls_paths()
            .ok_or("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.")?;
        info!(
            "TLS enabled. Loading certificate from '{}' and key from '{}'",
            cert_path,
            key_path
        );
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        info!("HTTPS server listening on: https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            format!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e)
        })?;
        info!("HTTP server listening on: http://{}", addr);
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Server stopped");
    Ok(())
}
