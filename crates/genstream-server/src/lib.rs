//! Resumable generation sessions over WebSocket and Server-Sent Events
//!
//! Long-running generation jobs run on their own tasks, detached from the
//! connection that started them. Every event a job produces is stamped with a
//! per-session sequence id and buffered, so a client that drops off can come
//! back, name the last id it saw, and receive exactly what it missed before
//! live delivery resumes. Cancellation is keyed by session, not by connection,
//! so a reconnected client can still stop the job it started.

pub mod abort;
pub mod channel;
pub mod config;
pub mod error;
pub mod event_log;
pub mod executor;
pub mod housekeeping;
pub mod multiplexer;
pub mod phase;
pub mod registry;
pub mod session;
pub mod sse;
pub mod ws;

pub use abort::AbortRegistry;
pub use channel::{ChannelReceiver, ClientChannel, Outbound, TransportKind};
pub use config::{ConfigLoader, ServerConfig};
pub use error::{Result, ServerError};
pub use event_log::EventLog;
pub use executor::{JobExecutor, JobRequest, JobStream, JobUpdate, ScriptedExecutor};
pub use multiplexer::Multiplexer;
pub use registry::{SessionRegistry, StartOutcome};
pub use session::{GenerationSession, SessionOutcome};
pub use sse::{SseEvent, SseStream};

pub use genstream_types::{
    BufferedEvent, ClientMessage, ErrorCode, Event, GenerateRequest, ServerMessage,
    SessionSnapshot, SessionStatus,
};

use axum::extract::{Json as AxumJson, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type HandlerError = (StatusCode, Json<serde_json::Value>);

/// Health check response.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub active_sessions: usize,
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
}

fn error_response(error: &ServerError) -> HandlerError {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": error.to_string(),
            "code": error.error_type(),
            "timestamp": chrono::Utc::now()
        })),
    )
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_count(),
    })
}

/// Handler for the /sessions GET endpoint.
async fn list_sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.registry.list();
    Json(json!({
        "sessions": sessions,
        "count": sessions.len(),
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for the /sessions/{id} GET endpoint, used by polling clients.
async fn session_status_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<SessionSnapshot>, HandlerError> {
    state
        .registry
        .require(&session_id)
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// Handler for the /sessions/{id}/cancel POST endpoint.
async fn cancel_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, HandlerError> {
    let snapshot = state
        .registry
        .require(&session_id)
        .map_err(|e| error_response(&e))?;

    let cancelled = state.registry.cancel_session(&session_id);
    Ok(Json(json!({
        "status": "success",
        "sessionId": session_id,
        "cancelled": cancelled,
        "message": if cancelled { "Cancel requested" } else { "No active generation to cancel" },
        "sessionStatus": snapshot.status,
        "timestamp": chrono::Utc::now()
    })))
}

/// Handler for the /generate POST endpoint: start a job and stream it over SSE.
async fn generate_handler(
    State(state): State<AppState>,
    AxumJson(request): AxumJson<GenerateRequest>,
) -> std::result::Result<Response, HandlerError> {
    log::info!(
        "Received generate request (session {:?})",
        request.session_id
    );

    let (channel, receiver) = ClientChannel::new(TransportKind::EventStream);
    state
        .registry
        .start_generation(&request.prompt, request.session_id, Some(&channel))
        .map_err(|e| {
            log::warn!("Generate request rejected: {}", e);
            error_response(&e)
        })?;

    Ok(sse::channel_response(state.registry, channel, receiver))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    last_event_id: Option<u64>,
}

fn last_event_id(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or(query.last_event_id)
        .unwrap_or(0)
}

/// Handler for the /sessions/{id}/events GET endpoint: resubscribe over SSE.
async fn session_events_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> std::result::Result<Response, HandlerError> {
    let after = last_event_id(&headers, &query);
    let (channel, receiver) = ClientChannel::new(TransportKind::EventStream);

    state
        .registry
        .multiplexer()
        .subscribe(&channel, &session_id, after)
        .map_err(|e| error_response(&e))?;

    Ok(sse::channel_response(state.registry, channel, receiver))
}

/// The session server.
pub struct GenStreamServer {
    registry: SessionRegistry,
    config: ServerConfig,
}

impl GenStreamServer {
    /// Create a new server with the given executor and default configuration.
    pub fn new(executor: Arc<dyn JobExecutor>) -> Self {
        Self::with_config(executor, ServerConfig::default())
    }

    /// Create a new server with custom configuration.
    pub fn with_config(executor: Arc<dyn JobExecutor>, config: ServerConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.clone(), executor),
            config,
        }
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            registry: self.registry.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws::ws_handler))
            .route("/generate", post(generate_handler))
            .route("/sessions", get(list_sessions_handler))
            .route("/sessions/{id}", get(session_status_handler))
            .route("/sessions/{id}/events", get(session_events_handler))
            .route("/sessions/{id}/cancel", post(cancel_session_handler))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Status polling is chatty, keep it at debug level.
                    let polling = method == axum::http::Method::GET
                        && uri.path().starts_with("/sessions/")
                        && !uri.path().ends_with("/events");
                    if polling {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if polling {
                        log::debug!("Response {} completed in {:?}", request_id, duration);
                    } else {
                        log::info!("Response {} completed in {:?}", request_id, duration);
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: std::result::Result<Vec<_>, _> =
                    origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => CorsLayer::permissive(),
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Start the server and listen for connections.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with a custom bind address.
    pub async fn serve_on(self, addr: impl Into<SocketAddr>) -> Result<()> {
        let mut server = self;
        server.config.bind_addr = addr.into();
        server.serve().await
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server will shut down when the provided shutdown signal is received.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;
        self.serve_listener(listener, shutdown_signal).await
    }

    /// Serve on an already bound listener.
    pub async fn serve_listener<F>(self, listener: TcpListener, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.config.validate()?;
        let router = self.build_router();
        let addr = listener.local_addr()?;

        log::info!("genstream server starting on {}", addr);
        log::info!("Health check: http://{}/health", addr);
        log::info!("WebSocket endpoint: ws://{}/ws", addr);
        log::info!("SSE generate endpoint: http://{}/generate", addr);
        log::info!("Session status: http://{}/sessions/{{id}}", addr);

        let housekeeping = housekeeping::spawn_housekeeping(
            self.registry.clone(),
            self.config.cleanup_interval,
            self.registry.shutdown_token(),
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await;

        self.registry.shutdown();
        let _ = housekeeping.await;

        result.map_err(ServerError::Io)?;
        log::info!("genstream server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
