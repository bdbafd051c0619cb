//! API server assembly: shared state, router and background maintenance.

use std::{future::Future, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::Request,
    middleware as axum_middleware,
    routing::{get, post},
};
use chrono::Utc;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, info_span};

use crate::{
    config::ServerConfig,
    error::AppError,
    execution::HandlerRegistry,
    handlers,
    middleware,
    models::operation::CommandKind,
    services::{
        authenticator::Authenticator,
        operations::OperationRegistry,
        process_handler::ProcessHandler,
        runner::OperationRunner,
        stream_manager::{StreamManager, StreamSettings},
    },
    storage::{ConnectionManager, GraphBackend},
};

/// Shared by every handler through axum's `State`.
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    pub runner: Arc<OperationRunner>,
    pub pool: Arc<ConnectionManager>,
    pub backend_name: &'static str,
}

impl AppState {
    /// Wire the services for `config` on top of an opened backend.
    ///
    /// Starts the pool health loop.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if the API key file cannot be loaded.
    pub fn build(
        config: &ServerConfig,
        backend: Arc<dyn GraphBackend>,
        handlers: HandlerRegistry,
    ) -> Result<Self, AppError> {
        let backend_name = backend.name();
        let pool = ConnectionManager::start(backend, config.pool_settings());
        let authenticator = Arc::new(Authenticator::from_config(config)?);
        let runner = OperationRunner::new(
            handlers,
            Arc::new(OperationRegistry::new(config.operation_retention)),
            Arc::new(StreamManager::new(StreamSettings::from(config))),
            config.operation_timeout,
            config.progress_buffer,
        )
        .with_storage(Arc::clone(&pool), config.chunk_size);

        Ok(Self {
            authenticator,
            runner: Arc::new(runner),
            pool,
            backend_name,
        })
    }
}

/// External-program handlers for every command kind that has one configured.
pub fn handlers_from_config(config: &ServerConfig) -> HandlerRegistry {
    let configured = [
        (CommandKind::Scan, &config.scan_command),
        (CommandKind::GenerateIac, &config.generate_iac_command),
        (CommandKind::GenerateSpec, &config.generate_spec_command),
        (CommandKind::Deploy, &config.deploy_command),
    ];

    let mut registry = HandlerRegistry::new();
    for (kind, line) in configured {
        if let Some(handler) = line.as_deref().and_then(ProcessHandler::from_command_line) {
            info!(%kind, "registered command handler");
            registry.register(kind, Arc::new(handler));
        }
    }
    registry
}

/// Build the HTTP router.
///
/// # Layers
///
/// - `x-request-id` is accepted or generated, recorded in the request span
///   and copied onto every response
/// - API routes require a valid key, then a JSON body on mutating requests
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/scan", post(handlers::commands::scan))
        .route("/api/v1/generate-iac", post(handlers::commands::generate_iac))
        .route("/api/v1/generate-spec", post(handlers::commands::generate_spec))
        .route("/api/v1/deploy", post(handlers::commands::deploy))
        .route(
            "/api/v1/operations/{id}",
            get(handlers::operations::get_operation),
        )
        .route(
            "/api/v1/operations/{id}/cancel",
            post(handlers::operations::cancel_operation),
        )
        .route("/api/v1/stream", get(handlers::stream::stream))
        .route_layer(axum_middleware::from_fn(
            middleware::content_type::require_json,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state.authenticator),
            middleware::auth::auth_middleware,
        ));

    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    });

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(trace)
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Periodic cleanup: idle rate-limit buckets, expired operations and topics.
pub fn spawn_maintenance(
    state: AppState,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            let buckets = state.authenticator.limiter().prune_idle();
            let operations = state.runner.operations().gc(Utc::now());
            let topics = state.runner.streams().gc();
            debug!(buckets, operations, topics, "maintenance pass");
        }
    })
}

/// Serve until `shutdown` resolves, then stop maintenance and the pool.
///
/// # Errors
///
/// I/O errors from the listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let interval = state.runner.streams().settings().replay_window.min(Duration::from_secs(60));
    let maintenance = spawn_maintenance(state.clone(), interval, stop_rx);
    let pool = Arc::clone(&state.pool);

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "server listening");
    }
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    let _ = stop_tx.send(true);
    let _ = maintenance.await;
    pool.shutdown().await;
    info!("server stopped");
    result
}
