// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Authenticated HTTP API.
//!
//! Serves deploy/rollback/status/stop/exec/upload plus two SSE log streams
//! on the API port. All endpoints are rate limited per client IP; every
//! endpoint except `/health` requires the bearer token, compared in
//! constant time.

mod handlers;
mod middleware;
mod ratelimit;
mod sse;
mod types;

pub use ratelimit::RateLimiter;

use crate::logging::LogBroker;
use crate::storage::Db;
use anyhow::{Context, Result};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use bollard::Docker;
use std::net::SocketAddr;
use std::sync::Arc;

/// Requests admitted per second per client IP.
const RATE_LIMIT_PER_SECOND: f64 = 5.0;

/// Burst size per client IP.
const RATE_LIMIT_BURST: u32 = 10;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub docker: Docker,
    pub db: Db,
    pub broker: LogBroker,
    pub api_token: Arc<String>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ApiState {
    #[must_use]
    pub fn new(docker: Docker, db: Db, broker: LogBroker, api_token: String) -> Self {
        Self {
            docker,
            db,
            broker,
            api_token: Arc::new(api_token),
            rate_limiter: RateLimiter::new(RATE_LIMIT_PER_SECOND, RATE_LIMIT_BURST),
        }
    }
}

/// Build the API router.
#[must_use]
pub fn router(state: ApiState) -> Router {
    let authed = Router::new()
        .route("/v1/deploy", post(handlers::handle_deploy))
        .route(
            "/v1/images/upload",
            post(handlers::handle_image_upload)
                .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024 * 1024)),
        )
        .route("/v1/rollback/{app_name}", get(handlers::handle_rollback_targets))
        .route("/v1/rollback", post(handlers::handle_rollback))
        .route("/v1/status/{app_name}", get(handlers::handle_app_status))
        .route("/v1/stop/{app_name}", post(handlers::handle_stop_app))
        .route("/v1/exec/{app_name}", post(handlers::handle_exec))
        .route("/v1/version", get(handlers::handle_version))
        .layer(from_fn(middleware::standard_headers))
        .layer(from_fn_with_state(state.clone(), middleware::bearer_token_auth));

    let streams = Router::new()
        .route(
            "/v1/deploy/{deployment_id}/logs",
            get(handlers::handle_deployment_logs),
        )
        .route("/v1/logs", get(handlers::handle_logs))
        .layer(from_fn(middleware::stream_headers))
        .layer(from_fn_with_state(state.clone(), middleware::bearer_token_auth));

    let public = Router::new()
        .route("/health", get(handlers::handle_health))
        .layer(from_fn(middleware::standard_headers));

    Router::new()
        .merge(authed)
        .merge(streams)
        .merge(public)
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the API until the process exits.
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: ApiState, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API server to {addr}"))?;

    tracing::info!("API server listening on http://{addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server failed")
}
