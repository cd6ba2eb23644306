// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! HTTP-01 challenge responder.
//!
//! A minimal HTTP server bound on the provider port. HAProxy routes
//! `/.well-known/acme-challenge/*` requests from the CA here; the body for
//! each token comes from an in-memory store the order flow fills in right
//! before marking a challenge ready.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Shared token-to-key-authorization map.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<Mutex<HashMap<String, String>>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, key_authorization: String) {
        self.tokens
            .lock()
            .expect("challenge store mutex poisoned")
            .insert(token, key_authorization);
    }

    pub fn remove(&self, token: &str) {
        self.tokens
            .lock()
            .expect("challenge store mutex poisoned")
            .remove(token);
    }

    #[must_use]
    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens
            .lock()
            .expect("challenge store mutex poisoned")
            .get(token)
            .cloned()
    }
}

async fn serve_challenge(
    State(store): State<ChallengeStore>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    store.get(&token).ok_or(StatusCode::NOT_FOUND)
}

/// Spawn the challenge responder on `port`. Runs until the process exits.
pub fn spawn_http01_server(store: ChallengeStore, port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
            .with_state(store);

        let bind_addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!("Failed to bind HTTP-01 challenge server to {bind_addr}: {err}");
                return;
            }
        };

        tracing::info!("HTTP-01 challenge server listening on {bind_addr}");

        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("HTTP-01 challenge server error: {err}");
        }
    })
}
