// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Request middleware: bearer authentication, rate limiting and response
//! headers.

use super::ApiState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use subtle::ConstantTimeEq;

/// Bearer-token authentication with a constant-time comparison.
pub async fn bearer_token_auth(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_header) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::UNAUTHORIZED, "Authorization header required").into_response();
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return (
            StatusCode::UNAUTHORIZED,
            "Invalid authorization format. Expected 'Bearer <token>'",
        )
            .into_response();
    };

    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Empty token").into_response();
    }

    if token.as_bytes().ct_eq(state.api_token.as_bytes()).into() {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Invalid token").into_response()
    }
}

/// Per-IP rate limiting. Applied to every endpoint, health included.
pub async fn rate_limit(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    if state.rate_limiter.allow(&ip) {
        next.run(request).await
    } else {
        (StatusCode::TOO_MANY_REQUESTS, "429 Too Many Requests").into_response()
    }
}

/// Client IP: first `X-Forwarded-For` hop, else `X-Real-IP`, else the
/// socket peer address.
fn client_ip(request: &Request<Body>) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or(forwarded).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Security and caching headers for regular endpoints.
pub async fn standard_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    response
}

/// Headers for SSE endpoints. Content type and chunked transfer are handled
/// by the SSE response itself.
pub async fn stream_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
