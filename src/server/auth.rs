//! Shared-token authentication.
//!
//! When a token is configured, requests must carry it as
//! `Authorization: Bearer <token>` or `X-API-Token: <token>`. WebSocket
//! clients that cannot set headers may pass `?token=` on `/ws` instead.

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use tracing::warn;

use super::AppState;

const PUBLIC_PATHS: &[&str] = &["/health"];
const QUERY_TOKEN_PATHS: &[&str] = &["/ws"];

pub(super) async fn require_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(ref expected) = state.api_token else {
        return next.run(req).await;
    };

    let path = req.uri().path().to_owned();
    if PUBLIC_PATHS.contains(&path.as_str()) {
        return next.run(req).await;
    }

    let presented = header_token(req.headers()).or_else(|| {
        if QUERY_TOKEN_PATHS.contains(&path.as_str()) {
            query_token(req.uri())
        } else {
            None
        }
    });

    match presented {
        Some(token) if token == expected.expose_secret() => next.run(req).await,
        _ => {
            warn!(path = %path, "Rejected request with missing or invalid token");
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid or missing token" })),
            )
                .into_response()
        }
    }
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    if let Some(raw) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let mut parts = raw.split_whitespace();
        if let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next())
            && scheme.eq_ignore_ascii_case("bearer")
        {
            return Some(token.to_string());
        }
    }
    headers
        .get("x-api-token")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn query_token(uri: &Uri) -> Option<String> {
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params.remove("token").filter(|t| !t.is_empty())
}
