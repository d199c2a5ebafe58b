use super::query_string;
use super::AppState;
use crate::action::Payload;
use crate::error::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// Media type of successful action responses
pub const EJSON_CONTENT_TYPE: &str = "application/ejson";

/// Header carrying the caller's secret
pub const API_KEY_HEADER: &str = "api-key";

/// `ANY /api/v1/action/:action`
pub async fn action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response> {
    let credential = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    // The body stays raw until the dispatcher has authorized the caller
    let payload = if method == Method::POST {
        Payload::Body(body)
    } else {
        Payload::Value(query_string::parse_pairs(&pairs))
    };

    let result = state
        .dispatcher
        .dispatch(credential, &action, payload)
        .await?;

    Ok((
        [(header::CONTENT_TYPE, EJSON_CONTENT_TYPE)],
        result.to_string(),
    )
        .into_response())
}

/// `GET /`
pub async fn service_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let metrics = state.dispatcher.metrics();
    let slow_log = state.dispatcher.slow_log();
    Json(json!({
        "api": {
            "icon": "📡",
            "name": "MongoDB Data API",
            "description": "A self-hosted clone of Atlas's Data API",
            "version": crate::VERSION,
            "uptime": metrics.uptime_human(),
        },
        "data": {
            "clusters": state.dispatcher.registry().names(),
        },
        "stats": {
            "totalActions": metrics.actions.total_actions(),
            "totalErrors": metrics.actions.total_errors(),
            "slowActions": {
                "threshold": humantime::format_duration(slow_log.threshold()).to_string(),
                "recorded": slow_log.len(),
            },
            "actions": metrics.actions.snapshot(),
        },
        "user": {},
    }))
}
