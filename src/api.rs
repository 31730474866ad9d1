//! HTTP surface.
//!
//! ```text
//! POST /purchase   buy; any other method -> 405
//! GET  /history    caller's attempts; any other method -> 405
//! ```

use crate::history::{HistoryParams, HistoryReply, HistoryService};
use crate::purchase::PurchaseWorkflow;
use crate::response::{ErrorCode, ErrorResponse};
use axum::body::{to_bytes, Body};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AppState {
    pub purchases: Arc<PurchaseWorkflow>,
    pub history: Arc<HistoryService>,
}

impl AppState {
    pub fn new(purchases: PurchaseWorkflow, history: HistoryService) -> Self {
        Self { purchases: Arc::new(purchases), history: Arc::new(history) }
    }
}

/// Build the router. Callers add middleware and bind it.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/purchase", post(purchase).fallback(purchase_method_not_allowed))
        .route("/history", get(history).fallback(history_method_not_allowed))
        .with_state(state)
}

async fn purchase(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    // Read the body ourselves so an oversized one still reaches the workflow and is recorded.
    let limit = state.purchases.policy().max_body_bytes;
    let reply = match to_bytes(body, limit).await {
        Ok(bytes) => state.purchases.submit(&headers, &bytes).await,
        Err(e) => state.purchases.submit_unreadable(&headers, &e.to_string()).await,
    };
    let retry_after = reply.body.retry_after;
    let mut response = (reply.status, Json(reply.body)).into_response();
    if reply.status == StatusCode::TOO_MANY_REQUESTS {
        if let Some(secs) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
    }
    response
}

async fn history(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    // Malformed query strings are treated like missing parameters.
    let params = Query::<HashMap<String, String>>::try_from_uri(&uri)
        .map(|Query(q)| HistoryParams::from_query(&q))
        .unwrap_or_default();
    match state.history.fetch(&headers, params).await {
        HistoryReply::Page(page) => (StatusCode::OK, Json(page)).into_response(),
        HistoryReply::Error { status, body } => (status, Json(body)).into_response(),
    }
}

async fn purchase_method_not_allowed() -> Response {
    method_not_allowed("Only POST method is allowed for this endpoint")
}

async fn history_method_not_allowed() -> Response {
    method_not_allowed("Only GET method is allowed for this endpoint")
}

fn method_not_allowed(message: &str) -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, Json(ErrorResponse::new(ErrorCode::MethodNotAllowed, message)))
        .into_response()
}
