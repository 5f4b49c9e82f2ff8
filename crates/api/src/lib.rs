#![forbid(unsafe_code)]

//! HTTP surface: bearer middleware plus the sync push/pull endpoints.

mod sync;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use wallet_sync_auth::DeviceAuth;
use wallet_sync_core::protocol::types::ErrorBody;
use wallet_sync_engine::SyncEngine;
use wallet_sync_storage::Storage;

#[derive(Clone)]
pub struct ApiState {
    engine: SyncEngine,
    health: Arc<dyn Storage>,
    auth: Arc<dyn DeviceAuth>,
}

impl ApiState {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, auth: Arc<dyn DeviceAuth>) -> Self {
        Self {
            engine: SyncEngine::new(storage.clone()),
            health: storage,
            auth,
        }
    }

    pub(crate) fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub(crate) fn auth(&self) -> &dyn DeviceAuth {
        self.auth.as_ref()
    }
}

/// Bearer token as pulled from the Authorization header. Device binding is
/// checked in the handlers, where the request's `device_id` is known.
#[derive(Debug, Clone)]
pub(crate) struct BearerToken(pub String);

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sync/push", post(sync::push))
        .route("/api/v1/sync/pull", get(sync::pull_query).post(sync::pull_body))
        .with_state(state)
        .layer(middleware::from_fn(bearer_middleware))
}

async fn health(State(state): State<ApiState>) -> StatusCode {
    match state.health.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn bearer_middleware(mut request: Request, next: Next) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let Some(header) = request.headers().get(AUTHORIZATION) else {
        return unauthorized("missing authorization");
    };
    let Ok(header_value) = header.to_str() else {
        return unauthorized("invalid authorization header format");
    };
    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return unauthorized("invalid authorization header format");
    };
    if token.is_empty() {
        return unauthorized("missing authorization token");
    }
    let token = token.to_owned();

    request.extensions_mut().insert(BearerToken(token));
    next.run(request).await
}

pub(crate) fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "unauthorized".to_owned(),
            message: message.to_owned(),
        }),
    )
        .into_response()
}
