//! Push and pull handlers.
//!
//! Top-level shape problems answer HTTP 417 with `{error, message}`;
//! authentication problems answer 401/403. Item-level outcomes always ride
//! in a 200 envelope.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::Value;

use wallet_sync_auth::AuthError;
use wallet_sync_core::protocol::types::ErrorBody;
use wallet_sync_core::protocol::{PullResponse, PushItem, PushResponse};
use wallet_sync_engine::{Identity, PullParams, RequestError};

use crate::{unauthorized, ApiState, BearerToken};

pub(crate) async fn push(
    State(state): State<ApiState>,
    Extension(token): Extension<BearerToken>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return shape_error("invalid_body", "request body must be JSON");
    };

    let Some(device_id) = text_field(&body, "device_id") else {
        return shape_error("device_id_required", "device_id is required");
    };
    let Some(wallet_id) = text_field(&body, "wallet_id") else {
        return shape_error("wallet_id_required", "wallet_id is required");
    };

    let identity = match resolve_identity(&state, &token, device_id).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let items = match body.get("items") {
        None | Some(Value::Null) => {
            return shape_error("items_required", "items is required");
        }
        Some(Value::Array(raw)) => {
            let mut items = Vec::with_capacity(raw.len());
            for value in raw {
                match serde_json::from_value::<PushItem>(value.clone()) {
                    Ok(item) => items.push(item),
                    Err(_) => {
                        return shape_error("items_invalid", "items must be a list of objects");
                    }
                }
            }
            items
        }
        Some(_) => return shape_error("items_invalid", "items must be a list"),
    };

    match state.engine().push(&identity, wallet_id, &items).await {
        Ok(message) => Json(PushResponse { message }).into_response(),
        Err(error) => request_error_response(&error),
    }
}

/// Pull parameters from a query string (GET).
#[derive(Debug, Default, Deserialize)]
pub(crate) struct PullQuery {
    device_id: Option<String>,
    wallet_id: Option<String>,
    cursor: Option<String>,
    since: Option<String>,
    limit: Option<String>,
}

pub(crate) async fn pull_query(
    State(state): State<ApiState>,
    Extension(token): Extension<BearerToken>,
    Query(query): Query<PullQuery>,
) -> Response {
    let limit = query.limit.as_deref().and_then(|raw| raw.parse().ok());
    pull_inner(
        state,
        token,
        query.device_id.as_deref(),
        query.wallet_id.as_deref(),
        query.cursor.as_deref(),
        query.since.as_deref(),
        limit,
    )
    .await
}

pub(crate) async fn pull_body(
    State(state): State<ApiState>,
    Extension(token): Extension<BearerToken>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let Ok(Json(body)) = body else {
        return shape_error("invalid_body", "request body must be JSON");
    };
    let limit = match body.get("limit") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(raw)) => raw.trim().parse().ok(),
        Some(_) => None,
    };
    pull_inner(
        state,
        token,
        text_field(&body, "device_id"),
        text_field(&body, "wallet_id"),
        text_field(&body, "cursor"),
        text_field(&body, "since"),
        limit,
    )
    .await
}

async fn pull_inner(
    state: ApiState,
    token: BearerToken,
    device_id: Option<&str>,
    wallet_id: Option<&str>,
    cursor: Option<&str>,
    since: Option<&str>,
    limit: Option<i64>,
) -> Response {
    let Some(device_id) = device_id.filter(|id| !id.is_empty()) else {
        return shape_error("device_id_required", "device_id is required");
    };
    let Some(wallet_id) = wallet_id.filter(|id| !id.is_empty()) else {
        return shape_error("wallet_id_required", "wallet_id is required");
    };

    let identity = match resolve_identity(&state, &token, device_id).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let params = PullParams {
        cursor,
        since,
        limit,
    };
    match state.engine().pull(&identity, wallet_id, params).await {
        Ok(message) => Json(PullResponse { message }).into_response(),
        Err(error) => request_error_response(&error),
    }
}

async fn resolve_identity(
    state: &ApiState,
    token: &BearerToken,
    device_id: &str,
) -> Result<Identity, Response> {
    match state.auth().resolve(&token.0, device_id).await {
        Ok(resolved) => Ok(Identity {
            user_id: resolved.user_id,
            device_id: resolved.device_id,
        }),
        Err(AuthError::ExpiredToken) => Err(unauthorized("token has expired")),
        Err(AuthError::DeviceMismatch) => {
            Err(unauthorized("token is bound to a different device"))
        }
        Err(_) => Err(unauthorized("invalid token")),
    }
}

fn text_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
}

fn shape_error(code: &str, message: &str) -> Response {
    (
        StatusCode::EXPECTATION_FAILED,
        Json(ErrorBody {
            error: code.to_owned(),
            message: message.to_owned(),
        }),
    )
        .into_response()
}

fn request_error_response(error: &RequestError) -> Response {
    let status = match error {
        RequestError::WalletAccessDenied | RequestError::WalletReadOnly => StatusCode::FORBIDDEN,
        RequestError::Storage(storage_error) => {
            tracing::error!(error = %storage_error, "sync request failed in storage");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::EXPECTATION_FAILED,
    };
    (
        status,
        Json(ErrorBody {
            error: error.code().to_owned(),
            message: error.to_string(),
        }),
    )
        .into_response()
}
