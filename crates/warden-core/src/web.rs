//! Administrative HTTP API.
//!
//! ```text
//! GET    /users          list accounts
//! POST   /users          create an account
//! GET    /user?id=..     fetch one account
//! PUT    /user?id=..     partial update
//! DELETE /user?id=..     delete
//! POST   /restart        reconfigure and restart the proxy
//! GET    /healthz        supervisor and registry summary
//! ```
//!
//! Errors are returned as `{"error": "..."}` with 400 for validation
//! failures, 404 for unknown ids and 500 otherwise. A 500 from a mutating
//! route means the change may have been partially applied.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::account::{AccountUpdate, NewAccount};
use crate::error::Error;
use crate::service::ControlPlane;

/// Shared handler state.
pub type AppState = Arc<ControlPlane>;

/// Build the admin router.
pub fn build_router(plane: AppState) -> Router {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/user", get(get_user).put(update_user).delete(delete_user))
        .route("/restart", post(restart_proxy))
        .route("/healthz", get(health))
        .with_state(plane)
}

/// Error response wrapper.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %err, "Admin request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

impl IdQuery {
    fn require(self) -> Result<String, ApiError> {
        self.id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::bad_request("User ID is required in query parameters"))
    }
}

pub async fn list_users(State(plane): State<AppState>) -> Response {
    Json(plane.list_accounts().await).into_response()
}

pub async fn create_user(
    State(plane): State<AppState>,
    body: Result<Json<NewAccount>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let account = plane.create_account(request).await?;
    Ok((StatusCode::CREATED, Json(account)).into_response())
}

pub async fn get_user(
    State(plane): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Response, ApiError> {
    let id = query.require()?;
    Ok(Json(plane.get_account(&id).await?).into_response())
}

pub async fn update_user(
    State(plane): State<AppState>,
    Query(query): Query<IdQuery>,
    body: Result<Json<AccountUpdate>, JsonRejection>,
) -> Result<Response, ApiError> {
    let id = query.require()?;
    let Json(update) = body?;
    Ok(Json(plane.update_account(&id, update).await?).into_response())
}

pub async fn delete_user(
    State(plane): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Response, ApiError> {
    let id = query.require()?;
    plane.delete_account(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn restart_proxy(State(plane): State<AppState>) -> Result<Response, ApiError> {
    let report = plane.restart_proxy().await.map_err(Error::from)?;
    debug!(generation = report.generation, "Restart requested via admin API");
    Ok(Json(report).into_response())
}

pub async fn health(State(plane): State<AppState>) -> Response {
    Json(plane.health().await).into_response()
}
