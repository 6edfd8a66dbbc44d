//! HTTP surface.

use crate::attendance::{AttendanceService, FailureKind, Outcome};
use crate::store::StoreError;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::FormRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AttendanceService>,
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/process-image", post(process_image))
        .route("/attendance/:user_id", get(list_attendance))
        .route("/check_username", post(check_username))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Recorded { prediction, message } => (
                StatusCode::OK,
                Json(json!({
                    "status": "success",
                    "prediction": prediction,
                    "message": message,
                })),
            )
                .into_response(),
            Outcome::Rejected {
                kind,
                message,
                prediction,
            } => {
                let mut body = json!({
                    "status": "error",
                    "kind": kind,
                    "message": message,
                });
                if let Some(p) = prediction {
                    body["prediction"] = json!(p);
                }
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            Outcome::Failed { .. } => internal_error(),
        }
    }
}

/// Non-outcome handler failures.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    TooLarge,
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => Outcome::Rejected {
                kind: FailureKind::Validation,
                message,
                prediction: None,
            }
            .into_response(),
            ApiError::TooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "status": "error", "kind": FailureKind::Validation, "message": "upload too large" })),
            )
                .into_response(),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store failure");
                internal_error()
            }
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

/// `POST /process-image`: multipart `image` + `user_id`.
async fn process_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Outcome, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::Validation(e.body_text()))?;

    let mut image = None;
    let mut user_id = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => return Err(ApiError::TooLarge),
            Err(e) => return Err(ApiError::Validation(e.body_text())),
        };
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("image") => {
                let bytes = field.bytes().await.map_err(|e| {
                    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
                        ApiError::TooLarge
                    } else {
                        ApiError::Validation(e.body_text())
                    }
                })?;
                image = Some(bytes.to_vec());
            }
            Some("user_id") => {
                user_id = Some(field.text().await.map_err(|e| ApiError::Validation(e.body_text()))?);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| ApiError::Validation("image is required".into()))?;
    let user_id = user_id.ok_or_else(|| ApiError::Validation("user_id is required".into()))?;

    let outcome = state.service.verify_and_record(image, &user_id).await;
    if let Outcome::Failed { message } = &outcome {
        tracing::error!(user_id = %user_id, error = %message, "verify-and-record failed");
    }
    Ok(outcome)
}

/// `GET /attendance/:user_id`
async fn list_attendance(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state.service.list_attendance(&user_id).await?;
    Ok(Json(json!({
        "status": "success",
        "attendance_data": records,
    })))
}

#[derive(Deserialize)]
struct CheckUsername {
    username: String,
}

/// `POST /check_username` (form `username`).
async fn check_username(
    State(state): State<AppState>,
    form: Result<Form<CheckUsername>, FormRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Form(form) = form.map_err(|e| ApiError::Validation(e.body_text()))?;
    let exists = state.service.username_exists(form.username.trim()).await?;
    Ok(Json(json!({
        "status": if exists { "Success" } else { "Failed" },
    })))
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "presenced",
        "version": env!("CARGO_PKG_VERSION"),
        "models_loaded": state.service.models_loaded(),
    }))
}
