//! HTTP handlers.
//!
//! A successful upload answers with the result artifact as plain text.
//! Every failure answers with a JSON body `{ "success": false, "error": … }`,
//! plus `error_tag` when a worker classified the failure.

use axum::Json;
use axum::extract::State;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::warn;

use crate::GatewayState;
use crate::error::GatewayError;

/// Error body shared by every failure response.
#[derive(serde::Serialize)]
struct ApiError {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_tag: Option<&'static str>,
}

fn error_response(msg: &str, status: StatusCode, error_tag: Option<&'static str>) -> Response {
    (
        status,
        Json(ApiError {
            success: false,
            error: msg.to_string(),
            error_tag,
        }),
    )
        .into_response()
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            GatewayError::Duplicate(_) => StatusCode::CONFLICT,
            GatewayError::Classification { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Upload(_) | GatewayError::Enqueue(_) | GatewayError::Cancelled(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let tag = match &self {
            GatewayError::Classification { tag, .. } => Some(tag.as_str()),
            _ => None,
        };
        error_response(&self.to_string(), self.status(), tag)
    }
}

// ── Upload ─────────────────────────────────────────────────────

/// POST /upload
pub async fn upload(
    State(state): State<GatewayState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            state.dispatcher.metrics().record_rejected();
            return GatewayError::InvalidUpload(rejection.body_text()).into_response();
        }
    };

    let (file_name, payload) = match read_upload(&mut multipart, &state.upload_field).await {
        Ok(upload) => upload,
        Err(e) => {
            state.dispatcher.metrics().record_rejected();
            return e.into_response();
        }
    };

    match state.dispatcher.submit(payload, &file_name).await {
        Ok(done) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            done.artifact,
        )
            .into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                warn!(file = %file_name, error = %e, "upload failed");
            }
            e.into_response()
        }
    }
}

/// Find the file field and read it whole.
async fn read_upload(multipart: &mut Multipart, field_name: &str) -> Result<(String, Bytes), GatewayError> {
    let invalid = |e: axum::extract::multipart::MultipartError| GatewayError::InvalidUpload(e.body_text());

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some(field_name) {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::InvalidUpload(format!("field {field_name:?} has no filename")))?;
        let payload = field.bytes().await.map_err(invalid)?;
        return Ok((file_name, payload));
    }
    Err(GatewayError::InvalidUpload(format!("missing file field {field_name:?}")))
}

// ── Health & metrics ───────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<GatewayState>) -> impl IntoResponse {
    let fleet = state.fleet.as_ref().map(|rx| rx.borrow().clone());
    let body = classgrid_metrics::render_prometheus(
        &state.dispatcher.metrics().snapshot(),
        state.dispatcher.correlator().pending_count(),
        fleet.as_ref(),
    );
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
