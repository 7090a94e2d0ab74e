//! HTTP surface: the encrypt/decrypt dataplane plus health and metrics.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kekgate_core::{Dataplane, KekError, PeerIdentity};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub dataplane: Arc<Dataplane>,
    pub limiter: Arc<RateLimiter>,
    pub metrics_handle: PrometheusHandle,
    pub startup: Instant,
}

#[derive(Debug, Deserialize)]
pub struct EncryptRequest {
    context: String,
    /// base64
    plaintext: String,
}

#[derive(Debug, Serialize)]
pub struct EncryptResponse {
    /// base64
    ciphertext: String,
    key_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    context: String,
    /// base64
    ciphertext: String,
    key_id: String,
}

#[derive(Debug, Serialize)]
pub struct DecryptResponse {
    /// base64
    plaintext: String,
}

pub async fn encrypt(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<EncryptRequest>,
) -> Result<Json<EncryptResponse>, AppError> {
    if !state.limiter.check(&peer.common_name) {
        return Err(AppError::too_many_requests());
    }
    let sealed = state
        .dataplane
        .encrypt(&peer, &request.context, &request.plaintext)?;
    Ok(Json(EncryptResponse {
        ciphertext: sealed.ciphertext,
        key_id: sealed.key_label,
    }))
}

pub async fn decrypt(
    State(state): State<AppState>,
    Extension(peer): Extension<PeerIdentity>,
    Json(request): Json<DecryptRequest>,
) -> Result<Json<DecryptResponse>, AppError> {
    if !state.limiter.check(&peer.common_name) {
        return Err(AppError::too_many_requests());
    }
    let plaintext = state.dataplane.decrypt(
        &peer,
        &request.context,
        &request.ciphertext,
        &request.key_id,
    )?;
    Ok(Json(DecryptResponse { plaintext }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
    kek_status: BTreeMap<String, &'static str>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let manager = state.dataplane.manager();
    let mut kek_status = BTreeMap::new();
    let mut degraded = false;
    for label in manager.key_labels() {
        let available = manager.has_key(&label);
        degraded |= !available;
        kek_status.insert(label, if available { "available" } else { "unavailable" });
    }

    let body = HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        uptime_seconds: state.startup.elapsed().as_secs(),
        kek_status,
    };
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

impl From<KekError> for AppError {
    fn from(err: KekError) -> Self {
        match err {
            KekError::InvalidCiphertext | KekError::InvalidBase64 | KekError::PayloadTooLarge => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            KekError::CertificateRevoked
            | KekError::MissingOu
            | KekError::UnknownOu
            | KekError::ContextNotAllowed => Self::new(StatusCode::FORBIDDEN, err.to_string()),
            // caller-controlled lookups: stable text, nothing echoed
            KekError::NoKeyForContext => Self::new(StatusCode::BAD_REQUEST, "invalid context"),
            KekError::KeyNotFound(label) => {
                warn!(label, "request referenced an unloaded KEK");
                Self::new(StatusCode::BAD_REQUEST, "key not found")
            }
            KekError::DecryptionFailed => {
                Self::new(StatusCode::BAD_REQUEST, "decryption failed")
            }
            other => {
                error!(error = %other, "internal error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}
