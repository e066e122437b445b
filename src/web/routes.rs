//! Route handlers for the two gateway modes.
//!
//! Every handler maps internal outcomes onto the small enumerated status
//! set; classified failure detail never leaves the process.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Router,
};
use tracing::{error, info, warn};

use crate::auth::{LoginError, LoginFlow};
use crate::challenge::CionResponse;
use crate::join::{FetchError, JoinService};
use crate::ptc::AUTH_TIMEOUT;

// ========== Auth mode ==========

#[derive(Debug, serde::Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Success,
    Error,
    Invalid,
    Banned,
    Timeout,
}

#[derive(Debug, serde::Serialize)]
pub struct AuthResponse {
    pub status: AuthStatus,
    pub login_code: String,
}

/// Map a login outcome onto wire status and HTTP code. `None` means the
/// external deadline fired.
fn login_outcome(result: Option<Result<String, LoginError>>) -> (StatusCode, AuthResponse) {
    match result {
        Some(Ok(login_code)) => {
            info!("200 OK: successful auth");
            (
                StatusCode::OK,
                AuthResponse {
                    status: AuthStatus::Success,
                    login_code,
                },
            )
        }
        Some(Err(LoginError::InvalidCredentials)) => {
            warn!("400 Bad Request: invalid credentials");
            (
                StatusCode::BAD_REQUEST,
                AuthResponse {
                    status: AuthStatus::Invalid,
                    login_code: String::new(),
                },
            )
        }
        Some(Err(LoginError::Banned)) => {
            warn!("418: account is banned");
            (
                StatusCode::IM_A_TEAPOT,
                AuthResponse {
                    status: AuthStatus::Banned,
                    login_code: String::new(),
                },
            )
        }
        Some(Err(e)) => {
            error!("500 Internal Server Error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                AuthResponse {
                    status: AuthStatus::Error,
                    login_code: String::new(),
                },
            )
        }
        None => {
            error!("408: exceeded auth timeout");
            (
                StatusCode::REQUEST_TIMEOUT,
                AuthResponse {
                    status: AuthStatus::Timeout,
                    login_code: String::new(),
                },
            )
        }
    }
}

async fn auth_endpoint(
    Extension(flow): Extension<Arc<LoginFlow>>,
    Json(request): Json<AuthRequest>,
) -> impl IntoResponse {
    // The attempt runs as its own task: if the deadline fires the result is
    // discarded but the attempt completes in the background and still
    // updates proxy health and failure counters.
    let attempt = tokio::spawn(async move {
        flow.auth(&request.username, &request.password, &request.url)
            .await
    });

    let result = match tokio::time::timeout(AUTH_TIMEOUT, attempt).await {
        Err(_) => None,
        Ok(Err(join_err)) => {
            error!("auth task failed: {}", join_err);
            Some(Err(LoginError::Login("internal error".to_string())))
        }
        Ok(Ok(result)) => Some(result),
    };

    let (status, body) = login_outcome(result);
    (status, Json(body))
}

#[derive(Debug, serde::Deserialize)]
pub struct ActivateRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivateStatus {
    Success,
    NoOpenActivation,
}

#[derive(Debug, serde::Serialize)]
pub struct ActivateResponse {
    pub status: ActivateStatus,
}

async fn activate_endpoint(Json(_request): Json<ActivateRequest>) -> impl IntoResponse {
    Json(ActivateResponse {
        status: ActivateStatus::NoOpenActivation,
    })
}

/// Router for interactive auth mode.
pub fn auth_router(flow: Arc<LoginFlow>) -> Router {
    Router::new()
        .route("/api/v1/login-code", post(auth_endpoint))
        .route("/api/v1/activate", post(activate_endpoint))
        .layer(Extension(flow))
}

// ========== Cion mode ==========

#[derive(Debug, serde::Deserialize)]
pub struct CionRequest {
    #[serde(default)]
    pub proxy: Option<String>,
}

async fn cion_endpoint(
    Extension(service): Extension<Arc<JoinService>>,
    Json(request): Json<CionRequest>,
) -> impl IntoResponse {
    match service.fetch_tokens(request.proxy).await {
        Ok(Some(bundle)) => {
            info!("200: returned tokens to cion");
            (StatusCode::OK, Json(vec![bundle])).into_response()
        }
        Ok(None) => (StatusCode::OK, Json(Vec::<CionResponse>::new())).into_response(),
        Err(FetchError::Busy) => {
            warn!("503: token acquisition already in flight");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Err(e) => {
            error!("500: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// Router for cion (join-token) mode.
pub fn cion_router(service: Arc<JoinService>) -> Router {
    Router::new()
        .route("/api/v1/cion", post(cion_endpoint))
        .layer(Extension(service))
}
