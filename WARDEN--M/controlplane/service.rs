//! HTTP surface of the authorization service.
//!
//! `POST /v1/actions` only accepts bodies carrying a valid `X-Signature`; the MAC is checked
//! over the raw bytes before anything is decoded. `POST /v1/validate` runs the risk stage
//! alone and `GET /health` reports the configured components.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    authorization::RiskError,
    commands::{ActionResult, CommandType, Params, ValidationResult},
    dispatcher::{RequestVerifier, VerifyError, NONCE_HEADER, SIGNATURE_HEADER},
    orchestrator::{ActionOrchestrator, HealthReport},
};

/// Shared state of the router.
#[derive(Debug, Clone)]
pub struct ServiceState {
    orchestrator: Arc<ActionOrchestrator>,
    verifier: Arc<RequestVerifier>,
}

impl ServiceState {
    /// Bundles the orchestrator with the verifier guarding `/v1/actions`.
    #[must_use]
    pub const fn new(orchestrator: Arc<ActionOrchestrator>, verifier: Arc<RequestVerifier>) -> Self {
        Self {
            orchestrator,
            verifier,
        }
    }
}

/// Error detail returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorDetail {
    /// Stable error code identifier.
    pub error_code: String,
    /// Human readable message.
    pub message: String,
}

/// Error response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorResponse {
    /// Error detail.
    pub error: ServiceErrorDetail,
}

/// Service error type.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Request body could not be understood.
    #[error("{message}")]
    BadRequest {
        /// Human readable message.
        message: String,
    },
    /// Signature, nonce or timestamp rejected.
    #[error("{message}")]
    Unauthorized {
        /// Human readable message.
        message: String,
    },
    /// A dependency could not be reached.
    #[error("{message}")]
    ServiceUnavailable {
        /// Human readable message.
        message: String,
    },
}

impl ServiceError {
    fn to_status_and_payload(&self) -> (StatusCode, ServiceErrorResponse) {
        let (status, code, message) = match self {
            Self::BadRequest { message } => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            Self::Unauthorized { message } => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
            Self::ServiceUnavailable { message } => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
            }
        };
        (
            status,
            ServiceErrorResponse {
                error: ServiceErrorDetail {
                    error_code: code.to_string(),
                    message: message.clone(),
                },
            },
        )
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, payload) = self.to_status_and_payload();
        (status, Json(payload)).into_response()
    }
}

impl From<VerifyError> for ServiceError {
    fn from(err: VerifyError) -> Self {
        let message = err.to_string();
        match err {
            VerifyError::Malformed(_) => Self::BadRequest { message },
            VerifyError::MissingSignature
            | VerifyError::BadSignature
            | VerifyError::NonceMismatch
            | VerifyError::Stale
            | VerifyError::Replay => Self::Unauthorized { message },
        }
    }
}

impl From<RiskError> for ServiceError {
    fn from(err: RiskError) -> Self {
        Self::ServiceUnavailable {
            message: err.to_string(),
        }
    }
}

/// Body of `POST /v1/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// Command type to assess.
    pub command_type: CommandType,
    /// Parameters to assess.
    #[serde(default)]
    pub params: Params,
}

/// Builds the service router.
pub fn router(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/actions", post(execute_action))
        .route("/v1/validate", post(validate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthReport> {
    Json(state.orchestrator.health())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn execute_action(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ActionResult>, ServiceError> {
    let request = state
        .verifier
        .verify(
            &body,
            header(&headers, SIGNATURE_HEADER),
            header(&headers, NONCE_HEADER),
        )
        .map_err(|err| {
            warn!(error = %err, "rejected action request");
            ServiceError::from(err)
        })?;
    let result = state.orchestrator.authorize_and_execute(&request).await;
    info!(action_id = %result.action_id, status = %result.status, "action resolved");
    Ok(Json(result))
}

async fn validate(
    State(state): State<ServiceState>,
    body: Bytes,
) -> Result<Json<ValidationResult>, ServiceError> {
    let request: ValidateRequest =
        serde_json::from_slice(&body).map_err(|err| ServiceError::BadRequest {
            message: format!("invalid validate request: {err}"),
        })?;
    let validation = state
        .orchestrator
        .validate_only(request.command_type, &request.params)
        .await?;
    Ok(Json(validation))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        commands::{ActionStatus, Severity},
        dispatcher::{ActionRequest, RequestSigner, SignedRequest},
    };
    use axum::{body::Body, http::Request};
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;

    fn signer() -> RequestSigner {
        RequestSigner::new(b"service-key").unwrap()
    }

    fn app() -> Router {
        let verifier = Arc::new(RequestVerifier::new(signer(), Duration::from_secs(300)));
        router(ServiceState::new(
            Arc::new(ActionOrchestrator::builder().build()),
            verifier,
        ))
    }

    fn signed(command_type: CommandType, age: chrono::Duration) -> SignedRequest {
        let params = Params::from([("domain".to_string(), "example.com".to_string())]);
        signer()
            .sign_request(ActionRequest {
                action_id: "act-1".into(),
                command_type,
                params,
                severity: Severity::Low,
                nonce: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now() - age,
            })
            .unwrap()
    }

    fn post_signed(request: &SignedRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/actions")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, &request.signature)
            .header(NONCE_HEADER, request.nonce())
            .body(Body::from(request.body.clone()))
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_reports_components() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["validator"]["name"], "heuristic");
        assert!(body["components"]["policy"]["blocked"]
            .as_array()
            .unwrap()
            .contains(&Value::from("CONNECT_INTEGRATION")));
    }

    #[tokio::test]
    async fn signed_action_is_executed() {
        let request = signed(CommandType::ScanSite, chrono::Duration::zero());
        let response = app().oneshot(post_signed(&request)).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let result: ActionResult = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(result.action_id, "act-1");
    }

    #[tokio::test]
    async fn missing_signature_is_unauthorized() {
        let request = signed(CommandType::ScanSite, chrono::Duration::zero());
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/actions")
                    .body(Body::from(request.body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"]["error_code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn tampered_body_is_unauthorized() {
        let request = signed(CommandType::ScanSite, chrono::Duration::zero());
        let mut tampered = request.clone();
        tampered.body = String::from_utf8(request.body)
            .unwrap()
            .replace("example.com", "evil.com")
            .into_bytes();
        let response = app().oneshot(post_signed(&tampered)).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replayed_nonce_is_unauthorized() {
        let app = app();
        let request = signed(CommandType::ScanSite, chrono::Duration::zero());
        let first = app.clone().oneshot(post_signed(&request)).await.expect("response");
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(post_signed(&request)).await.expect("response");
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stale_request_is_unauthorized() {
        let request = signed(CommandType::ScanSite, chrono::Duration::minutes(10));
        let response = app().oneshot(post_signed(&request)).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn validate_returns_assessment() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/validate")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"command_type":"SCAN_SITE","params":{"domain":"example.com"}}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let validation: ValidationResult =
            serde_json::from_value(json_body(response).await).unwrap();
        assert!(validation.passed);
        assert!(validation.risk_score < 0.8);
    }

    #[tokio::test]
    async fn validate_rejects_unknown_type() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/validate")
                    .body(Body::from(r#"{"command_type":"LAUNCH_ROCKET"}"#))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
