//! Signed, replay-resistant dispatch of validated commands.
//!
//! The request body is canonical JSON (object keys sorted at every depth) carrying a fresh
//! nonce and timestamp. An HMAC-SHA256 over those exact bytes travels in `X-Signature`,
//! the nonce in `X-Nonce`. Receivers verify the MAC over the raw body, then reject stale
//! timestamps and nonces they have already seen.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    circuit::{BreakerError, CircuitBreaker, CircuitOpenError},
    commands::{ActionResult, CommandType, Params, Severity, ValidatedCommand},
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex MAC.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Header carrying the request nonce.
pub const NONCE_HEADER: &str = "X-Nonce";

/// Body of `POST /v1/actions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRequest {
    /// Action identifier.
    pub action_id: String,
    /// Command type.
    pub command_type: CommandType,
    /// Parameters.
    pub params: Params,
    /// Schema-assigned severity.
    pub severity: Severity,
    /// Single-use nonce.
    pub nonce: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl ActionRequest {
    /// Builds a request with a fresh nonce and the current time.
    #[must_use]
    pub fn from_command(command: &ValidatedCommand) -> Self {
        Self {
            action_id: command.id().to_string(),
            command_type: command.command_type(),
            params: command.command().params.clone(),
            severity: command.severity(),
            nonce: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A request ready for the wire.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Decoded request.
    pub request: ActionRequest,
    /// Canonical JSON bytes that were signed.
    pub body: Vec<u8>,
    /// Hex HMAC over `body`.
    pub signature: String,
}

impl SignedRequest {
    /// The request nonce, as sent in [`NONCE_HEADER`].
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.request.nonce
    }
}

/// Transport failures. Every variant except `CircuitOpen` counts against the breaker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request could not be serialized or signed.
    #[error("encoding request: {0}")]
    Encode(String),
    /// Connection-level failure.
    #[error("http error: {0}")]
    Http(String),
    /// Non-2xx response.
    #[error("service answered {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Response body was not an action result.
    #[error("decoding response: {0}")]
    Decode(String),
    /// No answer within the dispatch timeout.
    #[error("dispatch timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// Receiver refused the signed request.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Breaker refused the call; nothing was sent.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

/// Serializes `value` with object keys sorted at every depth.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&sort_keys(value))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sort_keys(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Rejected signing key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("signing key must not be empty")]
pub struct InvalidSigningKey;

/// HMAC-SHA256 signer shared by the poller and the authorization service.
#[derive(Clone)]
pub struct RequestSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner").finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Keys the signer.
    pub fn new(key: &[u8]) -> Result<Self, InvalidSigningKey> {
        if key.is_empty() {
            return Err(InvalidSigningKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| InvalidSigningKey)?;
        Ok(Self { mac })
    }

    /// Hex MAC over `bytes`.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(bytes);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of a hex MAC.
    #[must_use]
    pub fn verify(&self, bytes: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(bytes);
        mac.verify_slice(&expected).is_ok()
    }

    /// Canonicalizes and signs `request`.
    pub fn sign_request(&self, request: ActionRequest) -> Result<SignedRequest, TransportError> {
        let body = canonical_json(&request).map_err(|err| TransportError::Encode(err.to_string()))?;
        let signature = self.sign(&body);
        Ok(SignedRequest {
            request,
            body,
            signature,
        })
    }
}

/// Reasons a receiver refuses a signed request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// `X-Signature` absent.
    #[error("missing signature")]
    MissingSignature,
    /// MAC mismatch.
    #[error("invalid signature")]
    BadSignature,
    /// Body is not an action request.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// `X-Nonce` disagrees with the signed body.
    #[error("nonce header does not match body")]
    NonceMismatch,
    /// Timestamp outside the accepted skew.
    #[error("request timestamp outside the accepted window")]
    Stale,
    /// Nonce already used.
    #[error("nonce already used")]
    Replay,
}

/// Receiver-side verification with a replay cache.
#[derive(Debug)]
pub struct RequestVerifier {
    signer: RequestSigner,
    max_skew: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl RequestVerifier {
    /// Accepts requests whose timestamp is within `max_skew` of now.
    #[must_use]
    pub fn new(signer: RequestSigner, max_skew: Duration) -> Self {
        Self {
            signer,
            max_skew,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Verifies MAC, nonce and freshness of a raw body.
    pub fn verify(
        &self,
        body: &[u8],
        signature: Option<&str>,
        nonce: Option<&str>,
    ) -> Result<ActionRequest, VerifyError> {
        let signature = signature.ok_or(VerifyError::MissingSignature)?;
        if !self.signer.verify(body, signature) {
            return Err(VerifyError::BadSignature);
        }
        let request: ActionRequest =
            serde_json::from_slice(body).map_err(|err| VerifyError::Malformed(err.to_string()))?;
        if nonce.is_some_and(|nonce| nonce != request.nonce) {
            return Err(VerifyError::NonceMismatch);
        }
        let delta = Utc::now().signed_duration_since(request.timestamp);
        let skew = delta
            .to_std()
            .or_else(|_| (-delta).to_std())
            .unwrap_or(Duration::MAX);
        if skew > self.max_skew {
            return Err(VerifyError::Stale);
        }
        self.remember(&request.nonce)?;
        Ok(request)
    }

    fn remember(&self, nonce: &str) -> Result<(), VerifyError> {
        let horizon = self.max_skew.saturating_mul(2);
        let mut seen = self.seen.lock();
        seen.retain(|_, at| at.elapsed() <= horizon);
        if seen.contains_key(nonce) {
            return Err(VerifyError::Replay);
        }
        seen.insert(nonce.to_string(), Instant::now());
        Ok(())
    }
}

/// Carries a signed request to the authorization service.
#[async_trait]
pub trait ActionTransport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;
    /// Sends the request and returns the service's terminal result.
    async fn send(&self, request: &SignedRequest) -> Result<ActionResult, TransportError>;
}

/// `reqwest` transport posting to `{base_url}/v1/actions`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Creates a transport for `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ActionTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &SignedRequest) -> Result<ActionResult, TransportError> {
        let response = self
            .client
            .post(format!("{}/v1/actions", self.base_url))
            .header(SIGNATURE_HEADER, &request.signature)
            .header(NONCE_HEADER, request.nonce())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone())
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<ActionResult>()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))
    }
}

/// Signs commands and sends them through a circuit breaker with a bounded timeout.
#[derive(Clone)]
pub struct SignedDispatcher {
    signer: RequestSigner,
    transport: Arc<dyn ActionTransport>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl SignedDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        signer: RequestSigner,
        transport: Arc<dyn ActionTransport>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            signer,
            transport,
            breaker,
            timeout,
        }
    }

    /// Breaker guarding the transport.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Signs and sends `command`.
    pub async fn dispatch(&self, command: &ValidatedCommand) -> Result<ActionResult, TransportError> {
        let signed = self.signer.sign_request(ActionRequest::from_command(command))?;
        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        debug!(
            action_id = %signed.request.action_id,
            transport = transport.name(),
            "dispatching signed request"
        );
        let outcome = self
            .breaker
            .call(|| async move {
                tokio::time::timeout(timeout, transport.send(&signed))
                    .await
                    .map_err(|_| TransportError::Timeout(timeout))?
            })
            .await;
        outcome.map_err(|err| match err {
            BreakerError::Open(open) => {
                warn!(breaker = %open.name, "dispatch refused by open circuit");
                TransportError::CircuitOpen(open)
            }
            BreakerError::Inner(inner) => inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        circuit::{BreakerConfig, CircuitState},
        commands::ActionStatus,
        parser::parse_line,
        validator::CommandValidator,
    };

    fn command(line: &str) -> ValidatedCommand {
        CommandValidator::default()
            .validate(parse_line(line, 1).unwrap())
            .unwrap()
    }

    fn signer() -> RequestSigner {
        RequestSigner::new(b"test-key").unwrap()
    }

    struct CountingTransport {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ActionTransport for CountingTransport {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send(&self, request: &SignedRequest) -> Result<ActionResult, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TransportError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(ActionResult::new(
                request.request.action_id.clone(),
                request.request.command_type,
                ActionStatus::Success,
                "ok",
            ))
        }
    }

    struct SlowTransport;

    #[async_trait]
    impl ActionTransport for SlowTransport {
        fn name(&self) -> &str {
            "slow"
        }

        async fn send(&self, _request: &SignedRequest) -> Result<ActionResult, TransportError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(TransportError::Http("unreachable".into()))
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": [ {"z": 1, "y": 2} ]}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":[{"y":2,"z":1}],"d":2},"b":1}"#
        );
    }

    #[test]
    fn requests_carry_fresh_nonces_and_verify() {
        let cmd = command("SCAN_SITE domain=example.com");
        let a = signer().sign_request(ActionRequest::from_command(&cmd)).unwrap();
        let b = signer().sign_request(ActionRequest::from_command(&cmd)).unwrap();
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.signature, b.signature);
        assert!(signer().verify(&a.body, &a.signature));
        assert!(!RequestSigner::new(b"other").unwrap().verify(&a.body, &a.signature));
        assert!(RequestSigner::new(b"").is_err());
    }

    #[test]
    fn verifier_rejects_tampering_and_replay() {
        let verifier = RequestVerifier::new(signer(), Duration::from_secs(300));
        let cmd = command("SCAN_SITE domain=example.com");
        let signed = signer().sign_request(ActionRequest::from_command(&cmd)).unwrap();

        let mut tampered = signed.body.clone();
        let last = tampered.len() - 2;
        tampered[last] ^= 1;
        assert_eq!(
            verifier.verify(&tampered, Some(&signed.signature), Some(signed.nonce())),
            Err(VerifyError::BadSignature)
        );
        assert_eq!(
            verifier.verify(&signed.body, None, Some(signed.nonce())),
            Err(VerifyError::MissingSignature)
        );
        assert_eq!(
            verifier.verify(&signed.body, Some(&signed.signature), Some("other")),
            Err(VerifyError::NonceMismatch)
        );

        let request = verifier
            .verify(&signed.body, Some(&signed.signature), Some(signed.nonce()))
            .unwrap();
        assert_eq!(request.severity, Severity::Low);
        assert_eq!(
            verifier.verify(&signed.body, Some(&signed.signature), Some(signed.nonce())),
            Err(VerifyError::Replay)
        );
    }

    #[test]
    fn verifier_rejects_stale_requests() {
        let verifier = RequestVerifier::new(signer(), Duration::from_secs(300));
        let mut request = ActionRequest::from_command(&command("SCAN_SITE domain=example.com"));
        request.timestamp = Utc::now() - chrono::Duration::minutes(10);
        let signed = signer().sign_request(request).unwrap();
        assert_eq!(
            verifier.verify(&signed.body, Some(&signed.signature), None),
            Err(VerifyError::Stale)
        );
    }

    #[tokio::test]
    async fn breaker_short_circuits_after_threshold() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "mcp_api",
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
            },
        ));
        let dispatcher = SignedDispatcher::new(
            signer(),
            transport.clone(),
            breaker.clone(),
            Duration::from_secs(1),
        );
        let cmd = command("SCAN_SITE domain=example.com");
        for _ in 0..3 {
            assert!(matches!(
                dispatcher.dispatch(&cmd).await,
                Err(TransportError::Status { status: 503, .. })
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            dispatcher.dispatch(&cmd).await,
            Err(TransportError::CircuitOpen(_))
        ));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let breaker = Arc::new(CircuitBreaker::new(
            "mcp_api",
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(60),
            },
        ));
        let dispatcher = SignedDispatcher::new(
            signer(),
            Arc::new(SlowTransport),
            breaker.clone(),
            Duration::from_millis(20),
        );
        let result = dispatcher
            .dispatch(&command("SCAN_SITE domain=example.com"))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn successful_dispatch_returns_service_result() {
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let dispatcher = SignedDispatcher::new(
            signer(),
            transport,
            Arc::new(CircuitBreaker::new("mcp_api", BreakerConfig::default())),
            Duration::from_secs(1),
        );
        let cmd = command("SCAN_SITE domain=example.com");
        let result = dispatcher.dispatch(&cmd).await.unwrap();
        assert_eq!(result.status, ActionStatus::Success);
        assert_eq!(result.action_id, cmd.id().to_string());
    }
}
