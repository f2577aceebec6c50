//! Transport adapter unifying the request-reply and streaming bindings
//!
//! Both bindings hand back a [`BindingResponse`]; the adapter resolves its
//! shape into one [`InboundEnvelope`] before anything else sees it. The
//! adapter also owns the per-method credential fallback, the bounded retry
//! of transport-level failures and the per-call timeout.

pub mod request_reply;
pub mod sse;
pub mod streaming;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error as ThisError;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RunSettings;
use crate::protocol::{response_id, InboundMessage, RequestEnvelope};
use crate::registry::{Credential, Target, TransportKind};
use crate::session::Session;
use crate::{CallError, PROTOCOL_VERSION_HEADER, SESSION_HEADER};

pub use request_reply::RequestReplyBinding;
pub use sse::{SseDecoder, SseFrame};
pub use streaming::StreamingBinding;

/// Media types offered on every POST
pub const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// Failure of one send/receive
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum TransportError {
    /// Connection refused, DNS failure or similar
    #[error("Connection error: {message}")]
    Connect { message: String },

    /// No response within the call timeout
    #[error("Timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// HTTP 401 or 403
    #[error("Unauthorized (HTTP {status})")]
    Unauthorized {
        status: u16,
        credential_attempted: bool,
    },

    /// HTTP 404 on a call that carried a session token
    #[error("Session rejected (HTTP {status})")]
    SessionRejected { status: u16 },

    /// Any other non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Event stream broken, closed or missing its endpoint event
    #[error("Stream error: {message}")]
    Stream { message: String },

    /// Request could not be built or sent
    #[error("Request error: {message}")]
    Request { message: String },
}

impl TransportError {
    /// Only connection-level failures and socket timeouts are retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            TransportError::Connect {
                message: e.to_string(),
            }
        } else if e.is_body() || e.is_decode() {
            TransportError::Stream {
                message: e.to_string(),
            }
        } else {
            TransportError::Request {
                message: e.to_string(),
            }
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { after_ms } => CallError::Timeout { after_ms },
            TransportError::Unauthorized {
                status,
                credential_attempted,
            } => CallError::Auth {
                status,
                credential_attempted,
            },
            TransportError::SessionRejected { status } => CallError::SessionRejected { status },
            other => CallError::Transport {
                message: other.to_string(),
            },
        }
    }
}

/// Headers attached to one attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallHeaders {
    /// `Mcp-Session-Id`
    pub session_token: Option<String>,
    /// `MCP-Protocol-Version`
    pub protocol_version: Option<String>,
    /// `Authorization`
    pub authorization: Option<String>,
}

impl CallHeaders {
    /// Attach the headers to an outgoing request
    pub fn apply(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if let Some(ref token) = self.session_token {
            builder = builder.header(SESSION_HEADER, token);
        }
        if let Some(ref version) = self.protocol_version {
            builder = builder.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(ref authorization) = self.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, authorization);
        }
        builder
    }

    /// Map an HTTP status to the transport error it signals, if any
    pub fn check_status(&self, status: StatusCode) -> Result<(), TransportError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized {
                status: status.as_u16(),
                credential_attempted: self.authorization.is_some(),
            });
        }
        if status == StatusCode::NOT_FOUND && self.session_token.is_some() {
            return Err(TransportError::SessionRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Read the session header from a response
pub fn session_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// True when the response's content type starts with `prefix`
pub fn has_content_type(response: &reqwest::Response, prefix: &str) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with(prefix))
        .unwrap_or(false)
}

/// The two shapes a response body can take
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// One JSON document, unparsed
    SingleDocument(String),
    /// SSE frames in arrival order
    EventFrames(Vec<SseFrame>),
}

impl ResponseShape {
    /// Reduce the shape to the single message answering `request_id`.
    ///
    /// Frames that do not parse or answer another id are discarded.
    pub fn resolve(self, request_id: u64) -> InboundMessage {
        match self {
            ResponseShape::SingleDocument(body) => match serde_json::from_str::<Value>(&body) {
                Ok(Value::Array(mut batch)) => {
                    match batch
                        .iter()
                        .position(|message| response_id(message) == Some(request_id))
                    {
                        Some(index) => InboundMessage::Document(batch.swap_remove(index)),
                        None => InboundMessage::Document(Value::Array(batch)),
                    }
                }
                Ok(document) => InboundMessage::Document(document),
                Err(e) => InboundMessage::Unparsable {
                    reason: format!("response body is not JSON: {}", e),
                },
            },
            ResponseShape::EventFrames(frames) => {
                let total = frames.len();
                for frame in frames {
                    match serde_json::from_str::<Value>(&frame.data) {
                        Ok(message) if response_id(&message) == Some(request_id) => {
                            return InboundMessage::Document(message);
                        }
                        Ok(_) => debug!("Discarding frame not answering request {}", request_id),
                        Err(e) => debug!("Discarding unparsable frame: {}", e),
                    }
                }
                InboundMessage::Unparsable {
                    reason: format!(
                        "no event frame answered request {} ({} frames discarded)",
                        request_id, total
                    ),
                }
            }
        }
    }
}

/// Raw answer from a binding
#[derive(Debug, Clone, PartialEq)]
pub struct BindingResponse {
    /// Body shape
    pub shape: ResponseShape,
    /// Session token the target handed out with this response
    pub session_token: Option<String>,
}

/// Canonical inbound envelope seen by the runner
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// The one message answering the request
    pub message: InboundMessage,
    /// Session token issued with the response
    pub session_token: Option<String>,
}

/// One way of moving envelopes to a target and back
#[async_trait]
pub trait Binding: Send + Sync {
    /// Send a request and collect the raw response for `request_id`
    async fn exchange(
        &self,
        body: &Value,
        request_id: u64,
        headers: &CallHeaders,
    ) -> Result<BindingResponse, TransportError>;

    /// Deliver a notification; no response is expected
    async fn notify(&self, body: &Value, headers: &CallHeaders) -> Result<(), TransportError>;

    /// Release connections held by the binding
    async fn close(&self);
}

/// Outcome of the anonymous-first attempt for one method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// The anonymous attempt was accepted
    AnonymousWorked,
    /// The target rejected the anonymous attempt
    CredentialRequired,
}

/// Per-method credential decisions for one target pass
#[derive(Debug, Default)]
pub struct CredentialPolicy {
    decisions: HashMap<String, AuthDecision>,
}

impl CredentialPolicy {
    /// Decision recorded for a method
    pub fn decision(&self, method: &str) -> Option<AuthDecision> {
        self.decisions.get(method).copied()
    }

    /// Whether the first attempt for `method` should carry the credential
    pub fn attach_credential(&self, method: &str) -> bool {
        self.decision(method) == Some(AuthDecision::CredentialRequired)
    }

    fn record(&mut self, method: &str, decision: AuthDecision) {
        self.decisions.insert(method.to_string(), decision);
    }
}

/// Bounded linear-backoff retry of transport-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay step; retry `n` waits `n * backoff`
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * attempt
    }
}

impl From<&RunSettings> for RetryPolicy {
    fn from(settings: &RunSettings) -> Self {
        Self {
            max_retries: settings.retries,
            backoff: settings.retry_backoff(),
        }
    }
}

enum Outgoing<'a> {
    Request { body: &'a Value, id: u64 },
    Notification { body: &'a Value },
}

/// Send/receive contract for one target, owned by its validation pass
pub struct TransportAdapter {
    target: String,
    binding: Box<dyn Binding>,
    credential: Option<Credential>,
    policy: CredentialPolicy,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl TransportAdapter {
    /// Adapter over the binding the target is configured for
    pub fn for_target(target: &Target, client: reqwest::Client, settings: &RunSettings) -> Self {
        let binding: Box<dyn Binding> = match target.transport {
            TransportKind::RequestReply => {
                Box::new(RequestReplyBinding::new(client, target.endpoint_url()))
            }
            TransportKind::Streaming => {
                Box::new(StreamingBinding::new(client, target.endpoint_url()))
            }
        };

        Self::with_binding(
            &target.name,
            binding,
            target.credential.clone(),
            RetryPolicy::from(settings),
            settings.call_timeout(),
        )
    }

    /// Adapter over an explicit binding
    pub fn with_binding(
        target: &str,
        binding: Box<dyn Binding>,
        credential: Option<Credential>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            target: target.to_string(),
            binding,
            credential,
            policy: CredentialPolicy::default(),
            retry,
            call_timeout,
        }
    }

    /// Credential decisions made so far
    pub fn credential_policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Send a request and return the canonical envelope answering it.
    ///
    /// Every attempt is bounded by the call timeout and by `deadline`.
    pub async fn send(
        &mut self,
        request: &RequestEnvelope,
        session: &Session,
        deadline: Instant,
    ) -> Result<InboundEnvelope, TransportError> {
        let body = request.to_value();
        let outgoing = Outgoing::Request {
            body: &body,
            id: request.id,
        };

        let response = self
            .dispatch(&request.method, &outgoing, session, deadline)
            .await?;

        match response {
            Some(response) => Ok(InboundEnvelope {
                message: response.shape.resolve(request.id),
                session_token: response.session_token,
            }),
            None => Err(TransportError::Stream {
                message: "binding returned no response".to_string(),
            }),
        }
    }

    /// Deliver a notification envelope
    pub async fn notify(
        &mut self,
        notification: &Value,
        session: &Session,
        deadline: Instant,
    ) -> Result<(), TransportError> {
        let method = notification
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("notification")
            .to_string();
        let outgoing = Outgoing::Notification { body: notification };

        self.dispatch(&method, &outgoing, session, deadline)
            .await
            .map(|_| ())
    }

    /// Release the binding's connections
    pub async fn close(&self) {
        self.binding.close().await;
    }

    async fn dispatch(
        &mut self,
        method: &str,
        outgoing: &Outgoing<'_>,
        session: &Session,
        deadline: Instant,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let mut with_credential = self.credential.is_some() && self.policy.attach_credential(method);

        loop {
            let headers = self.headers(session, with_credential);

            match self.attempt_with_retry(outgoing, &headers, deadline).await {
                Ok(response) => {
                    if !with_credential {
                        self.policy.record(method, AuthDecision::AnonymousWorked);
                    }
                    return Ok(response);
                }
                Err(TransportError::Unauthorized { status, .. })
                    if !with_credential && self.credential.is_some() =>
                {
                    debug!(
                        "Target {} rejected anonymous {} with HTTP {}; retrying with credential",
                        self.target, method, status
                    );
                    self.policy.record(method, AuthDecision::CredentialRequired);
                    with_credential = true;
                }
                Err(TransportError::Unauthorized { status, .. }) => {
                    if !with_credential {
                        self.policy.record(method, AuthDecision::CredentialRequired);
                    }
                    return Err(TransportError::Unauthorized {
                        status,
                        credential_attempted: with_credential,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_with_retry(
        &self,
        outgoing: &Outgoing<'_>,
        headers: &CallHeaders,
        deadline: Instant,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let mut attempt = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout { after_ms: 0 });
            }
            let timeout = self.call_timeout.min(remaining);

            match self.attempt(outgoing, headers, timeout).await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(e);
                    }
                    debug!(
                        "Target {}: {} (retry {}/{} in {:?})",
                        self.target, e, attempt, self.retry.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &self,
        outgoing: &Outgoing<'_>,
        headers: &CallHeaders,
        timeout: Duration,
    ) -> Result<Option<BindingResponse>, TransportError> {
        let call = async {
            match outgoing {
                Outgoing::Request { body, id } => {
                    self.binding.exchange(body, *id, headers).await.map(Some)
                }
                Outgoing::Notification { body } => {
                    self.binding.notify(body, headers).await.map(|_| None)
                }
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn headers(&self, session: &Session, with_credential: bool) -> CallHeaders {
        CallHeaders {
            session_token: session.token().map(|token| token.value().to_string()),
            protocol_version: session.protocol_version().map(str::to_string),
            authorization: if with_credential {
                self.credential.as_ref().map(Credential::authorization_value)
            } else {
                None
            },
        }
    }
}
