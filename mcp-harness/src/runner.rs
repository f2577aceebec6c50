//! Validation runner: the fixed call sequence per target and its
//! classification
//!
//! Passes run with bounded parallelism and come back in registry order.
//! Within a pass calls are strictly sequential: `initialize`,
//! `notifications/initialized`, `tools/list` (following `nextCursor`), then
//! one smoke-test `tools/call`. Nothing a target does can fail the run; every
//! failure is recorded in that target's [`ValidationResult`].

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RunSettings;
use crate::error::CallError;
use crate::protocol::{
    methods, EnvelopeSchemas, ParsedResponse, ProtocolCodec, RequestEnvelope, ToolDescriptor,
};
use crate::registry::{Target, TargetRegistry};
use crate::report::{
    CallOutcome, CallResult, EnumerationState, Report, TargetStatus, ValidationResult,
};
use crate::session::Session;
use crate::transport::TransportAdapter;
use crate::{HarnessError, HarnessResult};

/// Operator interrupt shared by all passes of a run.
///
/// Passes check it between calls: an in-flight call finishes, the rest of
/// the sequence is skipped, and targets not yet started are reported as
/// cancelled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// New, not cancelled
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// True once cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives validation passes over a registry
pub struct ValidationRunner {
    settings: RunSettings,
    client: reqwest::Client,
    schemas: Arc<EnvelopeSchemas>,
}

impl ValidationRunner {
    /// Create a runner; fails on invalid settings
    pub fn new(settings: RunSettings) -> HarnessResult<Self> {
        settings.validate()?;

        let client = reqwest::Client::builder()
            .connect_timeout(settings.call_timeout())
            .user_agent(concat!("pulseengine-mcp-harness/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HarnessError::client(e.to_string()))?;

        Ok(Self {
            settings,
            client,
            schemas: EnvelopeSchemas::compile()?,
        })
    }

    /// Validate every target in the registry
    pub async fn run(&self, registry: &TargetRegistry) -> Report {
        self.run_with_cancel(registry, &CancelHandle::new()).await
    }

    /// Validate every target, stopping early when `cancel` fires
    pub async fn run_with_cancel(&self, registry: &TargetRegistry, cancel: &CancelHandle) -> Report {
        info!(
            "Validating {} targets with up to {} concurrent passes",
            registry.len(),
            self.settings.workers
        );

        let results = futures::stream::iter(registry.iter().cloned())
            .map(|target| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        info!("Skipping {}: run cancelled", target.name);
                        return ValidationResult::not_started(
                            &target,
                            "cancelled before the pass started",
                            Utc::now(),
                        );
                    }
                    self.run_target(&target, &cancel).await
                }
            })
            .buffered(self.settings.workers)
            .collect::<Vec<_>>()
            .await;

        let report = Report::new(results, Utc::now());
        info!("{}", report.summary_line());
        report
    }

    /// Run one target's pass
    pub async fn run_target(&self, target: &Target, cancel: &CancelHandle) -> ValidationResult {
        let span = info_span!("target", name = %target.name, transport = %target.transport);

        let pass = TargetPass {
            target,
            settings: &self.settings,
            cancel,
            adapter: TransportAdapter::for_target(target, self.client.clone(), &self.settings),
            codec: ProtocolCodec::with_schemas(self.schemas.clone()),
            session: Session::new(&target.name),
            deadline: Instant::now() + self.settings.target_deadline(),
            outcomes: Vec::new(),
            tools: Vec::new(),
            enumeration: EnumerationState::NotAttempted,
            notes: Vec::new(),
        };

        pass.execute().instrument(span).await
    }
}

/// Whether the sequence goes on after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// What came back for one request
struct Reply {
    result: Result<Value, CallError>,
    session_token: Option<String>,
    answered: bool,
    elapsed_ms: u64,
}

/// State of one target's pass
struct TargetPass<'a> {
    target: &'a Target,
    settings: &'a RunSettings,
    cancel: &'a CancelHandle,
    adapter: TransportAdapter,
    codec: ProtocolCodec,
    session: Session,
    deadline: Instant,
    outcomes: Vec<CallOutcome>,
    tools: Vec<ToolDescriptor>,
    enumeration: EnumerationState,
    notes: Vec<String>,
}

impl TargetPass<'_> {
    async fn execute(mut self) -> ValidationResult {
        let started_at = Utc::now();
        info!("Starting pass against {}", self.target.endpoint_url());

        if self.handshake().await == Flow::Continue && self.enumerate().await == Flow::Continue {
            self.smoke_test().await;
        }

        self.adapter.close().await;
        self.session.close();

        let status = classify(&self.outcomes, self.enumeration, self.tools.len());
        info!("Pass finished: {} ({} tools)", status, self.tools.len());

        let negotiated = self.session.negotiated();
        ValidationResult {
            target: self.target.name.clone(),
            transport: self.target.transport,
            status,
            tool_count: self.tools.len(),
            protocol_version: negotiated
                .map(|n| n.protocol_version.clone())
                .filter(|v| !v.is_empty()),
            capabilities: self.session.capabilities(),
            server_info: negotiated.and_then(|n| {
                n.server_name.as_ref().map(|name| match n.server_version {
                    Some(ref version) => format!("{} {}", name, version),
                    None => name.clone(),
                })
            }),
            session_token: self.session.token().map(|t| t.kind().to_string()),
            tools: self.tools,
            outcomes: self.outcomes,
            enumeration: self.enumeration,
            notes: self.notes,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// `initialize` then `notifications/initialized`
    async fn handshake(&mut self) -> Flow {
        if self.stop_requested(methods::INITIALIZE) {
            return Flow::Stop;
        }

        let request = self.codec.initialize(&self.settings.protocol_version);
        if let Err(e) = self.session.begin_handshake() {
            warn!("{}", e);
        }

        let reply = self.exchange(&request).await;
        if !reply.answered {
            self.record(&request, reply.elapsed_ms, reply.result);
            return Flow::Stop;
        }

        let mut negotiated = None;
        let result = match reply.result {
            Ok(payload) => match self.codec.decode_initialize(&payload) {
                Ok(decoded) => {
                    if !crate::is_version_supported(&decoded.protocol_version) {
                        warn!(
                            "Target negotiated unknown protocol version {}",
                            decoded.protocol_version
                        );
                        self.notes.push(format!(
                            "negotiated unknown protocol version {}",
                            decoded.protocol_version
                        ));
                    }
                    negotiated = Some(decoded);
                    Ok(payload)
                }
                Err(reason) => Err(CallError::ProtocolViolation {
                    reason: format!("invalid initialize result: {}", reason),
                }),
            },
            Err(error) => Err(error),
        };

        match self.session.establish(reply.session_token, negotiated) {
            Ok(token) if !token.is_issued() => {
                self.notes
                    .push("target issued no session token; a placeholder was used".to_string());
            }
            Ok(_) => {}
            Err(e) => warn!("{}", e),
        }

        if self.record(&request, reply.elapsed_ms, result) == Flow::Stop {
            return Flow::Stop;
        }

        self.notify_initialized().await
    }

    async fn notify_initialized(&mut self) -> Flow {
        if self.stop_requested(methods::INITIALIZED) {
            return Flow::Stop;
        }

        let notification = self.codec.initialized_notification();
        let started = Instant::now();
        let result = self
            .adapter
            .notify(&notification, &self.session, self.deadline)
            .await
            .map(|_| Value::Null)
            .map_err(CallError::from);

        if let Err(ref error) = result {
            warn!("{} was not accepted: {}", methods::INITIALIZED, error);
        }

        self.outcomes.push(CallOutcome {
            method: methods::INITIALIZED.to_string(),
            request_id: None,
            elapsed_ms: started.elapsed().as_millis() as u64,
            result: outcome_result(result.clone()),
        });

        match result {
            Err(CallError::Auth { .. }) => {
                self.notes
                    .push("remaining calls skipped after authorization failure".to_string());
                Flow::Stop
            }
            _ => Flow::Continue,
        }
    }

    /// `tools/list`, following `nextCursor` up to the page bound
    async fn enumerate(&mut self) -> Flow {
        let mut cursor: Option<String> = None;

        for _ in 0..self.settings.max_list_pages {
            if self.stop_requested(methods::TOOLS_LIST) {
                return Flow::Stop;
            }

            let request = self.codec.list_tools(cursor.as_deref());
            self.enumeration = EnumerationState::Failed;
            let reply = self.exchange(&request).await;

            let page = match reply.result {
                Ok(payload) => match self.codec.decode_tools_page(&payload) {
                    Ok(page) => {
                        self.record(&request, reply.elapsed_ms, Ok(payload));
                        page
                    }
                    Err(reason) => {
                        warn!("Malformed tools/list result: {}", reason);
                        self.enumeration = EnumerationState::Malformed;
                        self.tools.clear();
                        self.record(
                            &request,
                            reply.elapsed_ms,
                            Err(CallError::ProtocolViolation {
                                reason: format!("invalid tools/list result: {}", reason),
                            }),
                        );
                        return Flow::Stop;
                    }
                },
                Err(error) => {
                    if matches!(error, CallError::ProtocolViolation { .. }) {
                        self.enumeration = EnumerationState::Malformed;
                    }
                    // Pages received before the failure do not make an inventory
                    self.tools.clear();
                    self.record(&request, reply.elapsed_ms, Err(error));
                    self.notes
                        .push("tool enumeration failed; smoke test skipped".to_string());
                    return Flow::Stop;
                }
            };

            debug!("Received {} tools", page.tools.len());
            self.tools.extend(page.tools);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    self.enumeration = EnumerationState::Complete;
                    return Flow::Continue;
                }
            }
        }

        warn!(
            "Stopped following nextCursor after {} pages",
            self.settings.max_list_pages
        );
        self.notes.push(format!(
            "tool list truncated after {} pages",
            self.settings.max_list_pages
        ));
        self.enumeration = EnumerationState::Complete;
        Flow::Continue
    }

    /// One `tools/call`: the configured tool, else the first enumerated one
    async fn smoke_test(&mut self) {
        let (tool, arguments) = match self.target.smoke_test {
            Some(ref smoke) => (smoke.tool.clone(), smoke.arguments.clone()),
            None => match self.tools.first() {
                Some(first) => (first.name.clone(), json!({})),
                None => {
                    self.notes
                        .push("target listed no tools; smoke test skipped".to_string());
                    return;
                }
            },
        };

        if self.stop_requested(methods::TOOLS_CALL) {
            return;
        }

        info!("Invoking {} as smoke test", tool);
        let request = self.codec.call_tool(&tool, arguments);
        let reply = self.exchange(&request).await;

        let result = match reply.result {
            Ok(payload) => match self.codec.decode_tool_call(&payload) {
                Ok(call) if call.is_error => Err(CallError::ToolInvocation {
                    code: None,
                    message: call
                        .text
                        .unwrap_or_else(|| "tool reported isError".to_string()),
                }),
                Ok(_) => Ok(payload),
                Err(reason) => Err(CallError::ProtocolViolation {
                    reason: format!("invalid tools/call result: {}", reason),
                }),
            },
            Err(error) => Err(error),
        };

        self.record(&request, reply.elapsed_ms, result);
    }

    /// Send one request and parse whatever comes back
    async fn exchange(&mut self, request: &RequestEnvelope) -> Reply {
        let started = Instant::now();
        let sent = self
            .adapter
            .send(request, &self.session, self.deadline)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match sent {
            Ok(envelope) => {
                let result = match self.codec.parse_response(&envelope.message, request.id) {
                    ParsedResponse::Success(payload) => Ok(payload),
                    ParsedResponse::DeclaredError { code, message, .. } => {
                        debug!("{} declared error {}: {}", request.method, code, message);
                        Err(CallError::ToolInvocation {
                            code: Some(code),
                            message,
                        })
                    }
                    ParsedResponse::Malformed { reason } => {
                        warn!("Malformed {} response: {}", request.method, reason);
                        Err(CallError::ProtocolViolation { reason })
                    }
                };
                Reply {
                    result,
                    session_token: envelope.session_token,
                    answered: true,
                    elapsed_ms,
                }
            }
            Err(e) => {
                warn!("{} failed: {}", request.method, e);
                if Instant::now() >= self.deadline {
                    self.notes
                        .push(format!("target deadline expired during {}", request.method));
                }
                Reply {
                    result: Err(e.into()),
                    session_token: None,
                    answered: false,
                    elapsed_ms,
                }
            }
        }
    }

    /// Record an outcome; auth and session failures end the sequence
    fn record(
        &mut self,
        request: &RequestEnvelope,
        elapsed_ms: u64,
        result: Result<Value, CallError>,
    ) -> Flow {
        let flow = match result {
            Err(CallError::Auth { .. }) => {
                self.notes
                    .push("remaining calls skipped after authorization failure".to_string());
                Flow::Stop
            }
            Err(CallError::SessionRejected { .. }) => {
                self.notes
                    .push("session rejected by target; remaining calls skipped".to_string());
                Flow::Stop
            }
            _ => Flow::Continue,
        };

        self.outcomes.push(CallOutcome {
            method: request.method.clone(),
            request_id: Some(request.id),
            elapsed_ms,
            result: outcome_result(result),
        });
        flow
    }

    fn stop_requested(&mut self, next: &str) -> bool {
        if self.cancel.is_cancelled() {
            info!("Cancelled before {}", next);
            self.notes.push(format!("cancelled before {}", next));
            return true;
        }
        if Instant::now() >= self.deadline {
            warn!("Target deadline expired before {}", next);
            self.notes
                .push(format!("target deadline expired before {}", next));
            return true;
        }
        false
    }
}

fn outcome_result(result: Result<Value, CallError>) -> CallResult {
    match result {
        Ok(payload) => CallResult::Success { payload },
        Err(error) => CallResult::Failed { error },
    }
}

/// Classify a pass from its recorded outcomes.
///
/// Priority: handshake unanswered (auth rejection is `auth_failed`, anything
/// else `unreachable`), then any auth failure, then a malformed tool list,
/// then failed or empty enumeration (`degraded`), then any other malformed
/// envelope, then a smoke test that did not get a well-formed answer
/// (`degraded`). Notifications only count through auth failures.
pub fn classify(
    outcomes: &[CallOutcome],
    enumeration: EnumerationState,
    tool_count: usize,
) -> TargetStatus {
    let errors = || outcomes.iter().filter_map(CallOutcome::error);
    let request_errors = || {
        outcomes
            .iter()
            .filter(|o| o.request_id.is_some())
            .filter_map(CallOutcome::error)
    };

    let handshake = outcomes.iter().find(|o| o.method == methods::INITIALIZE);
    match handshake.and_then(CallOutcome::error) {
        None if handshake.is_none() => return TargetStatus::Unreachable,
        Some(CallError::Auth { .. }) => return TargetStatus::AuthFailed,
        Some(CallError::ProtocolViolation { .. }) => {}
        Some(error) if !error.is_well_formed() => return TargetStatus::Unreachable,
        _ => {}
    }

    if errors().any(|e| matches!(e, CallError::Auth { .. })) {
        return TargetStatus::AuthFailed;
    }

    if enumeration == EnumerationState::Malformed {
        return TargetStatus::ProtocolViolation;
    }

    if enumeration != EnumerationState::Complete || tool_count == 0 {
        return TargetStatus::Degraded;
    }

    if request_errors().any(|e| matches!(e, CallError::ProtocolViolation { .. })) {
        return TargetStatus::ProtocolViolation;
    }

    if request_errors().any(|e| !e.is_well_formed()) {
        return TargetStatus::Degraded;
    }

    TargetStatus::Healthy
}
