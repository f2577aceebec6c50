//! In-process mock MCP target for integration tests
//!
//! Serves the streamable HTTP binding on `POST /mcp` and the HTTP+SSE binding
//! on `GET /sse` + `POST /messages`, with switches for the misbehaviours the
//! harness has to classify.

#![allow(dead_code)]

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use pulseengine_mcp_harness::RunSettings;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How the request-reply endpoint shapes its bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyMode {
    /// `application/json` document
    #[default]
    Json,
    /// `text/event-stream` with unrelated frames before the answer
    EventFrames,
}

/// Behaviour switches for the mock target
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub body_mode: BodyMode,
    pub issue_session: bool,
    pub required_token: Option<String>,
    pub tools: Vec<Value>,
    pub page_size: Option<usize>,
    pub malformed_from_cursor: Option<usize>,
    pub hang_on: Option<String>,
    pub reject_session_on: Option<String>,
    pub tool_call_is_error: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            body_mode: BodyMode::Json,
            issue_session: true,
            required_token: None,
            tools: vec![tool("echo"), tool("search"), tool("list_repos")],
            page_size: None,
            malformed_from_cursor: None,
            hang_on: None,
            reject_session_on: None,
            tool_call_is_error: false,
        }
    }
}

impl MockBehavior {
    pub fn with_tools(mut self, names: &[&str]) -> Self {
        self.tools = names.iter().map(|name| tool(name)).collect();
        self
    }

    pub fn event_frames(mut self) -> Self {
        self.body_mode = BodyMode::EventFrames;
        self
    }

    pub fn without_session(mut self) -> Self {
        self.issue_session = false;
        self
    }

    pub fn requiring_token(mut self, token: &str) -> Self {
        self.required_token = Some(token.to_string());
        self
    }

    pub fn paged(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn malformed_tools_list(mut self) -> Self {
        self.malformed_from_cursor = Some(0);
        self
    }

    /// Pages starting at or after `cursor` come back malformed
    pub fn malformed_from(mut self, cursor: usize) -> Self {
        self.malformed_from_cursor = Some(cursor);
        self
    }

    /// Answer `method` with 404 when it carries a session id
    pub fn reject_session_on(mut self, method: &str) -> Self {
        self.reject_session_on = Some(method.to_string());
        self
    }

    pub fn hanging_on(mut self, method: &str) -> Self {
        self.hang_on = Some(method.to_string());
        self
    }

    pub fn failing_tool_call(mut self) -> Self {
        self.tool_call_is_error = true;
        self
    }
}

/// Tool descriptor as a target would list it
pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {} tool", name),
        "inputSchema": {"type": "object", "properties": {}}
    })
}

/// One request as the mock saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub session: Option<String>,
    pub protocol_version: Option<String>,
    pub authorization: Option<String>,
}

struct MockState {
    behavior: MockBehavior,
    session_id: String,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// Running mock target
pub struct MockTarget {
    pub url: String,
    state: Arc<MockState>,
}

impl MockTarget {
    pub async fn start(behavior: MockBehavior) -> Self {
        let state = Arc::new(MockState {
            behavior,
            session_id: format!("mock-{}", Uuid::new_v4()),
            streams: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/mcp", post(handle_mcp))
            .route("/sse", get(handle_sse))
            .route("/messages", post(handle_message))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    /// Session id this target issues
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }
}

/// Settings with short timeouts and no retries
pub fn fast_settings(output_dir: &Path) -> RunSettings {
    RunSettings {
        workers: 3,
        call_timeout_ms: 400,
        target_deadline_ms: 5_000,
        retries: 0,
        retry_backoff_ms: 10,
        output_dir: output_dir.to_path_buf(),
        ..RunSettings::default()
    }
}

/// An address nothing listens on
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn record(state: &MockState, headers: &HeaderMap, method: &str) {
    state.calls.lock().unwrap().push(RecordedCall {
        method: method.to_string(),
        session: header_value(headers, "mcp-session-id"),
        protocol_version: header_value(headers, "mcp-protocol-version"),
        authorization: header_value(headers, "authorization"),
    });
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    match state.behavior.required_token {
        Some(ref token) => {
            header_value(headers, "authorization") == Some(format!("Bearer {}", token))
        }
        None => true,
    }
}

/// Answer for one request; `None` for notifications
fn answer(state: &MockState, body: &Value) -> Option<Value> {
    let id = body.get("id")?.clone();
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let behavior = &state.behavior;

    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": "mock-target", "version": "1.0.0"}
        }),
        "tools/list" => {
            let start = body["params"]["cursor"]
                .as_str()
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            if behavior.malformed_from_cursor.is_some_and(|from| start >= from) {
                return Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": "not-a-list"}
                }));
            }
            let size = behavior.page_size.unwrap_or(behavior.tools.len().max(1));
            let end = (start + size).min(behavior.tools.len());
            let mut result = json!({"tools": behavior.tools[start..end].to_vec()});
            if end < behavior.tools.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            result
        }
        "tools/call" => json!({
            "content": [{"type": "text", "text": if behavior.tool_call_is_error { "tool failed" } else { "ok" }}],
            "isError": behavior.tool_call_is_error
        }),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }));
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

fn method_of(body: &Value) -> String {
    body.get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn handle_mcp(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let method = method_of(&body);
    record(&state, &headers, &method);

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if state.behavior.reject_session_on.as_deref() == Some(method.as_str())
        && headers.contains_key("mcp-session-id")
    {
        return StatusCode::NOT_FOUND.into_response();
    }

    if state.behavior.hang_on.as_deref() == Some(method.as_str()) {
        return std::future::pending::<Response>().await;
    }

    let Some(reply) = answer(&state, &body) else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mut response = match state.behavior.body_mode {
        BodyMode::Json => Json(reply).into_response(),
        BodyMode::EventFrames => {
            let frames = format!(
                ": stream opened\n\n\
                 event: message\ndata: not json at all\n\n\
                 event: message\ndata: {}\n\n\
                 event: message\ndata: {}\n\n\
                 event: message\ndata: {}\n\n",
                json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progress": 1}}),
                json!({"jsonrpc": "2.0", "id": 99999, "result": {}}),
                reply
            );
            ([(header::CONTENT_TYPE, "text/event-stream")], frames).into_response()
        }
    };

    if method == "initialize" && state.behavior.issue_session {
        if let Ok(value) = state.session_id.parse() {
            response.headers_mut().insert("mcp-session-id", value);
        }
    }

    response
}

async fn handle_sse(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    record(&state, &headers, "GET /sse");

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
    let session_id = state.session_id.clone();
    state
        .streams
        .lock()
        .unwrap()
        .insert(session_id.clone(), sender);

    let endpoint = if state.behavior.issue_session {
        format!("/messages?session_id={}", session_id)
    } else {
        "/messages".to_string()
    };

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = receiver.recv().await {
            yield Ok(Event::default().event("message").data(message));
        }
    };

    Sse::new(stream).into_response()
}

async fn handle_message(
    State(state): State<Arc<MockState>>,
    Query(_query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let method = method_of(&body);
    record(&state, &headers, &method);

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let sender = state
        .streams
        .lock()
        .unwrap()
        .get(&state.session_id)
        .cloned();
    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if state.behavior.hang_on.as_deref() != Some(method.as_str()) {
        if let Some(reply) = answer(&state, &body) {
            let _ = sender.send(reply.to_string());
        }
    }

    StatusCode::ACCEPTED.into_response()
}
