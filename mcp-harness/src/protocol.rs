//! JSON-RPC 2.0 envelope codec for the MCP calls the harness makes
//!
//! Outgoing requests carry a strictly increasing, target-local integer id.
//! Incoming payloads are checked against compiled JSON-RPC and MCP result
//! schemas, then correlated by id. Anything that does not fit the expected
//! shape becomes [`ParsedResponse::Malformed`]; nothing here panics on
//! target input.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{HarnessError, HarnessResult};

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names used by the fixed call sequence
pub mod methods {
    /// Handshake
    pub const INITIALIZE: &str = "initialize";
    /// Sent once the handshake response has been received
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Tool enumeration
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation
    pub const TOOLS_CALL: &str = "tools/call";
}

/// An outgoing request envelope
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Target-local request id
    pub id: u64,
    /// Method name
    pub method: String,
    /// Parameters object
    pub params: Value,
}

impl RequestEnvelope {
    /// JSON body sent on the wire
    pub fn to_value(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }
}

/// A payload handed over by the transport, already reduced to one message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// A JSON document
    Document(Value),
    /// Body or frames that could not yield a JSON message for this request
    Unparsable { reason: String },
}

/// Parsed response to one request
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// `result` member of a well-formed response
    Success(Value),
    /// `error` member of a well-formed response
    DeclaredError {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// Not a valid response envelope for this request
    Malformed { reason: String },
}

/// One tool as returned by `tools/list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,
    /// Human-readable description, absent when the target sent none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments, kept verbatim
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One page of a `tools/list` result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolsPage {
    /// Tools in the order the target returned them
    pub tools: Vec<ToolDescriptor>,
    /// Cursor for the next page
    pub next_cursor: Option<String>,
}

/// What the target declared in its `initialize` result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Negotiated {
    /// Protocol version chosen by the target
    pub protocol_version: String,
    /// Top-level capability names
    pub capabilities: BTreeSet<String>,
    /// Self-reported server name
    pub server_name: Option<String>,
    /// Self-reported server version
    pub server_version: Option<String>,
}

/// Result of the smoke-test `tools/call`
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    /// The tool reported failure through `isError`
    pub is_error: bool,
    /// First text content item, if any
    pub text: Option<String>,
}

/// Compiled schemas shared by every codec of a run
pub struct EnvelopeSchemas {
    response: JSONSchema,
    initialize_result: JSONSchema,
    tools_list_result: JSONSchema,
    tools_call_result: JSONSchema,
}

impl EnvelopeSchemas {
    /// Compile all schemas once
    pub fn compile() -> HarnessResult<Arc<Self>> {
        Ok(Arc::new(Self {
            response: compile_schema("response", &Self::response_schema_json())?,
            initialize_result: compile_schema(
                "initialize result",
                &Self::initialize_result_schema_json(),
            )?,
            tools_list_result: compile_schema(
                "tools/list result",
                &Self::tools_list_result_schema_json(),
            )?,
            tools_call_result: compile_schema(
                "tools/call result",
                &Self::tools_call_result_schema_json(),
            )?,
        }))
    }

    /// JSON-RPC 2.0 response schema
    fn response_schema_json() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "jsonrpc": {
                    "type": "string",
                    "enum": ["2.0"]
                },
                "result": {},
                "error": {
                    "type": "object",
                    "properties": {
                        "code": {"type": "integer"},
                        "message": {"type": "string"},
                        "data": {}
                    },
                    "required": ["code", "message"]
                },
                "id": {
                    "oneOf": [
                        {"type": "string"},
                        {"type": "number"},
                        {"type": "null"}
                    ]
                }
            },
            "required": ["jsonrpc", "id"],
            "oneOf": [
                {"required": ["result"]},
                {"required": ["error"]}
            ],
            "additionalProperties": false
        })
    }

    /// MCP `initialize` result schema
    fn initialize_result_schema_json() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "protocolVersion": {"type": "string"},
                "capabilities": {"type": "object"},
                "serverInfo": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "version": {"type": "string"}
                    }
                }
            },
            "required": ["protocolVersion", "capabilities"]
        })
    }

    /// MCP `tools/list` result schema
    fn tools_list_result_schema_json() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "tools": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string", "minLength": 1},
                            "description": {"type": "string"},
                            "inputSchema": {"type": "object"}
                        },
                        "required": ["name", "inputSchema"]
                    }
                },
                "nextCursor": {"type": "string"}
            },
            "required": ["tools"]
        })
    }

    /// MCP `tools/call` result schema
    fn tools_call_result_schema_json() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "content": {"type": "array"},
                "isError": {"type": "boolean"}
            }
        })
    }
}

fn compile_schema(label: &str, schema: &Value) -> HarnessResult<JSONSchema> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| HarnessError::schema(format!("Failed to compile {} schema: {}", label, e)))
}

fn validate_with_schema(schema: &JSONSchema, value: &Value) -> Result<(), String> {
    match schema.validate(value) {
        Ok(_) => Ok(()),
        Err(errors) => Err(errors
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")),
    }
}

/// Id of a response message, or `None` for requests, notifications and
/// non-numeric ids
pub fn response_id(message: &Value) -> Option<u64> {
    if message.get("method").is_some() {
        return None;
    }
    message.get("id").and_then(Value::as_u64)
}

/// Envelope builder and parser for one target pass
pub struct ProtocolCodec {
    schemas: Arc<EnvelopeSchemas>,
    last_id: u64,
}

impl ProtocolCodec {
    /// Create a codec with freshly compiled schemas
    pub fn new() -> HarnessResult<Self> {
        Ok(Self::with_schemas(EnvelopeSchemas::compile()?))
    }

    /// Create a codec sharing already compiled schemas
    pub fn with_schemas(schemas: Arc<EnvelopeSchemas>) -> Self {
        Self {
            schemas,
            last_id: 0,
        }
    }

    /// Build a request with the next id
    pub fn request(&mut self, method: &str, params: Value) -> RequestEnvelope {
        self.last_id += 1;
        RequestEnvelope {
            id: self.last_id,
            method: method.to_string(),
            params,
        }
    }

    /// Build the `initialize` request
    pub fn initialize(&mut self, protocol_version: &str) -> RequestEnvelope {
        self.request(
            methods::INITIALIZE,
            json!({
                "protocolVersion": protocol_version,
                "capabilities": {},
                "clientInfo": {
                    "name": "pulseengine-mcp-harness",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    /// Build the `notifications/initialized` notification
    pub fn initialized_notification(&self) -> Value {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": methods::INITIALIZED,
        })
    }

    /// Build a `tools/list` request
    pub fn list_tools(&mut self, cursor: Option<&str>) -> RequestEnvelope {
        let params = match cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        self.request(methods::TOOLS_LIST, params)
    }

    /// Build a `tools/call` request
    pub fn call_tool(&mut self, name: &str, arguments: Value) -> RequestEnvelope {
        self.request(
            methods::TOOLS_CALL,
            json!({
                "name": name,
                "arguments": arguments,
            }),
        )
    }

    /// Parse an inbound message as the response to `expected_id`
    pub fn parse_response(&self, message: &InboundMessage, expected_id: u64) -> ParsedResponse {
        let value = match message {
            InboundMessage::Document(value) => value,
            InboundMessage::Unparsable { reason } => {
                return ParsedResponse::Malformed {
                    reason: reason.clone(),
                };
            }
        };

        if let Err(reason) = validate_with_schema(&self.schemas.response, value) {
            return ParsedResponse::Malformed {
                reason: format!("not a JSON-RPC 2.0 response: {}", reason),
            };
        }

        if value.get("id").and_then(Value::as_u64) != Some(expected_id) {
            return ParsedResponse::Malformed {
                reason: format!(
                    "response id {} does not match request id {}",
                    value.get("id").cloned().unwrap_or(Value::Null),
                    expected_id
                ),
            };
        }

        if let Some(error) = value.get("error") {
            return match error.get("code").and_then(Value::as_i64) {
                Some(code) => ParsedResponse::DeclaredError {
                    code,
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    data: error.get("data").cloned(),
                },
                None => ParsedResponse::Malformed {
                    reason: "error code is not an integer".to_string(),
                },
            };
        }

        match value.get("result") {
            Some(result) => ParsedResponse::Success(result.clone()),
            None => ParsedResponse::Malformed {
                reason: "response carries neither result nor error".to_string(),
            },
        }
    }

    /// Decode an `initialize` result
    pub fn decode_initialize(&self, result: &Value) -> Result<Negotiated, String> {
        validate_with_schema(&self.schemas.initialize_result, result)?;

        let capabilities = result
            .get("capabilities")
            .and_then(Value::as_object)
            .map(|caps| caps.keys().cloned().collect())
            .unwrap_or_default();

        let server_info = result.get("serverInfo");
        let info_field = |field: &str| {
            server_info
                .and_then(|info| info.get(field))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(Negotiated {
            protocol_version: result
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            capabilities,
            server_name: info_field("name"),
            server_version: info_field("version"),
        })
    }

    /// Decode one `tools/list` page
    pub fn decode_tools_page(&self, result: &Value) -> Result<ToolsPage, String> {
        validate_with_schema(&self.schemas.tools_list_result, result)?;

        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let tools: Vec<ToolDescriptor> =
            serde_json::from_value(tools).map_err(|e| format!("invalid tool descriptor: {}", e))?;

        let next_cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|cursor| !cursor.is_empty())
            .map(str::to_string);

        Ok(ToolsPage { tools, next_cursor })
    }

    /// Decode a `tools/call` result
    pub fn decode_tool_call(&self, result: &Value) -> Result<ToolCallResult, String> {
        validate_with_schema(&self.schemas.tools_call_result, result)?;

        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| {
                items
                    .iter()
                    .find_map(|item| item.get("text").and_then(Value::as_str))
            })
            .map(str::to_string);

        Ok(ToolCallResult {
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn codec() -> ProtocolCodec {
        ProtocolCodec::new().unwrap()
    }

    #[test]
    fn test_request_ids_strictly_increase() {
        let mut codec = codec();
        let a = codec.initialize("2025-06-18");
        let b = codec.list_tools(None);
        let c = codec.call_tool("echo", json!({}));
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));

        let body = c.to_value();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["method"], "tools/call");
        assert_eq!(body["params"]["name"], "echo");
    }

    #[test]
    fn test_fresh_codec_restarts_ids() {
        let schemas = EnvelopeSchemas::compile().unwrap();
        let mut first = ProtocolCodec::with_schemas(schemas.clone());
        first.list_tools(None);
        let mut second = ProtocolCodec::with_schemas(schemas);
        assert_eq!(second.list_tools(None).id, 1);
    }

    #[test]
    fn test_parse_success_and_declared_error() {
        let codec = codec();
        let ok = InboundMessage::Document(json!({"jsonrpc": "2.0", "id": 4, "result": {"x": 1}}));
        assert_eq!(
            codec.parse_response(&ok, 4),
            ParsedResponse::Success(json!({"x": 1}))
        );

        let err = InboundMessage::Document(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "error": {"code": -32601, "message": "Method not found"}
        }));
        assert_matches!(
            codec.parse_response(&err, 5),
            ParsedResponse::DeclaredError { code: -32601, .. }
        );
    }

    #[test]
    fn test_parse_malformed_shapes() {
        let codec = codec();
        let cases = vec![
            json!({"id": 1, "result": {}}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": 1, "result": {}, "error": {"code": 1, "message": "x"}}),
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": "bad", "message": "x"}}),
            json!({"jsonrpc": "2.0", "id": 2, "result": {}}),
            json!("just a string"),
        ];
        for case in cases {
            assert_matches!(
                codec.parse_response(&InboundMessage::Document(case.clone()), 1),
                ParsedResponse::Malformed { .. },
                "expected malformed for {}",
                case
            );
        }

        let unparsable = InboundMessage::Unparsable {
            reason: "body is not JSON".to_string(),
        };
        assert_matches!(
            codec.parse_response(&unparsable, 1),
            ParsedResponse::Malformed { reason } if reason == "body is not JSON"
        );
    }

    #[test]
    fn test_decode_initialize() {
        let codec = codec();
        let negotiated = codec
            .decode_initialize(&json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {"listChanged": true}, "logging": {}},
                "serverInfo": {"name": "github-mcp", "version": "1.2.0"}
            }))
            .unwrap();
        assert_eq!(negotiated.protocol_version, "2025-03-26");
        assert_eq!(
            negotiated.capabilities.iter().cloned().collect::<Vec<_>>(),
            vec!["logging".to_string(), "tools".to_string()]
        );
        assert_eq!(negotiated.server_name.as_deref(), Some("github-mcp"));

        assert!(codec.decode_initialize(&json!({"capabilities": {}})).is_err());
    }

    #[test]
    fn test_decode_tools_page_preserves_order() {
        let codec = codec();
        let page = codec
            .decode_tools_page(&json!({
                "tools": [
                    {"name": "zeta", "description": "last letter", "inputSchema": {"type": "object"}},
                    {"name": "alpha", "inputSchema": {"type": "object", "properties": {}}}
                ],
                "nextCursor": "page-2"
            }))
            .unwrap();
        let names: Vec<_> = page.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(page.tools[0].description.as_deref(), Some("last letter"));
        assert_eq!(page.tools[1].description, None);
        assert_eq!(page.next_cursor.as_deref(), Some("page-2"));

        // Re-serialized descriptors match what the target sent
        let reserialized = serde_json::to_value(&page.tools[1]).unwrap();
        assert_eq!(
            reserialized,
            json!({"name": "alpha", "inputSchema": {"type": "object", "properties": {}}})
        );

        assert!(codec.decode_tools_page(&json!({"items": []})).is_err());
        assert!(
            codec
                .decode_tools_page(&json!({"tools": [{"name": "no-schema"}]}))
                .is_err()
        );
    }

    #[test]
    fn test_decode_tool_call() {
        let codec = codec();
        let result = codec
            .decode_tool_call(&json!({
                "content": [{"type": "text", "text": "rate limited"}],
                "isError": true
            }))
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.text.as_deref(), Some("rate limited"));

        assert!(codec.decode_tool_call(&json!([])).is_err());
    }

    #[test]
    fn test_response_id_ignores_requests() {
        assert_eq!(response_id(&json!({"jsonrpc": "2.0", "id": 7, "result": {}})), Some(7));
        assert_eq!(
            response_id(&json!({"jsonrpc": "2.0", "id": 7, "method": "sampling/createMessage"})),
            None
        );
        assert_eq!(response_id(&json!({"jsonrpc": "2.0", "id": "7", "result": {}})), None);
    }
}
