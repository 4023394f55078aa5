//! Shared types for the MCP host.
//!
//! JSON-RPC envelopes exchanged with managed processes, the server data
//! model, and the views handed back to collaborators.

use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

// ─── JSON-RPC ───────────────────────────────────────────────────────────────

/// Identifier of the distinguished `initialize` request.
pub const INITIALIZE_REQUEST_ID: i64 = 1;

/// Protocol version announced in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC method name that carries tool invocations.
pub const TOOLS_CALL: &str = "tools/call";

/// JSON-RPC request identifier. Servers echo it back verbatim, so both the
/// numeric handshake id and the string ids of regular calls must round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    /// A fresh identifier for a regular call.
    pub fn generate() -> Self {
        RequestId::Text(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC 2.0 request message.
///
/// Field order is the wire order: `jsonrpc`, `id`, `method`, `params`.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any JSON object read from a server's stdout.
///
/// Lenient on purpose: servers interleave responses, their own requests,
/// notifications and arbitrary JSON log lines on the same stream.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Kept raw; servers do not always send a well-formed error object.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl InboundMessage {
    /// A response carries an id and no method of its own.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// Whether this is the answer to the `initialize` request.
    pub fn is_initialize_response(&self) -> bool {
        self.id == Some(RequestId::Number(INITIALIZE_REQUEST_ID))
            && self.method.is_none()
            && self
                .result
                .as_ref()
                .and_then(|r| r.get("protocolVersion"))
                .is_some()
    }

    /// The error payload, if any, read leniently.
    ///
    /// An object yields its `code`, `message` and `data`; a bare string is
    /// taken as the message; anything else is rendered as JSON.
    pub fn remote_error(&self) -> Option<JsonRpcError> {
        let raw = self.error.as_ref()?;
        let error = match raw {
            serde_json::Value::Object(fields) => JsonRpcError {
                code: fields.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: match fields.get("message") {
                    Some(serde_json::Value::String(m)) => m.clone(),
                    Some(serde_json::Value::Null) | None => DEFAULT_ERROR_MESSAGE.to_string(),
                    Some(other) => other.to_string(),
                },
                data: fields.get("data").cloned(),
            },
            serde_json::Value::String(message) => JsonRpcError {
                code: 0,
                message: message.clone(),
                data: None,
            },
            other => JsonRpcError {
                code: 0,
                message: other.to_string(),
                data: None,
            },
        };
        Some(error)
    }
}

const DEFAULT_ERROR_MESSAGE: &str = "Unknown error";

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

// ─── Server Model ───────────────────────────────────────────────────────────

/// Risk classification of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RiskTier {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl RiskTier {
    /// Parse a configured tier: `1`/`2`/`3` or `low`/`medium`/`high`.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().and_then(Self::from_level),
            serde_json::Value::String(s) => Self::from_name(s),
            _ => None,
        }
    }

    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            1 => Some(RiskTier::Low),
            2 => Some(RiskTier::Medium),
            3 => Some(RiskTier::High),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" => Some(RiskTier::Low),
            "medium" => Some(RiskTier::Medium),
            "high" => Some(RiskTier::High),
            other => other.parse::<i64>().ok().and_then(Self::from_level),
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            RiskTier::Low => "Low risk - Standard execution",
            RiskTier::Medium => "Medium risk - Requires confirmation",
            RiskTier::High => "High risk - Docker execution required",
        }
    }
}

impl Serialize for RiskTier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.level())
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => f.write_str("low"),
            RiskTier::Medium => f.write_str("medium"),
            RiskTier::High => f.write_str("high"),
        }
    }
}

/// Container settings for HIGH risk servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub network: Option<String>,
}

impl SandboxSpec {
    pub fn is_valid(&self) -> bool {
        !self.image.trim().is_empty()
    }
}

/// A validated server definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDefinition {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Working directory for the process (inherited when unset).
    pub cwd: Option<String>,
    pub risk_tier: Option<RiskTier>,
    pub sandbox: Option<SandboxSpec>,
}

impl ServerDefinition {
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            risk_tier: None,
            sandbox: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_risk_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = Some(tier);
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxSpec) -> Self {
        self.sandbox = Some(sandbox);
        self
    }
}

/// The invocation actually handed to the OS.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables added to the inherited environment of the spawned process.
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    /// `true` when the invocation was rewritten into a container run.
    pub sandboxed: bool,
    /// The configured command, kept when it was rewritten.
    pub original_command: Option<String>,
}

/// Initialization state of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitState {
    Starting,
    Initialized,
    Timeout,
    Error,
    Exited,
}

impl InitState {
    pub fn as_str(self) -> &'static str {
        match self {
            InitState::Starting => "starting",
            InitState::Initialized => "initialized",
            InitState::Timeout => "timeout",
            InitState::Error => "error",
            InitState::Exited => "exited",
        }
    }

    /// Handshake failures are kept in the registry after the process is gone.
    pub fn is_handshake_failure(self) -> bool {
        matches!(self, InitState::Timeout | InitState::Error)
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Views ──────────────────────────────────────────────────────────────────

/// One entry of `list_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub connected: bool,
    pub pid: Option<u32>,
    pub initialization_state: Option<InitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_in_sandbox: Option<bool>,
}

/// Result of `create_server`.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedServer {
    pub id: String,
    pub status: String,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_in_sandbox: Option<bool>,
}

/// Returned instead of a result when a MEDIUM risk call needs approval.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationRequired {
    pub requires_confirmation: bool,
    pub confirmation_id: String,
    pub risk_level: RiskTier,
    pub risk_description: String,
    pub server_id: String,
    pub method: String,
    pub tool_name: Option<String>,
    pub expires_at: String,
}

/// Where a HIGH risk call ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionEnvironment {
    pub risk_level: RiskTier,
    pub risk_description: String,
    pub sandboxed: bool,
    pub image: String,
}

const EXECUTION_ENVIRONMENT_KEY: &str = "execution_environment";

/// A completed call: the server's result plus optional annotation.
///
/// Serializes as the server's result unchanged. With an annotation, an
/// object result gains an `execution_environment` field; any other result is
/// wrapped as `{result, execution_environment}`.
#[derive(Debug, Clone)]
pub struct CallResult {
    pub result: serde_json::Value,
    pub execution_environment: Option<ExecutionEnvironment>,
}

impl Serialize for CallResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(env) = &self.execution_environment else {
            return self.result.serialize(serializer);
        };

        let mut map = serializer.serialize_map(None)?;
        match &self.result {
            serde_json::Value::Object(fields) => {
                for (key, value) in fields {
                    if key != EXECUTION_ENVIRONMENT_KEY {
                        map.serialize_entry(key, value)?;
                    }
                }
            }
            other => map.serialize_entry("result", other)?,
        }
        map.serialize_entry(EXECUTION_ENVIRONMENT_KEY, env)?;
        map.end()
    }
}

/// Outcome of a gated invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InvokeOutcome {
    Completed(CallResult),
    ConfirmationRequired(ConfirmationRequired),
}

impl InvokeOutcome {
    pub fn is_confirmation_required(&self) -> bool {
        matches!(self, InvokeOutcome::ConfirmationRequired(_))
    }
}

/// Outcome of `confirm`.
///
/// `Completed` serializes like [`CallResult`]; `Rejected` as
/// `{"status": "rejected", "message": ...}`.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    Completed(CallResult),
    Rejected { message: String },
}

impl Serialize for ConfirmOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfirmOutcome::Completed(call) => call.serialize(serializer),
            ConfirmOutcome::Rejected { message } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("status", "rejected")?;
                map.serialize_entry("message", message)?;
                map.end()
            }
        }
    }
}

/// A pending confirmation as exposed by `list_confirmations`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmationSummary {
    pub confirmation_id: String,
    pub server_id: String,
    pub method: String,
    pub tool_name: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_field_order() {
        let req = JsonRpcRequest::new(
            RequestId::Text("abc".into()),
            "tools/call",
            serde_json::json!({"name": "x"}),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"jsonrpc":"2.0","id":"abc","method":"tools/call","params":{"name":"x"}}"#
        );
    }

    #[test]
    fn test_notification_omits_id_and_empty_params() {
        let n = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);
    }

    #[test]
    fn test_inbound_initialize_response_detection() {
        let ok: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}"#,
        )
        .unwrap();
        assert!(ok.is_initialize_response());

        // The request echoed back by a dumb pipe is not a response.
        let echoed: InboundMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"x"}}"#,
        )
        .unwrap();
        assert!(!echoed.is_initialize_response());
        assert!(!echoed.is_response());

        let no_version: InboundMessage =
            serde_json::from_str(r#"{"id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(!no_version.is_initialize_response());

        let string_id: InboundMessage =
            serde_json::from_str(r#"{"id":"1","result":{"protocolVersion":"x"}}"#).unwrap();
        assert!(!string_id.is_initialize_response());
    }

    #[test]
    fn test_error_object_defaults() {
        let msg: InboundMessage = serde_json::from_str(r#"{"id":"a","error":{}}"#).unwrap();
        let err = msg.remote_error().unwrap();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "Unknown error");
    }

    #[test]
    fn test_malformed_error_payloads_still_decode() {
        let text: InboundMessage = serde_json::from_str(r#"{"id":"a","error":"boom"}"#).unwrap();
        assert!(text.is_response());
        assert_eq!(text.remote_error().unwrap().message, "boom");

        let odd: InboundMessage =
            serde_json::from_str(r#"{"id":"a","error":{"code":"E1","message":42}}"#).unwrap();
        let err = odd.remote_error().unwrap();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "42");

        let number: InboundMessage = serde_json::from_str(r#"{"id":"a","error":-5}"#).unwrap();
        assert_eq!(number.remote_error().unwrap().message, "-5");

        let null: InboundMessage =
            serde_json::from_str(r#"{"id":"a","error":null,"result":{}}"#).unwrap();
        assert!(null.remote_error().is_none());
    }

    fn sandbox_env() -> ExecutionEnvironment {
        ExecutionEnvironment {
            risk_level: RiskTier::High,
            risk_description: RiskTier::High.description().to_string(),
            sandboxed: true,
            image: "mcp/fs:1".into(),
        }
    }

    #[test]
    fn test_call_result_is_raw_without_annotation() {
        let call = CallResult {
            result: serde_json::json!({"tools": []}),
            execution_environment: None,
        };
        assert_eq!(serde_json::to_value(&call).unwrap(), serde_json::json!({"tools": []}));

        let outcome = InvokeOutcome::Completed(call.clone());
        assert_eq!(serde_json::to_value(&outcome).unwrap(), serde_json::json!({"tools": []}));
        let confirmed = ConfirmOutcome::Completed(call);
        assert_eq!(serde_json::to_value(&confirmed).unwrap(), serde_json::json!({"tools": []}));
    }

    #[test]
    fn test_call_result_merges_annotation_into_object() {
        let call = CallResult {
            result: serde_json::json!({"tools": [], "execution_environment": "spoofed"}),
            execution_environment: Some(sandbox_env()),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["tools"], serde_json::json!([]));
        assert_eq!(json["execution_environment"]["risk_level"], 3);
        assert_eq!(json["execution_environment"]["sandboxed"], true);
        assert_eq!(json["execution_environment"]["image"], "mcp/fs:1");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_call_result_wraps_non_object_with_annotation() {
        let call = CallResult {
            result: serde_json::json!("plain text"),
            execution_environment: Some(sandbox_env()),
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["result"], "plain text");
        assert_eq!(json["execution_environment"]["image"], "mcp/fs:1");
    }

    #[test]
    fn test_risk_tier_parsing() {
        assert_eq!(RiskTier::from_value(&serde_json::json!(1)), Some(RiskTier::Low));
        assert_eq!(RiskTier::from_value(&serde_json::json!(3)), Some(RiskTier::High));
        assert_eq!(
            RiskTier::from_value(&serde_json::json!("Medium")),
            Some(RiskTier::Medium)
        );
        assert_eq!(RiskTier::from_value(&serde_json::json!(7)), None);
        assert_eq!(RiskTier::from_value(&serde_json::json!("extreme")), None);
        assert_eq!(RiskTier::from_value(&serde_json::json!(true)), None);
        assert_eq!(serde_json::to_value(RiskTier::Medium).unwrap(), 2);
    }

    #[test]
    fn test_summary_omits_unset_risk_fields() {
        let summary = ServerSummary {
            id: "fs".into(),
            connected: true,
            pid: Some(42),
            initialization_state: Some(InitState::Initialized),
            risk_level: None,
            risk_description: None,
            running_in_sandbox: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["initialization_state"], "initialized");
        assert!(json.get("risk_level").is_none());
        assert!(json.get("running_in_sandbox").is_none());
    }

    #[test]
    fn test_confirm_outcome_rejected_shape() {
        let outcome = ConfirmOutcome::Rejected {
            message: "Request was rejected".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["message"], "Request was rejected");
    }
}
