//! Bus message envelope types.
//!
//! The castd bus speaks JSON-RPC 2.0 extended with routing fields: a request
//! may carry a `destination` naming the peer the broker should route it to,
//! and notifications carry the `sender` they originated from plus the object
//! `path` and `interface` they are scoped to. Peers without a `destination`
//! address the broker itself (e.g. `add_match`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// The named destination is not connected to the bus.
pub const NO_PEER: i32 = -32000;

/// Object path every encoder worker exposes.
pub const ENCODER_PATH: &str = "/castd/encoder";
/// Interface every encoder worker exposes at [`ENCODER_PATH`].
pub const ENCODER_INTERFACE: &str = "castd.Encoder";
/// Sender name the broker uses for events it emits itself.
pub const BUS_SENDER: &str = "castd.bus";

pub const METHOD_CONFIGURE: &str = "Configure";
pub const METHOD_START: &str = "Start";
pub const METHOD_PAUSE: &str = "Pause";
pub const METHOD_STOP: &str = "Stop";
/// Broker method installing a notification match rule for this connection.
pub const METHOD_ADD_MATCH: &str = "add_match";

/// Property-change notification emitted by workers.
pub const MEMBER_PROPERTIES_CHANGED: &str = "PropertiesChanged";
/// Presence notification emitted by the broker when a peer name appears or
/// vanishes.
pub const MEMBER_PRESENCE_CHANGED: &str = "PresenceChanged";

/// Changed-property name carrying the worker's state code.
pub const PROP_STATE: &str = "State";

/// Request ID, either numeric or string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// Method call, optionally routed to a named peer.
///
/// `deny_unknown_fields` keeps the untagged [`Message`] decode unambiguous:
/// a notification (which carries `sender`) can never parse as a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Request {
    /// Build a call addressed to the broker itself.
    #[must_use]
    pub fn to_bus(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            destination: None,
            path: None,
            interface: None,
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Build a call routed to `destination` at the encoder object.
    #[must_use]
    pub fn to_encoder(
        destination: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
        id: RequestId,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            destination: Some(destination.into()),
            path: Some(ENCODER_PATH.to_string()),
            interface: Some(ENCODER_INTERFACE.to_string()),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

/// Reply to a [`Request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: RequestId,
}

impl Response {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    #[must_use]
    pub fn error(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// One-way event from a peer or the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Notification {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(
        sender: impl Into<String>,
        interface: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            sender: Some(sender.into()),
            path: None,
            interface: Some(interface.into()),
            method: method.into(),
            params,
        }
    }
}

/// Error object carried in a [`Response`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request")
    }

    #[must_use]
    pub fn method_not_found() -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found")
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    #[must_use]
    pub fn no_peer(name: impl Into<String>) -> Self {
        Self::new(NO_PEER, format!("No such peer: {}", name.into()))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Incoming message that could be a request, response, or notification.
///
/// Variant order matters for the untagged decode: `Request` and
/// `Notification` both reject unknown fields, so the presence of `sender`
/// (notifications) or `result`/`error` (responses) selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Parse a JSON string into a `Message`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or doesn't match any
    /// message type.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize this message to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(r) if r.id.is_some())
    }

    #[must_use]
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Request(r) if r.id.is_none())
            || matches!(self, Message::Notification(_))
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }
}

/// Payload of a [`MEMBER_PROPERTIES_CHANGED`] notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertiesChanged {
    /// Interface the properties belong to. Consumers that subscribed per
    /// sender typically skip this field.
    pub interface: String,
    pub changed: serde_json::Map<String, Value>,
}

/// Payload of a [`MEMBER_PRESENCE_CHANGED`] notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceChanged {
    pub name: String,
    pub present: bool,
}

/// Match rule installed on the broker via [`METHOD_ADD_MATCH`].
///
/// `None` fields are wildcards. `arg0` matches the `name` argument of
/// presence events, mirroring how a name-scoped bus match rule works.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg0: Option<String>,
}

impl MatchRule {
    /// Rule matching state-change notifications from one worker.
    #[must_use]
    pub fn properties_changed(sender: impl Into<String>) -> Self {
        Self {
            sender: Some(sender.into()),
            interface: Some(ENCODER_INTERFACE.to_string()),
            member: Some(MEMBER_PROPERTIES_CHANGED.to_string()),
            arg0: None,
        }
    }

    /// Rule matching presence events for one peer name.
    #[must_use]
    pub fn presence_of(name: impl Into<String>) -> Self {
        Self {
            sender: Some(BUS_SENDER.to_string()),
            interface: None,
            member: Some(MEMBER_PRESENCE_CHANGED.to_string()),
            arg0: Some(name.into()),
        }
    }

    #[must_use]
    pub fn matches(&self, n: &Notification) -> bool {
        if let Some(member) = &self.member {
            if *member != n.method {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            if n.sender.as_deref() != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if n.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(arg0) = &self.arg0 {
            let name = n
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str);
            if name != Some(arg0.as_str()) {
                return false;
            }
        }
        true
    }
}
