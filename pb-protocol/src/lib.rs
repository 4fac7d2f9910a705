//! IPC protocol between pibridged and its clients
//!
//! Newline-delimited JSON: one `RequestEnvelope` per line in, one
//! `ResponseEnvelope` per line out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum state path length
const MAX_STATE_PATH_LENGTH: usize = 128;

/// Every state the adapter owns lives below this namespace.
pub const STATE_NAMESPACE: &str = "gpio";

// ============================================================================
// State values
// ============================================================================

/// A value held by a state: boolean levels, sensor numbers, or whatever text
/// an external writer sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl StateValue {
    /// Tolerant boolean reading of a written value.
    ///
    /// `"true"`/`"false"`/`"0"` are understood literally, any other text is
    /// true when non-empty, numbers are true when non-zero.
    pub fn as_bool(&self) -> bool {
        match self {
            StateValue::Bool(b) => *b,
            StateValue::Number(n) => *n != 0.0 && !n.is_nan(),
            StateValue::Text(s) => match s.as_str() {
                "true" => true,
                "false" | "0" => false,
                other => !other.is_empty(),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            StateValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Number(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Text(v.to_string())
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Bool(b) => write!(f, "{}", b),
            StateValue::Number(n) => write!(f, "{}", n),
            StateValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Snapshot of a state as reported over IPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub path: String,
    pub val: Option<StateValue>,
    pub ack: bool,
    /// Milliseconds since the Unix epoch of the last value change
    pub ts: u64,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GetState { path: String },
    /// External (unacknowledged) write, routed to the GPIO lifecycle
    SetState { path: String, value: StateValue },
    ListStates {
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl Request {
    /// Validate request parameters before they reach the store
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping | Request::Version => Ok(()),
            Request::GetState { path } => validate_state_path(path),
            Request::SetState { path, value } => {
                validate_state_path(path)?;
                validate_state_value(value)
            }
            Request::ListStates { prefix: None } => Ok(()),
            Request::ListStates { prefix: Some(prefix) } => validate_state_path(prefix),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetState { .. } => "GetState",
            Request::SetState { .. } => "SetState",
            Request::ListStates { .. } => "ListStates",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<StateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn state(s: StateSnapshot) -> Self { Self { state: Some(s), ..Self::default() } }
    pub fn paths(p: Vec<String>) -> Self { Self { paths: Some(p), ..Self::default() } }
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s.into()))
    }

    pub fn ok_state(s: StateSnapshot) -> Self {
        Response::Ok(ResponseData::state(s))
    }

    pub fn ok_paths(p: Vec<String>) -> Self {
        Response::Ok(ResponseData::paths(p))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate a dotted state path inside the adapter namespace.
///
/// Accepts the namespace itself (`gpio`), channels (`gpio.17`) and states
/// (`gpio.17.state`).
pub fn validate_state_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path cannot be empty".into());
    }

    if path.len() > MAX_STATE_PATH_LENGTH {
        return Err(format!(
            "Path too long: {} > {} chars",
            path.len(),
            MAX_STATE_PATH_LENGTH
        ));
    }

    let mut segments = path.split('.');
    if segments.next() != Some(STATE_NAMESPACE) {
        return Err(format!("Path must start with '{}'", STATE_NAMESPACE));
    }

    for segment in segments {
        if segment.is_empty() {
            return Err("Path contains an empty segment".into());
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
        {
            return Err(format!("Path contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

fn validate_state_value(value: &StateValue) -> Result<(), String> {
    match value {
        StateValue::Number(n) if !n.is_finite() => Err("Number must be finite".into()),
        StateValue::Text(s) if s.len() > 256 => Err("Text value too long (max 256)".into()),
        _ => Ok(()),
    }
}
