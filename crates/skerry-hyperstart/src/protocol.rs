//! JSON-RPC 2.0 framing for the guest agent channel.
//!
//! Frames are newline-delimited JSON objects. The host sends requests and
//! the guest answers each one with a response carrying the same `id`. The
//! guest also pushes `stream` notifications (no `id`) with process output.

use crate::api::StreamKind;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes reported by the guest agent.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Unknown container or process.
    pub const NOT_FOUND: i32 = -32001;
    /// Container or process id already in use.
    pub const ALREADY_EXISTS: i32 = -32002;
    /// Request not valid in the current sandbox state.
    pub const INVALID_STATE: i32 = -32003;
}

/// Method names.
pub mod methods {
    pub const HELLO: &str = "hello";
    pub const VERSION: &str = "version";
    pub const PAUSE: &str = "pause";
    pub const UNPAUSE: &str = "unpause";
    pub const START_SANDBOX: &str = "start_sandbox";
    pub const DESTROY_SANDBOX: &str = "destroy_sandbox";
    pub const NEW_CONTAINER: &str = "new_container";
    pub const RESTORE_CONTAINER: &str = "restore_container";
    pub const ADD_PROCESS: &str = "add_process";
    pub const SIGNAL_PROCESS: &str = "signal_process";
    pub const WAIT_PROCESS: &str = "wait_process";
    pub const WRITE_STDIN: &str = "write_stdin";
    pub const CLOSE_STDIN: &str = "close_stdin";
    pub const TTY_WIN_RESIZE: &str = "tty_win_resize";
    pub const WRITE_FILE: &str = "write_file";
    pub const READ_FILE: &str = "read_file";
    pub const ADD_ROUTE: &str = "add_route";
    pub const UPDATE_INTERFACE: &str = "update_interface";
    pub const ONLINE_CPU_MEM: &str = "online_cpu_mem";
    /// Guest-to-host notification carrying process output.
    pub const STREAM: &str = "stream";
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Serialize)]
pub struct Request<'a, P> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: P,
}

impl<'a, P: Serialize> Request<'a, P> {
    pub fn new(id: u64, method: &'a str, params: P) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// A frame received from the guest.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Deserialize)]
pub struct Response {
    /// Request identifier (matches request).
    pub id: u64,
    /// Result on success.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default)]
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Guest-initiated message without an id.
#[derive(Debug, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Parameters of a `stream` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub container: String,
    pub process: String,
    pub stream: StreamKind,
    /// Connection-wide sequence number, strictly increasing.
    pub seq: u64,
    /// Base64-encoded bytes.
    #[serde(default)]
    pub data: String,
    /// No more frames follow for this stream.
    #[serde(default)]
    pub eof: bool,
}

impl StreamFrame {
    /// Decode the payload.
    pub fn payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.data)
    }
}

/// Encode bytes for a JSON frame.
pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode bytes from a JSON frame.
pub fn decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

// Result payloads

#[derive(Debug, Deserialize)]
pub struct VersionResult {
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct WaitResult {
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
pub struct WriteResult {
    pub written: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileResult {
    pub data: String,
}
