//! External collaborators of the core, expressed as traits.
//!
//! Everything behind these traits lives in the agent server. `http` holds
//! the implementation that talks to it; tests use in-memory fakes.

pub mod http;
pub mod sse;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::conversation::Message;
use crate::extension::{ExtensionConfig, ExtensionEntry};
use crate::recipe::Recipe;

/// Category of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    /// Non-2xx response.
    HttpStatus,
    /// Request exceeded its deadline.
    Timeout,
    /// Could not reach the server.
    Connection,
    /// Response body or stream could not be decoded.
    Parse,
    /// The server rejected the shared secret.
    Unauthorized,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayErrorKind::HttpStatus => write!(f, "http_status"),
            GatewayErrorKind::Timeout => write!(f, "timeout"),
            GatewayErrorKind::Connection => write!(f, "connection"),
            GatewayErrorKind::Parse => write!(f, "parse"),
            GatewayErrorKind::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

/// Structured error from a collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    /// One-line summary suitable for display.
    pub message: String,
    /// Raw response body or other detail, when available.
    pub details: Option<String>,
}

impl GatewayError {
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Builds an error from a non-2xx response, preferring a message found in
    /// a JSON `{"error": ...}` or `{"message": ...}` body.
    pub fn http_status(status: u16, body: &str) -> Self {
        let kind = if status == 401 || status == 403 {
            GatewayErrorKind::Unauthorized
        } else {
            GatewayErrorKind::HttpStatus
        };
        let details = (!body.is_empty()).then(|| body.to_string());

        let extracted = serde_json::from_str::<Value>(body).ok().and_then(|json| {
            let error = json.get("error");
            error
                .and_then(|e| e.get("message"))
                .or(error)
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let message = match extracted {
            Some(msg) => format!("HTTP {status}: {msg}"),
            None => format!("HTTP {status}"),
        };
        Self {
            kind,
            message,
            details,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::Parse, message)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Whether a full config read fails on the first malformed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Strict,
    Lenient,
}

/// The server's full configuration map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Persisted configuration store of the agent server.
#[async_trait]
pub trait ConfigGateway: Send + Sync {
    async fn init(&self) -> GatewayResult<()>;

    /// Replaces the stored configuration with a fresh default one.
    async fn reset(&self) -> GatewayResult<()>;

    /// Reads one key; `None` when absent.
    async fn read(&self, key: &str) -> GatewayResult<Option<Value>>;

    async fn read_all(&self, mode: ReadMode) -> GatewayResult<ConfigSnapshot>;

    async fn validate(&self) -> GatewayResult<()>;

    async fn backup(&self) -> GatewayResult<()>;

    /// Attempts a structural repair of the stored configuration.
    async fn recover(&self) -> GatewayResult<()>;
}

/// Registry of configured extensions.
#[async_trait]
pub trait ExtensionGateway: Send + Sync {
    async fn list(&self) -> GatewayResult<Vec<ExtensionEntry>>;

    async fn add_to_session(&self, session_id: &str, config: &ExtensionConfig)
    -> GatewayResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityWarning {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Outcome of a recipe risk scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub has_security_warnings: bool,
    #[serde(default)]
    pub warnings: Vec<SecurityWarning>,
}

#[async_trait]
pub trait RecipeSecurityScanner: Send + Sync {
    async fn scan(&self, recipe: &Recipe) -> GatewayResult<ScanReport>;
}

/// Non-critical cost accounting subsystem.
#[async_trait]
pub trait CostTracker: Send + Sync {
    async fn initialize(&self) -> GatewayResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartRequest {
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe: Option<Recipe>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeRequest {
    pub session_id: String,
    /// `false` re-attaches to an already configured agent.
    pub load_model_and_extensions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyRequest {
    pub messages: Vec<Message>,
    pub session_id: String,
    pub working_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_version: Option<String>,
}

/// Session record fields echoed by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recipe: Option<Recipe>,
    #[serde(default)]
    pub user_recipe_values: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
}

/// Server response to start, resume and session lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One decoded server-sent event of a reply stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ReplyEvent {
    Message {
        message: Message,
    },
    Notification {
        request_id: String,
        message: Value,
    },
    Error {
        error: String,
    },
    Finish {
        #[serde(default)]
        reason: String,
    },
    ModelChange {
        model: String,
        #[serde(default)]
        mode: String,
    },
    Ping,
    #[serde(other)]
    Unknown,
}

pub type ReplyStream = BoxStream<'static, GatewayResult<ReplyEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolConfirmationAction {
    AllowOnce,
    AlwaysAllow,
    Deny,
}

/// Request/response and streaming surface of the remote agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn start(&self, request: StartRequest) -> GatewayResult<SessionSnapshot>;

    async fn resume(&self, request: ResumeRequest) -> GatewayResult<SessionSnapshot>;

    /// Fetches the server-side session record.
    async fn session(&self, session_id: &str) -> GatewayResult<SessionSnapshot>;

    /// Opens a reply stream. Cancelling `cancel` ends the stream cooperatively.
    async fn reply(
        &self,
        request: ReplyRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<ReplyStream>;

    async fn confirm_tool(
        &self,
        session_id: &str,
        request_id: &str,
        action: ToolConfirmationAction,
    ) -> GatewayResult<()>;
}
