//! Agent Client Boundary
//!
//! The host does not spawn or speak to agent processes itself. Each provider
//! supplies an [`AgentClientFactory`] that opens connections and an
//! [`AgentClient`] handle for the operations the pool needs: prompt,
//! interrupt, close, liveness. Native events arrive on a plain mpsc channel,
//! one per connection, consumed by exactly one reader task.
//!
//! # Design Philosophy
//!
//! This mirrors the backend abstraction the rest of the codebase uses for
//! LLM providers: an async trait for the control surface, a channel for the
//! stream. Everything protocol-specific lives in the two native event enums;
//! the translators own their interpretation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::HostError;
use crate::events::{SessionId, Usage};

/// Which provider protocol a connection speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliType {
    /// Line-framed message/content-block protocol (explicit start and stop
    /// markers, per-index blocks, out-of-band tool results)
    Pipe,
    /// Notification-style protocol (session-update notifications with no
    /// explicit start marker, separate completion result)
    Acp,
}

impl CliType {
    /// Stable provider marker string, used as `provider_id`/`origin`
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pipe => "pipe",
            Self::Acp => "acp",
        }
    }
}

impl std::fmt::Display for CliType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content block opening inside a pipe-protocol message
#[derive(Clone, Debug, PartialEq)]
pub enum PipeBlock {
    /// Plain message text
    Text,
    /// Reasoning content, with an optional provider-side id
    Thinking {
        /// Provider id for the reasoning block
        provider_id: Option<String>,
    },
    /// A tool invocation whose argument text streams as raw fragments
    ToolUse {
        /// Provider-native invocation id
        id: String,
        /// Tool name
        name: String,
    },
}

/// Native events of the message/content-block protocol (protocol A)
///
/// Native order per message: `MessageStart`, then per-index
/// `BlockStart`/`BlockDelta`/`BlockStop` repeated for each content block, then
/// a `MessageDelta` carrying the stop reason and usage, then `MessageStop`.
/// `ToolResult` arrives out of band.
#[derive(Clone, Debug, PartialEq)]
pub enum PipeEvent {
    /// A new native message begins
    MessageStart {
        /// Model the provider reports
        model_id: String,
    },
    /// Content block opened at a native index
    BlockStart {
        /// Native block index within the message
        index: usize,
        /// What kind of block
        block: PipeBlock,
    },
    /// Content fragment for the block at `index`
    BlockDelta {
        /// Native block index
        index: usize,
        /// Text fragment (raw argument text for tool-use blocks)
        text: String,
    },
    /// The block at `index` is finished
    BlockStop {
        /// Native block index
        index: usize,
    },
    /// Stop reason and usage for the message
    MessageDelta {
        /// Provider stop reason (e.g. `end_turn`, `tool_use`, `error`)
        stop_reason: Option<String>,
        /// Token usage so far
        usage: Option<Usage>,
    },
    /// The native message ended
    MessageStop,
    /// Out-of-band tool result, correlated by invocation id
    ToolResult {
        /// Invocation id of the tool call this answers (if known)
        call_id: Option<String>,
        /// Raw output text
        output: String,
        /// Whether the tool reported failure
        is_error: bool,
    },
}

/// Stop reasons of the notification protocol's completion result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcpStopReason {
    /// Natural completion
    EndTurn,
    /// Token budget exhausted
    MaxTokens,
    /// Turn-request budget exhausted
    MaxTurnRequests,
    /// The agent refused the prompt
    Refusal,
    /// The prompt was cancelled
    Cancelled,
}

impl AcpStopReason {
    /// Verbatim reason string as the provider spells it
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::MaxTokens => "max_tokens",
            Self::MaxTurnRequests => "max_turn_requests",
            Self::Refusal => "refusal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One session-update notification of the notification protocol
#[derive(Clone, Debug, PartialEq)]
pub enum AcpUpdate {
    /// Message text fragment
    MessageChunk {
        /// Text fragment
        text: String,
    },
    /// Reasoning text fragment
    ThoughtChunk {
        /// Text fragment
        text: String,
    },
    /// A tool invocation, arguments already structured
    ToolCall {
        /// Invocation id
        call_id: String,
        /// Tool name
        name: String,
        /// Structured arguments (provider-specific shape)
        arguments: serde_json::Value,
    },
    /// Progress or result for a previously announced tool call
    ToolCallUpdate {
        /// Invocation id
        call_id: String,
        /// Output text, if the update carries any
        output: Option<String>,
        /// Whether the tool reported failure
        is_error: bool,
        /// Whether this update finishes the call
        done: bool,
    },
}

/// Native events of the notification protocol (protocol B)
#[derive(Clone, Debug, PartialEq)]
pub enum AcpEvent {
    /// A session-update notification; the first one after a prompt
    /// implicitly marks turn start
    Update(AcpUpdate),
    /// The completion result for the outstanding prompt
    PromptDone {
        /// Why the prompt stopped
        stop_reason: AcpStopReason,
        /// Token usage if reported
        usage: Option<Usage>,
    },
    /// Transport-level failure; terminates every outstanding turn
    TransportError {
        /// Failure description
        message: String,
    },
}

/// A native event from either protocol
#[derive(Clone, Debug, PartialEq)]
pub enum NativeEvent {
    /// Message/content-block protocol event
    Pipe(PipeEvent),
    /// Notification protocol event
    Acp(AcpEvent),
}

/// Parameters for opening (or reopening) an agent connection
#[derive(Clone, Debug, Default)]
pub struct OpenRequest {
    /// Project directory the agent works in
    pub project_dir: PathBuf,
    /// Resume an existing provider conversation instead of starting fresh
    pub resume: Option<SessionId>,
    /// File the session's view is anchored to, if any
    pub view_file_path: Option<PathBuf>,
    /// Provider-specific options, intentionally unvalidated
    pub provider_options: Option<serde_json::Value>,
}

impl OpenRequest {
    /// Open a fresh connection for a project directory
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            ..Self::default()
        }
    }

    /// Resume a previous provider conversation
    #[must_use]
    pub fn with_resume(mut self, session_id: SessionId) -> Self {
        self.resume = Some(session_id);
        self
    }
}

/// Control surface of one live agent connection
///
/// The event stream is handed out separately at open time (one pull-based
/// channel per connection); this handle only carries the operations the pool
/// and host invoke. For the notification protocol, `prompt` maps to the
/// session-prompt request and `interrupt` to session-cancel; for the pipe
/// protocol they map to writing the line-framed request and signalling the
/// process.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Which protocol this connection speaks
    fn cli_type(&self) -> CliType;

    /// Bind this warm connection to a new or resumed provider conversation.
    ///
    /// For the notification protocol this maps to the explicit
    /// session-create/session-load requests; for the pipe protocol it resets
    /// the process's conversation state. Called once per session rebind, so a
    /// pooled connection can serve a fresh session without reopening.
    async fn start_session(&self, request: &OpenRequest) -> Result<(), HostError>;

    /// Submit user content to the agent
    async fn prompt(&self, content: &str) -> Result<(), HostError>;

    /// Best-effort interrupt of the in-flight turn.
    /// Does not itself complete the turn; the native stream must still
    /// produce a terminal.
    async fn interrupt(&self) -> Result<(), HostError>;

    /// Close the connection (terminates the agent process)
    async fn close(&self);

    /// Whether the underlying process/transport is still alive
    fn is_alive(&self) -> bool;
}

/// A freshly opened connection: the control handle plus its event stream
pub struct Connection {
    /// Control surface
    pub client: std::sync::Arc<dyn AgentClient>,
    /// The connection's native event stream, consumed by one reader task
    pub events: mpsc::Receiver<NativeEvent>,
}

/// Opens agent connections for one provider
#[async_trait]
pub trait AgentClientFactory: Send + Sync {
    /// Which protocol connections from this factory speak
    fn cli_type(&self) -> CliType;

    /// Open a new connection.
    ///
    /// Must only return once the connection is confirmed open; a failure here
    /// surfaces as `SESSION_CREATE_FAILED` with no session left bound.
    async fn open(&self, request: &OpenRequest) -> Result<Connection, HostError>;
}

/// Convenience: does this path look like a usable project directory
///
/// Purely advisory; providers are free to reject directories the host
/// considered fine.
#[must_use]
pub fn looks_like_project_dir(path: &Path) -> bool {
    path.is_dir()
}
