//! Canonical Event Model
//!
//! Pure data contracts for the item/turn lifecycle. Translators convert each
//! provider's native stream into these events; the batching processor and the
//! turn correlator consume them. Nothing here depends on any other component.
//!
//! # Design Philosophy
//!
//! Canonical events are immutable, append-only facts. Each carries the source
//! timestamp of the native event it was translated from, so downstream
//! consumers can distinguish "when the agent said it" from "when we emitted
//! it". Item ids are deterministic (`{turnId}:{messageOrdinal}:{blockIndex}`)
//! and stable across repeated translation of the same native indices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Turn identifier
///
/// Assigned by the caller-injected id generator at submission time, never by a
/// provider-native session id, so ids are stable across protocols.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    ///
    /// Atomic counter combined with a timestamp, so ids stay unique even when
    /// several sessions are created in the same millisecond.
    #[must_use]
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{SystemTime, UNIX_EPOCH};

        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let count = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(format!("session_{timestamp}_{count}"))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic item id: `{turnId}:{messageOrdinal}:{nativeBlockIndex}`
///
/// Message ordinals start at 1. Block indices are the provider's native
/// content-block indices (or synthesized appearance order for providers
/// without native indices).
#[must_use]
pub fn item_id(turn_id: &TurnId, message_ordinal: u32, block_index: usize) -> String {
    format!("{}:{}:{}", turn_id.0, message_ordinal, block_index)
}

/// What kind of content unit an item is
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Assistant-visible message text
    Message,
    /// Reasoning / thinking content
    Reasoning,
    /// A tool invocation the agent is making
    FunctionCall,
    /// The result of a tool invocation
    FunctionCallOutput,
}

/// Token usage reported by the provider for a turn
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt-side tokens
    pub input_tokens: u64,
    /// Completion-side tokens
    pub output_tokens: u64,
}

/// The authoritative final form of a completed item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinalItem {
    /// A finished message
    Message {
        /// Full message text
        content: String,
        /// Who produced it (provider marker)
        origin: String,
    },
    /// Finished reasoning content
    Reasoning {
        /// Full reasoning text
        content: String,
        /// Provider-side id for the reasoning block (empty if none)
        provider_id: String,
    },
    /// A finished tool invocation
    FunctionCall {
        /// Tool name
        name: String,
        /// Provider-native invocation id
        call_id: String,
        /// Arguments parsed once from the finalized payload.
        /// Intentionally unvalidated: the shape is provider-specific.
        arguments: serde_json::Value,
    },
    /// A finished tool result
    FunctionCallOutput {
        /// Invocation id this output answers
        call_id: String,
        /// Raw output text
        output: String,
        /// Whether the tool reported failure
        is_error: bool,
    },
}

/// Item lifecycle events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemEvent {
    /// A new item opened
    Start {
        /// Deterministic item id
        item_id: String,
        /// What kind of item this is
        kind: ItemKind,
        /// Tool name (function calls only)
        name: Option<String>,
        /// Provider-native invocation id (function calls only)
        call_id: Option<String>,
    },
    /// Incremental content for an open item
    Delta {
        /// Item receiving content
        item_id: String,
        /// The content fragment (raw argument text for function calls)
        delta: String,
    },
    /// The item finished; `item` is the authoritative final form
    Done {
        /// Item that finished
        item_id: String,
        /// Authoritative final content
        item: FinalItem,
    },
    /// The item failed
    Error {
        /// Item that failed
        item_id: String,
        /// Failure description
        error: String,
    },
    /// The item was cancelled before finishing.
    /// Cancelled items are invisible downstream: no upsert is ever emitted.
    Cancelled {
        /// Item that was cancelled
        item_id: String,
        /// Optional cancellation reason
        reason: Option<String>,
    },
}

impl ItemEvent {
    /// The id of the item this event refers to
    #[must_use]
    pub fn item_id(&self) -> &str {
        match self {
            Self::Start { item_id, .. }
            | Self::Delta { item_id, .. }
            | Self::Done { item_id, .. }
            | Self::Error { item_id, .. }
            | Self::Cancelled { item_id, .. } => item_id,
        }
    }
}

/// Lifecycle outcome of a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The turn ran to completion
    Completed,
    /// The turn was cancelled (interrupt or non-terminal stop reason)
    Cancelled,
    /// The turn failed
    Error,
}

/// Turn-scoped lifecycle events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnSignal {
    /// The provider acknowledged the turn and began responding
    Started {
        /// Model the provider reports it is using (empty if unknown)
        model_id: String,
        /// Which provider protocol produced this turn
        provider_id: String,
    },
    /// The turn reached a non-error terminal
    Done {
        /// Terminal status (completed or cancelled)
        status: TurnStatus,
        /// Provider stop reason, verbatim
        finish_reason: Option<String>,
        /// Token usage if the provider reported it
        usage: Option<Usage>,
    },
    /// The turn failed
    Error {
        /// Stable error code (e.g. `PROCESS_CRASH`)
        code: String,
        /// Failure description
        message: String,
    },
}

/// What kind of canonical event this is
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "event", rename_all = "snake_case")]
pub enum CanonicalKind {
    /// An item lifecycle event
    Item(ItemEvent),
    /// A turn lifecycle event
    Turn(TurnSignal),
}

/// One canonical event, bound to a turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// The turn this event belongs to
    pub turn_id: TurnId,
    /// When the native event this was translated from arrived
    pub source_timestamp: DateTime<Utc>,
    /// The event itself
    pub kind: CanonicalKind,
}

impl CanonicalEvent {
    /// Wrap an item event, stamped now
    #[must_use]
    pub fn item(turn_id: TurnId, event: ItemEvent) -> Self {
        Self {
            turn_id,
            source_timestamp: Utc::now(),
            kind: CanonicalKind::Item(event),
        }
    }

    /// Wrap a turn signal, stamped now
    #[must_use]
    pub fn turn(turn_id: TurnId, signal: TurnSignal) -> Self {
        Self {
            turn_id,
            source_timestamp: Utc::now(),
            kind: CanonicalKind::Turn(signal),
        }
    }

    /// Whether this event is a turn terminal (done or error)
    #[must_use]
    pub fn is_turn_terminal(&self) -> bool {
        matches!(
            self.kind,
            CanonicalKind::Turn(TurnSignal::Done { .. } | TurnSignal::Error { .. })
        )
    }
}
