//! Upsert Objects and Turn Events
//!
//! The public output of the core: batched, client-facing replacement
//! snapshots of each item's current rendered state, plus turn lifecycle
//! events. Delivered per session through the `on_upsert` / `on_turn`
//! subscription points.
//!
//! # Design Philosophy
//!
//! An upsert is a full snapshot, not a diff: every emission carries the item's
//! complete accumulated content so far, so a renderer can replace rather than
//! patch. Statuses form `create -> update* -> (complete | error)`, terminal at
//! most once; cancelled items simply never appear.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{SessionId, TurnId, TurnStatus, Usage};

/// Lifecycle status of an upsert
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    /// First snapshot for this item
    Create,
    /// Replacement snapshot with more content
    Update,
    /// Final authoritative snapshot
    Complete,
    /// The item failed mid-stream (crash/eviction)
    Error,
}

/// Item-kind-specific payload of an upsert
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpsertPayload {
    /// Message text
    Message {
        /// Accumulated (or final) message content
        content: String,
        /// Who produced it (provider marker)
        origin: String,
    },
    /// Reasoning / thinking text
    Thinking {
        /// Accumulated (or final) reasoning content
        content: String,
        /// Provider-side id for the reasoning block (empty if none)
        provider_id: String,
    },
    /// Tool invocation and, once known, its output
    ///
    /// While the call is still streaming, `arguments` carries the raw
    /// fragment buffer as a JSON string; only the `complete` upsert carries
    /// the structured value parsed from the finalized payload.
    ToolCall {
        /// Tool name
        name: String,
        /// Provider-native invocation id
        call_id: String,
        /// Arguments (raw text until complete, then structured)
        arguments: serde_json::Value,
        /// Tool output, present once the result arrived
        output: Option<String>,
        /// Whether the tool reported failure
        output_is_error: bool,
    },
    /// A failure snapshot for an item that crashed mid-stream
    Failed {
        /// Stable error code
        code: String,
        /// Failure description
        message: String,
        /// Content accumulated before the failure
        partial_content: String,
    },
}

/// One client-facing replacement snapshot of an item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpsertObject {
    /// Turn the item belongs to
    pub turn_id: TurnId,
    /// Session the turn belongs to
    pub session_id: SessionId,
    /// Deterministic item id
    pub item_id: String,
    /// When the underlying native event arrived
    pub source_timestamp: DateTime<Utc>,
    /// When this upsert was emitted
    pub emitted_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: UpsertStatus,
    /// Item content snapshot
    pub payload: UpsertPayload,
}

/// Kind of turn event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEventKind {
    /// The provider acknowledged the turn and began responding
    Started {
        /// Model the provider reports (empty if unknown)
        model_id: String,
        /// Which provider protocol produced this turn
        provider_id: String,
    },
    /// The turn reached a non-error terminal
    Completed {
        /// Terminal status (completed or cancelled)
        status: TurnStatus,
        /// Provider stop reason, verbatim
        finish_reason: Option<String>,
        /// Token usage if reported
        usage: Option<Usage>,
    },
    /// The turn failed
    Error {
        /// Stable error code
        code: String,
        /// Failure description
        message: String,
    },
}

/// One turn lifecycle fact, delivered through `on_turn`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    /// The turn
    pub turn_id: TurnId,
    /// Session the turn belongs to
    pub session_id: SessionId,
    /// When the underlying native event arrived
    pub source_timestamp: DateTime<Utc>,
    /// When this event was emitted
    pub emitted_at: DateTime<Utc>,
    /// What happened
    pub kind: TurnEventKind,
}

impl TurnEvent {
    /// Whether this is a terminal event (completed or error)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            TurnEventKind::Completed { .. } | TurnEventKind::Error { .. }
        )
    }
}
