//! Upsert batching.
//!
//! Canonical events are too granular to persist one-by-one; the batch
//! processor coalesces per-item deltas into snapshot upserts, paced by a
//! token gradient. Each open item carries a position in the gradient:
//! an emission happens only when the tokens accumulated since the last
//! emission strictly exceed the current threshold, and each emission
//! advances past every threshold it cleared. Once the gradient is
//! exhausted its last value repeats, so long items settle into a steady
//! cadence. A quiet item is flushed after an idle interval regardless.
//!
//! The processor is a synchronous state machine driven by the session
//! reader task; it takes explicit `Instant`s so the pacing logic is
//! testable without a runtime clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::codes;
use crate::events::{
    CanonicalEvent, CanonicalKind, FinalItem, ItemEvent, ItemKind, SessionId, TurnId, TurnSignal,
    TurnStatus,
};
use crate::upsert::{TurnEvent, TurnEventKind, UpsertObject, UpsertPayload, UpsertStatus};

// ============================================================================
// Configuration
// ============================================================================

/// Default emission gradient, in whitespace-delimited tokens.
pub const DEFAULT_GRADIENT: [usize; 5] = [10, 20, 40, 80, 120];

/// Default idle interval after which a quiet dirty item is flushed.
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(1000);

/// Pacing configuration for the batch processor.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Emission thresholds; the last value repeats once exhausted.
    pub gradient: Vec<usize>,
    /// How long a dirty item may sit quiet before being flushed.
    pub idle_flush: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            gradient: DEFAULT_GRADIENT.to_vec(),
            idle_flush: DEFAULT_IDLE_FLUSH,
        }
    }
}

impl BatchConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// - `SWITCHBOARD_BATCH_GRADIENT`: comma-separated token thresholds
    /// - `SWITCHBOARD_IDLE_FLUSH_MS`: idle flush interval in milliseconds
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("SWITCHBOARD_BATCH_GRADIENT") {
            let parsed: Vec<usize> = raw
                .split(',')
                .filter_map(|part| part.trim().parse().ok())
                .collect();
            if parsed.is_empty() {
                warn!(%raw, "ignoring unparsable SWITCHBOARD_BATCH_GRADIENT");
            } else {
                config.gradient = parsed;
            }
        }
        if let Ok(raw) = std::env::var("SWITCHBOARD_IDLE_FLUSH_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.idle_flush = Duration::from_millis(ms),
                Err(_) => warn!(%raw, "ignoring unparsable SWITCHBOARD_IDLE_FLUSH_MS"),
            }
        }
        config
    }
}

// ============================================================================
// Output
// ============================================================================

/// What the processor hands back to be delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOutput {
    /// A persistence upsert for an item.
    Upsert(UpsertObject),
    /// A turn lifecycle event.
    Turn(TurnEvent),
}

// ============================================================================
// Item state
// ============================================================================

struct OpenItem {
    turn_id: TurnId,
    kind: ItemKind,
    name: Option<String>,
    call_id: Option<String>,
    content: String,
    /// Token count at the last emission.
    emitted_tokens: usize,
    /// Position in the gradient.
    gradient_pos: usize,
    create_sent: bool,
    /// Content accumulated since the last emission.
    dirty: bool,
    last_activity: Instant,
    source_timestamp: DateTime<Utc>,
}

impl OpenItem {
    fn token_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Coalesces canonical events for one session into upserts and turn
/// events.
///
/// Terminal handling: once a turn's terminal has been emitted, every
/// further event for that turn is dropped silently. `item_done` yields
/// exactly one `complete` upsert; `item_cancelled` yields nothing at
/// all.
pub struct BatchProcessor {
    session_id: SessionId,
    /// Provider marker stamped on streaming snapshots.
    origin: String,
    config: BatchConfig,
    items: HashMap<String, OpenItem>,
    /// Insertion order, for deterministic flushing.
    item_order: Vec<String>,
    /// Turns whose terminal has already been emitted.
    terminated: std::collections::HashSet<TurnId>,
}

impl BatchProcessor {
    /// New processor for a session.
    #[must_use]
    pub fn new(session_id: SessionId, origin: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            session_id,
            origin: origin.into(),
            config,
            items: HashMap::new(),
            item_order: Vec::new(),
            terminated: std::collections::HashSet::new(),
        }
    }

    /// Fold one canonical event.
    pub fn on_event(&mut self, event: &CanonicalEvent, now: Instant) -> Vec<BatchOutput> {
        if self.terminated.contains(&event.turn_id) {
            debug!(turn_id = %event.turn_id.0, "dropping event after turn terminal");
            return Vec::new();
        }
        match &event.kind {
            CanonicalKind::Turn(signal) => self.on_turn_signal(event, signal),
            CanonicalKind::Item(item) => self.on_item_event(event, item, now),
        }
    }

    /// Flush items whose idle interval has elapsed.
    pub fn flush_idle(&mut self, now: Instant) -> Vec<BatchOutput> {
        let due: Vec<String> = self
            .item_order
            .iter()
            .filter(|id| {
                self.items.get(id.as_str()).is_some_and(|item| {
                    item.dirty && now.duration_since(item.last_activity) >= self.config.idle_flush
                })
            })
            .cloned()
            .collect();
        let mut out = Vec::new();
        for id in due {
            if let Some(upsert) = self.emit_snapshot(&id, now) {
                out.push(BatchOutput::Upsert(upsert));
            }
        }
        out
    }

    /// When the next idle flush is due, if any item is dirty.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.items
            .values()
            .filter(|item| item.dirty)
            .map(|item| item.last_activity + self.config.idle_flush)
            .min()
    }

    /// Fail every still-open item with an error upsert. Used when the
    /// session is destroyed mid-stream (crash or eviction); the turn's
    /// own terminal is emitted separately, after these.
    pub fn fail_open_items(&mut self, code: &str, message: &str) -> Vec<BatchOutput> {
        let ids = std::mem::take(&mut self.item_order);
        let mut out = Vec::new();
        for id in ids {
            if let Some(item) = self.items.remove(&id) {
                out.push(BatchOutput::Upsert(self.build_upsert(
                    &id,
                    &item.turn_id,
                    item.source_timestamp,
                    UpsertStatus::Error,
                    UpsertPayload::Failed {
                        code: code.to_string(),
                        message: message.to_string(),
                        partial_content: item.content,
                    },
                )));
            }
        }
        out
    }

    /// Whether any item of `turn_id` is still open.
    #[must_use]
    pub fn has_open_items(&self, turn_id: &TurnId) -> bool {
        self.items.values().any(|item| &item.turn_id == turn_id)
    }

    // ------------------------------------------------------------------
    // Turn signals
    // ------------------------------------------------------------------

    fn on_turn_signal(&mut self, event: &CanonicalEvent, signal: &TurnSignal) -> Vec<BatchOutput> {
        let kind = match signal {
            TurnSignal::Started { model_id, provider_id } => TurnEventKind::Started {
                model_id: model_id.clone(),
                provider_id: provider_id.clone(),
            },
            TurnSignal::Done { status, finish_reason, usage } => {
                self.terminated.insert(event.turn_id.clone());
                if *status == TurnStatus::Error {
                    // A done marker carrying an error status without an
                    // explicit error signal still surfaces as a failure.
                    TurnEventKind::Error {
                        code: codes::PROCESS_CRASH.to_string(),
                        message: "turn failed".to_string(),
                    }
                } else {
                    TurnEventKind::Completed {
                        status: *status,
                        finish_reason: finish_reason.clone(),
                        usage: *usage,
                    }
                }
            }
            TurnSignal::Error { code, message } => {
                self.terminated.insert(event.turn_id.clone());
                TurnEventKind::Error {
                    code: code.clone(),
                    message: message.clone(),
                }
            }
        };
        vec![BatchOutput::Turn(TurnEvent {
            turn_id: event.turn_id.clone(),
            session_id: self.session_id.clone(),
            source_timestamp: event.source_timestamp,
            emitted_at: Utc::now(),
            kind,
        })]
    }

    // ------------------------------------------------------------------
    // Item events
    // ------------------------------------------------------------------

    fn on_item_event(
        &mut self,
        event: &CanonicalEvent,
        item_event: &ItemEvent,
        now: Instant,
    ) -> Vec<BatchOutput> {
        match item_event {
            ItemEvent::Start { item_id, kind, name, call_id } => {
                self.items.insert(item_id.clone(), OpenItem {
                    turn_id: event.turn_id.clone(),
                    kind: *kind,
                    name: name.clone(),
                    call_id: call_id.clone(),
                    content: String::new(),
                    emitted_tokens: 0,
                    gradient_pos: 0,
                    create_sent: false,
                    dirty: false,
                    last_activity: now,
                    source_timestamp: event.source_timestamp,
                });
                self.item_order.push(item_id.clone());
                Vec::new()
            }
            ItemEvent::Delta { item_id, delta } => {
                let (pos, unemitted) = {
                    let Some(item) = self.items.get_mut(item_id) else {
                        warn!(%item_id, "delta for unknown item, dropping");
                        return Vec::new();
                    };
                    item.content.push_str(delta);
                    item.dirty = true;
                    item.last_activity = now;
                    item.source_timestamp = event.source_timestamp;
                    let unemitted = item.token_count().saturating_sub(item.emitted_tokens);
                    (item.gradient_pos, unemitted)
                };
                let crossed = self.thresholds_cleared(pos, unemitted);
                if crossed == 0 {
                    return Vec::new();
                }
                if let Some(item) = self.items.get_mut(item_id) {
                    item.gradient_pos += crossed;
                }
                self.emit_snapshot(item_id, now)
                    .map(BatchOutput::Upsert)
                    .into_iter()
                    .collect()
            }
            ItemEvent::Done { item_id, item } => {
                // Exactly one complete upsert, with the authoritative
                // final payload, whether or not anything streamed.
                self.remove_item(item_id);
                vec![BatchOutput::Upsert(self.build_upsert(
                    item_id,
                    &event.turn_id,
                    event.source_timestamp,
                    UpsertStatus::Complete,
                    payload_from_final(item),
                ))]
            }
            ItemEvent::Error { item_id, error } => {
                let partial = self
                    .remove_item(item_id)
                    .map(|item| item.content)
                    .unwrap_or_default();
                vec![BatchOutput::Upsert(self.build_upsert(
                    item_id,
                    &event.turn_id,
                    event.source_timestamp,
                    UpsertStatus::Error,
                    UpsertPayload::Failed {
                        code: crate::error::codes::PROCESS_CRASH.to_string(),
                        message: error.clone(),
                        partial_content: partial,
                    },
                ))]
            }
            ItemEvent::Cancelled { item_id, .. } => {
                // Cancelled items leave no trace downstream, even if
                // snapshots were already emitted.
                self.remove_item(item_id);
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    /// Number of consecutive gradient thresholds strictly exceeded by
    /// `unemitted` tokens, starting at `pos`. Beyond the end of the
    /// gradient the last value repeats, so at most one step is counted
    /// there.
    fn thresholds_cleared(&self, pos: usize, unemitted: usize) -> usize {
        let gradient = &self.config.gradient;
        if gradient.is_empty() {
            // No pacing configured: every delta emits.
            return usize::from(unemitted > 0);
        }
        let mut cleared = 0;
        loop {
            let idx = (pos + cleared).min(gradient.len() - 1);
            if unemitted > gradient[idx] {
                cleared += 1;
                if pos + cleared >= gradient.len() {
                    return cleared;
                }
            } else {
                return cleared;
            }
        }
    }

    /// Emit a create/update snapshot of an open item's current content.
    fn emit_snapshot(&mut self, item_id: &str, now: Instant) -> Option<UpsertObject> {
        let (turn_id, source_timestamp, status, payload) = {
            let item = self.items.get_mut(item_id)?;
            let status = if item.create_sent {
                UpsertStatus::Update
            } else {
                UpsertStatus::Create
            };
            item.create_sent = true;
            item.emitted_tokens = item.token_count();
            item.dirty = false;
            item.last_activity = now;
            let payload = snapshot_payload(item, &self.origin);
            (item.turn_id.clone(), item.source_timestamp, status, payload)
        };
        Some(self.build_upsert(item_id, &turn_id, source_timestamp, status, payload))
    }

    fn build_upsert(
        &self,
        item_id: &str,
        turn_id: &TurnId,
        source_timestamp: DateTime<Utc>,
        status: UpsertStatus,
        payload: UpsertPayload,
    ) -> UpsertObject {
        UpsertObject {
            turn_id: turn_id.clone(),
            session_id: self.session_id.clone(),
            item_id: item_id.to_string(),
            source_timestamp,
            emitted_at: Utc::now(),
            status,
            payload,
        }
    }

    fn remove_item(&mut self, item_id: &str) -> Option<OpenItem> {
        self.item_order.retain(|id| id != item_id);
        self.items.remove(item_id)
    }
}

/// Streaming snapshot payload for an open item.
fn snapshot_payload(item: &OpenItem, origin: &str) -> UpsertPayload {
    match item.kind {
        ItemKind::Message => UpsertPayload::Message {
            content: item.content.clone(),
            origin: origin.to_string(),
        },
        ItemKind::Reasoning => UpsertPayload::Thinking {
            content: item.content.clone(),
            provider_id: String::new(),
        },
        ItemKind::FunctionCall | ItemKind::FunctionCallOutput => UpsertPayload::ToolCall {
            name: item.name.clone().unwrap_or_default(),
            call_id: item.call_id.clone().unwrap_or_default(),
            // Raw argument text; parsed only when the item completes.
            arguments: Value::String(item.content.clone()),
            output: None,
            output_is_error: false,
        },
    }
}

/// Authoritative payload for a completed item.
fn payload_from_final(item: &FinalItem) -> UpsertPayload {
    match item {
        FinalItem::Message { content, origin } => UpsertPayload::Message {
            content: content.clone(),
            origin: origin.clone(),
        },
        FinalItem::Reasoning { content, provider_id } => UpsertPayload::Thinking {
            content: content.clone(),
            provider_id: provider_id.clone(),
        },
        FinalItem::FunctionCall { name, call_id, arguments } => UpsertPayload::ToolCall {
            name: name.clone(),
            call_id: call_id.clone(),
            arguments: arguments.clone(),
            output: None,
            output_is_error: false,
        },
        FinalItem::FunctionCallOutput { call_id, output, is_error } => UpsertPayload::ToolCall {
            name: String::new(),
            call_id: call_id.clone(),
            arguments: Value::Null,
            output: Some(output.clone()),
            output_is_error: *is_error,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================
