//! Translator for the notification streaming dialect.
//!
//! The provider sends session-update notifications while a prompt is
//! outstanding, then a completion result carrying the stop reason. There
//! is no explicit turn-start marker; the first notification after a
//! prompt implicitly starts the turn.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::client::{AcpEvent, AcpStopReason, AcpUpdate};
use crate::correlate::{TurnLedger, TurnOutcome};
use crate::error::{codes, HostError};
use crate::events::{
    item_id, CanonicalEvent, FinalItem, ItemEvent, ItemKind, TurnId, TurnSignal, TurnStatus,
};

// ============================================================================
// Item state
// ============================================================================

#[derive(Debug)]
enum AcpItemKind {
    Message,
    Thought,
    ToolCall {
        name: String,
        call_id: String,
        arguments: Value,
        output: String,
        output_is_error: bool,
    },
}

#[derive(Debug)]
struct OpenAcpItem {
    item_id: String,
    kind: AcpItemKind,
    content: String,
}

/// Keys into the per-turn item map. Message and thought chunks each
/// accumulate into one item per turn; tool calls are keyed by call id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ItemKey {
    Message,
    Thought,
    Tool(String),
}

// ============================================================================
// Translator
// ============================================================================

/// State machine translating notification-dialect events into canonical
/// events. Block indexes are synthesized in order of first appearance,
/// since the protocol has no native index.
pub struct AcpTranslator {
    items: HashMap<ItemKey, OpenAcpItem>,
    order: Vec<ItemKey>,
    next_index: usize,
}

impl AcpTranslator {
    /// Fresh translator with no turn in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            order: Vec::new(),
            next_index: 0,
        }
    }

    /// Fold one native event, emitting canonical events in native order.
    pub fn translate(&mut self, ledger: &mut TurnLedger, event: AcpEvent) -> Vec<CanonicalEvent> {
        match event {
            AcpEvent::Update(update) => self.on_update(ledger, update),
            AcpEvent::PromptDone { stop_reason, usage } => {
                self.on_prompt_done(ledger, stop_reason, usage)
            }
            AcpEvent::TransportError { message } => self.on_transport_error(ledger, &message),
        }
    }

    fn on_update(&mut self, ledger: &mut TurnLedger, update: AcpUpdate) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        let Some(turn_id) = self.ensure_started(ledger, &mut out) else {
            return out;
        };

        match update {
            AcpUpdate::MessageChunk { text } => {
                self.append_chunk(&turn_id, ledger, ItemKey::Message, &text, &mut out);
            }
            AcpUpdate::ThoughtChunk { text } => {
                self.append_chunk(&turn_id, ledger, ItemKey::Thought, &text, &mut out);
            }
            AcpUpdate::ToolCall { call_id, name, arguments } => {
                let id = self.allocate_item_id(&turn_id, ledger);
                self.items.insert(ItemKey::Tool(call_id.clone()), OpenAcpItem {
                    item_id: id.clone(),
                    kind: AcpItemKind::ToolCall {
                        name: name.clone(),
                        call_id: call_id.clone(),
                        arguments,
                        output: String::new(),
                        output_is_error: false,
                    },
                    content: String::new(),
                });
                self.order.push(ItemKey::Tool(call_id.clone()));
                out.push(CanonicalEvent::item(turn_id, ItemEvent::Start {
                    item_id: id,
                    kind: ItemKind::FunctionCall,
                    name: Some(name),
                    call_id: Some(call_id),
                }));
            }
            AcpUpdate::ToolCallUpdate { call_id, output, is_error, done } => {
                let key = ItemKey::Tool(call_id.clone());
                let Some(item) = self.items.get_mut(&key) else {
                    warn!(%call_id, "update for a tool call that was never announced, dropping");
                    return out;
                };
                if let AcpItemKind::ToolCall { output: buffered, output_is_error, .. } =
                    &mut item.kind
                {
                    if let Some(chunk) = output {
                        buffered.push_str(&chunk);
                    }
                    *output_is_error = is_error;
                }
                if done {
                    if let Some(item) = self.items.remove(&key) {
                        self.order.retain(|k| k != &key);
                        out.extend(
                            finalize_item(item).into_iter().map(|ev| {
                                CanonicalEvent::item(turn_id.clone(), ev)
                            }),
                        );
                    }
                }
            }
        }
        out
    }

    fn on_prompt_done(
        &mut self,
        ledger: &mut TurnLedger,
        stop_reason: AcpStopReason,
        usage: Option<crate::events::Usage>,
    ) -> Vec<CanonicalEvent> {
        // A result with no preceding notification has no started turn to
        // settle. Emitting a terminal for a turn that never started would
        // break the started-before-terminal ordering, so the waiting
        // prompt is rejected instead.
        let Some(turn_id) = ledger.active_id().cloned() else {
            warn!("completion result before any notification, rejecting the waiting turn");
            ledger.reject_front(&HostError::ProtocolError {
                message: "completion result arrived before any notification".to_string(),
            });
            return Vec::new();
        };

        let cancelled = stop_reason == AcpStopReason::Cancelled;
        let mut out = self.close_open_items(&turn_id, cancelled);

        let (signal, outcome) = match stop_reason {
            AcpStopReason::EndTurn | AcpStopReason::MaxTokens | AcpStopReason::MaxTurnRequests => (
                TurnSignal::Done {
                    status: TurnStatus::Completed,
                    finish_reason: Some(stop_reason.as_str().to_string()),
                    usage,
                },
                TurnOutcome::Done(TurnStatus::Completed),
            ),
            AcpStopReason::Cancelled => (
                TurnSignal::Done {
                    status: TurnStatus::Cancelled,
                    finish_reason: Some(stop_reason.as_str().to_string()),
                    usage,
                },
                TurnOutcome::Done(TurnStatus::Cancelled),
            ),
            AcpStopReason::Refusal => (
                TurnSignal::Error {
                    code: codes::PROTOCOL_ERROR.to_string(),
                    message: "the agent refused the prompt".to_string(),
                },
                TurnOutcome::Failed {
                    code: codes::PROTOCOL_ERROR.to_string(),
                    message: "the agent refused the prompt".to_string(),
                },
            ),
        };
        ledger.settle_active(outcome);
        self.reset_turn_state();
        out.push(CanonicalEvent::turn(turn_id, signal));
        out
    }

    fn on_transport_error(
        &mut self,
        ledger: &mut TurnLedger,
        message: &str,
    ) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        if let Some(turn_id) = ledger.active_id().cloned() {
            // Open items fail with the crash before the turn's terminal.
            for key in std::mem::take(&mut self.order) {
                if let Some(item) = self.items.remove(&key) {
                    out.push(CanonicalEvent::item(turn_id.clone(), ItemEvent::Error {
                        item_id: item.item_id,
                        error: message.to_string(),
                    }));
                }
            }
            out.push(CanonicalEvent::turn(turn_id, TurnSignal::Error {
                code: codes::PROCESS_CRASH.to_string(),
                message: message.to_string(),
            }));
        }
        // Settles the active turn and rejects everything queued behind it.
        ledger.fail_all(codes::PROCESS_CRASH, message);
        self.reset_turn_state();
        out
    }

    /// Start the pending turn on the first notification, if none is active.
    fn ensure_started(
        &mut self,
        ledger: &mut TurnLedger,
        out: &mut Vec<CanonicalEvent>,
    ) -> Option<TurnId> {
        if let Some(id) = ledger.active_id().cloned() {
            return Some(id);
        }
        match ledger.start_next() {
            Some(id) => {
                self.reset_turn_state();
                out.push(CanonicalEvent::turn(id.clone(), TurnSignal::Started {
                    model_id: String::new(),
                    provider_id: "acp".to_string(),
                }));
                Some(id)
            }
            None => {
                warn!("notification with no outstanding prompt, dropping");
                None
            }
        }
    }

    fn append_chunk(
        &mut self,
        turn_id: &TurnId,
        ledger: &TurnLedger,
        key: ItemKey,
        text: &str,
        out: &mut Vec<CanonicalEvent>,
    ) {
        if !self.items.contains_key(&key) {
            let id = item_id(turn_id, ledger.message_ordinal(), self.next_index);
            self.next_index += 1;
            let (kind, item_kind) = match key {
                ItemKey::Message => (ItemKind::Message, AcpItemKind::Message),
                ItemKey::Thought => (ItemKind::Reasoning, AcpItemKind::Thought),
                // Tool items open via `ToolCall` updates, never via chunks.
                ItemKey::Tool(_) => return,
            };
            self.items.insert(key.clone(), OpenAcpItem {
                item_id: id.clone(),
                kind: item_kind,
                content: String::new(),
            });
            self.order.push(key.clone());
            out.push(CanonicalEvent::item(turn_id.clone(), ItemEvent::Start {
                item_id: id,
                kind,
                name: None,
                call_id: None,
            }));
        }
        // Presence checked just above.
        if let Some(item) = self.items.get_mut(&key) {
            item.content.push_str(text);
            out.push(CanonicalEvent::item(turn_id.clone(), ItemEvent::Delta {
                item_id: item.item_id.clone(),
                delta: text.to_string(),
            }));
        }
    }

    fn allocate_item_id(&mut self, turn_id: &TurnId, ledger: &TurnLedger) -> String {
        let id = item_id(turn_id, ledger.message_ordinal(), self.next_index);
        self.next_index += 1;
        id
    }

    /// Close every open item: normally finalized, but a cancelled stop
    /// cancels them so nothing half-written reaches subscribers.
    fn close_open_items(&mut self, turn_id: &TurnId, cancelled: bool) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();
        for key in std::mem::take(&mut self.order) {
            if let Some(item) = self.items.remove(&key) {
                if cancelled {
                    out.push(CanonicalEvent::item(turn_id.clone(), ItemEvent::Cancelled {
                        item_id: item.item_id,
                        reason: Some("cancelled".to_string()),
                    }));
                } else {
                    out.extend(
                        finalize_item(item)
                            .into_iter()
                            .map(|ev| CanonicalEvent::item(turn_id.clone(), ev)),
                    );
                }
            }
        }
        out
    }

    fn reset_turn_state(&mut self) {
        self.items.clear();
        self.order.clear();
        self.next_index = 0;
    }
}

impl Default for AcpTranslator {
    fn default() -> Self {
        Self::new()
    }
}

/// Done events for a finished item. Tool calls with buffered output also
/// yield the paired output item.
fn finalize_item(item: OpenAcpItem) -> Vec<ItemEvent> {
    match item.kind {
        AcpItemKind::Message => vec![ItemEvent::Done {
            item_id: item.item_id,
            item: FinalItem::Message {
                content: item.content,
                origin: "acp".to_string(),
            },
        }],
        AcpItemKind::Thought => vec![ItemEvent::Done {
            item_id: item.item_id,
            item: FinalItem::Reasoning {
                content: item.content,
                provider_id: String::new(),
            },
        }],
        AcpItemKind::ToolCall { name, call_id, arguments, output, output_is_error } => {
            let mut events = vec![ItemEvent::Done {
                item_id: item.item_id.clone(),
                item: FinalItem::FunctionCall {
                    name,
                    call_id: call_id.clone(),
                    arguments,
                },
            }];
            if !output.is_empty() {
                events.push(ItemEvent::Done {
                    item_id: format!("{}:output", item.item_id),
                    item: FinalItem::FunctionCallOutput {
                        call_id,
                        output,
                        is_error: output_is_error,
                    },
                });
            }
            events
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
