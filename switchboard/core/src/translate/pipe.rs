//! Translator for the message/content-block streaming dialect.
//!
//! The provider streams one native message at a time: `message_start`,
//! per-index block start/delta/stop, a `message_delta` carrying the stop
//! reason and usage, then `message_stop`. Tool results arrive out of
//! band, correlated by invocation id.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::client::{PipeBlock, PipeEvent};
use crate::correlate::{TurnLedger, TurnOutcome};
use crate::error::codes;
use crate::events::{
    item_id, CanonicalEvent, FinalItem, ItemEvent, ItemKind, TurnId, TurnSignal, TurnStatus, Usage,
};

// ============================================================================
// Block state
// ============================================================================

#[derive(Debug)]
enum BlockContent {
    Text { content: String },
    Thinking { content: String, provider_id: String },
    ToolUse { name: String, call_id: String, raw_args: String },
}

#[derive(Debug)]
struct OpenBlock {
    item_id: String,
    content: BlockContent,
}

impl OpenBlock {
    fn push(&mut self, fragment: &str) {
        match &mut self.content {
            BlockContent::Text { content }
            | BlockContent::Thinking { content, .. }
            | BlockContent::ToolUse { raw_args: content, .. } => content.push_str(fragment),
        }
    }

    fn finalize(self) -> FinalItem {
        match self.content {
            BlockContent::Text { content } => FinalItem::Message {
                content,
                origin: "pipe".to_string(),
            },
            BlockContent::Thinking { content, provider_id } => FinalItem::Reasoning {
                content,
                provider_id,
            },
            BlockContent::ToolUse { name, call_id, raw_args } => {
                // Arguments are parsed exactly once, here. An empty or
                // unparsable payload degrades to an empty object.
                let arguments = if raw_args.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&raw_args).unwrap_or_else(|err| {
                        warn!(call_id = %call_id, %err, "unparsable tool arguments, substituting empty object");
                        Value::Object(serde_json::Map::new())
                    })
                };
                FinalItem::FunctionCall { name, call_id, arguments }
            }
        }
    }
}

// ============================================================================
// Translator
// ============================================================================

/// State machine translating pipe-dialect events into canonical events.
///
/// One native message is in flight at a time; blocks are keyed by their
/// native index. Tool-call item ids are remembered across messages so an
/// out-of-band tool result can be attributed to the invocation it answers.
pub struct PipeTranslator {
    open_blocks: HashMap<usize, OpenBlock>,
    /// call_id -> item id of the function-call item
    tool_items: HashMap<String, String>,
    last_stop_reason: Option<String>,
    last_usage: Option<Usage>,
    /// Set when a message started with no turn to attribute it to; the
    /// whole message is swallowed until its `message_stop`.
    orphan_message: bool,
    synthesized_calls: u64,
}

impl PipeTranslator {
    /// Fresh translator with no message in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open_blocks: HashMap::new(),
            tool_items: HashMap::new(),
            last_stop_reason: None,
            last_usage: None,
            orphan_message: false,
            synthesized_calls: 0,
        }
    }

    /// Fold one native event, emitting canonical events in native order.
    pub fn translate(&mut self, ledger: &mut TurnLedger, event: PipeEvent) -> Vec<CanonicalEvent> {
        match event {
            PipeEvent::MessageStart { model_id } => self.on_message_start(ledger, model_id),
            PipeEvent::BlockStart { index, block } => self.on_block_start(ledger, index, block),
            PipeEvent::BlockDelta { index, text } => self.on_block_delta(ledger, index, &text),
            PipeEvent::BlockStop { index } => self.on_block_stop(ledger, index),
            PipeEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.last_stop_reason = stop_reason;
                }
                if usage.is_some() {
                    self.last_usage = usage;
                }
                Vec::new()
            }
            PipeEvent::MessageStop => self.on_message_stop(ledger),
            PipeEvent::ToolResult { call_id, output, is_error } => {
                self.on_tool_result(ledger, call_id, output, is_error)
            }
        }
    }

    fn on_message_start(&mut self, ledger: &mut TurnLedger, model_id: String) -> Vec<CanonicalEvent> {
        self.open_blocks.clear();
        self.last_stop_reason = None;
        self.last_usage = None;
        self.orphan_message = false;

        if ledger.active_id().is_some() {
            // A follow-up native message within the same turn (e.g. after a
            // tool round-trip). Item ids must not collide with the previous
            // message's blocks.
            ledger.bump_message_ordinal();
            return Vec::new();
        }

        match ledger.start_next() {
            Some(turn_id) => vec![CanonicalEvent::turn(
                turn_id,
                TurnSignal::Started {
                    model_id,
                    provider_id: "pipe".to_string(),
                },
            )],
            None => {
                // No prompt is outstanding; nothing to attribute this
                // message to. Swallow it wholesale.
                warn!("message_start with no pending turn, dropping the native message");
                self.orphan_message = true;
                Vec::new()
            }
        }
    }

    fn on_block_start(
        &mut self,
        ledger: &mut TurnLedger,
        index: usize,
        block: PipeBlock,
    ) -> Vec<CanonicalEvent> {
        let Some(turn_id) = self.attributed_turn(ledger) else {
            return Vec::new();
        };
        let id = item_id(&turn_id, ledger.message_ordinal(), index);

        let (kind, name, call_id, content) = match block {
            PipeBlock::Text => (ItemKind::Message, None, None, BlockContent::Text {
                content: String::new(),
            }),
            PipeBlock::Thinking { provider_id } => (
                ItemKind::Reasoning,
                None,
                None,
                BlockContent::Thinking {
                    content: String::new(),
                    provider_id: provider_id.unwrap_or_default(),
                },
            ),
            PipeBlock::ToolUse { id: native_id, name } => {
                self.tool_items.insert(native_id.clone(), id.clone());
                (
                    ItemKind::FunctionCall,
                    Some(name.clone()),
                    Some(native_id.clone()),
                    BlockContent::ToolUse {
                        name,
                        call_id: native_id,
                        raw_args: String::new(),
                    },
                )
            }
        };

        self.open_blocks.insert(index, OpenBlock {
            item_id: id.clone(),
            content,
        });
        vec![CanonicalEvent::item(turn_id, ItemEvent::Start {
            item_id: id,
            kind,
            name,
            call_id,
        })]
    }

    fn on_block_delta(
        &mut self,
        ledger: &mut TurnLedger,
        index: usize,
        fragment: &str,
    ) -> Vec<CanonicalEvent> {
        let Some(turn_id) = self.attributed_turn(ledger) else {
            return Vec::new();
        };
        let Some(block) = self.open_blocks.get_mut(&index) else {
            warn!(index, "delta for a block that was never started, dropping");
            return Vec::new();
        };
        block.push(fragment);
        vec![CanonicalEvent::item(turn_id, ItemEvent::Delta {
            item_id: block.item_id.clone(),
            delta: fragment.to_string(),
        })]
    }

    fn on_block_stop(&mut self, ledger: &mut TurnLedger, index: usize) -> Vec<CanonicalEvent> {
        let Some(turn_id) = self.attributed_turn(ledger) else {
            return Vec::new();
        };
        let Some(block) = self.open_blocks.remove(&index) else {
            warn!(index, "stop for a block that was never started, dropping");
            return Vec::new();
        };
        let id = block.item_id.clone();
        vec![CanonicalEvent::item(turn_id, ItemEvent::Done {
            item_id: id,
            item: block.finalize(),
        })]
    }

    fn on_message_stop(&mut self, ledger: &mut TurnLedger) -> Vec<CanonicalEvent> {
        if self.orphan_message {
            self.orphan_message = false;
            return Vec::new();
        }
        let Some(turn_id) = ledger.active_id().cloned() else {
            return Vec::new();
        };

        let stop_reason = self.last_stop_reason.take();
        let usage = self.last_usage;
        let completed = matches!(stop_reason.as_deref(), Some("end_turn" | "tool_use"));
        let failed = stop_reason.as_deref() == Some("error");

        // Close anything the provider left open, in native index order.
        // Blocks cut short by a cancellation are cancelled, not
        // completed, so nothing half-written reaches subscribers.
        let mut indexes: Vec<usize> = self.open_blocks.keys().copied().collect();
        indexes.sort_unstable();
        let mut out = Vec::new();
        for index in indexes {
            if let Some(block) = self.open_blocks.remove(&index) {
                let id = block.item_id.clone();
                let ev = if failed {
                    ItemEvent::Error {
                        item_id: id,
                        error: "turn failed before the block finished".to_string(),
                    }
                } else if completed {
                    ItemEvent::Done {
                        item_id: id,
                        item: block.finalize(),
                    }
                } else {
                    ItemEvent::Cancelled {
                        item_id: id,
                        reason: stop_reason.clone(),
                    }
                };
                out.push(CanonicalEvent::item(turn_id.clone(), ev));
            }
        }

        let (signal, outcome) = match stop_reason.as_deref() {
            Some("error") => (
                TurnSignal::Error {
                    code: codes::PROCESS_CRASH.to_string(),
                    message: "provider reported an error stop".to_string(),
                },
                TurnOutcome::Failed {
                    code: codes::PROCESS_CRASH.to_string(),
                    message: "provider reported an error stop".to_string(),
                },
            ),
            Some("end_turn" | "tool_use") => (
                TurnSignal::Done {
                    status: TurnStatus::Completed,
                    finish_reason: stop_reason.clone(),
                    usage,
                },
                TurnOutcome::Done(TurnStatus::Completed),
            ),
            // An unknown stop reason, or a message that ended without
            // ever reporting one, is an interruption, not a completion.
            Some(_) | None => (
                TurnSignal::Done {
                    status: TurnStatus::Cancelled,
                    finish_reason: stop_reason.clone(),
                    usage,
                },
                TurnOutcome::Done(TurnStatus::Cancelled),
            ),
        };
        ledger.settle_active(outcome);
        out.push(CanonicalEvent::turn(turn_id, signal));
        out
    }

    fn on_tool_result(
        &mut self,
        ledger: &mut TurnLedger,
        call_id: Option<String>,
        output: String,
        is_error: bool,
    ) -> Vec<CanonicalEvent> {
        let Some(turn_id) = ledger.active_id().cloned() else {
            warn!("tool result with no active turn, dropping");
            return Vec::new();
        };

        // Attribute to the invocation if we saw it stream; otherwise
        // synthesize a stable id so the result is still surfaced.
        let (call_id, out_item_id) = match call_id.and_then(|id| {
            self.tool_items.get(&id).cloned().map(|item| (id, item))
        }) {
            Some((call, item)) => (call, format!("{item}:output")),
            None => {
                self.synthesized_calls += 1;
                let call = format!("tool_{}", self.synthesized_calls);
                let item = format!(
                    "{}:{}:{}:output",
                    turn_id.0,
                    ledger.message_ordinal(),
                    call
                );
                (call, item)
            }
        };

        vec![CanonicalEvent::item(turn_id, ItemEvent::Done {
            item_id: out_item_id,
            item: FinalItem::FunctionCallOutput { call_id, output, is_error },
        })]
    }

    /// The turn the current message belongs to, or `None` if the message
    /// is an orphan being swallowed.
    fn attributed_turn(&self, ledger: &TurnLedger) -> Option<TurnId> {
        if self.orphan_message {
            return None;
        }
        ledger.active_id().cloned()
    }
}

impl Default for PipeTranslator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
