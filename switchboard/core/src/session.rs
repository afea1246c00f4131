//! Per-session stream state.
//!
//! A [`SessionStream`] owns everything that turns one connection's native
//! events into subscriber-visible upserts: the protocol translator, the
//! turn ledger and the batch processor. It is driven synchronously by
//! the reader task that consumes the connection's event channel; all of
//! its state sits behind one `parking_lot` mutex that is never held
//! across an await point.

use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::batch::{BatchConfig, BatchOutput, BatchProcessor};
use crate::client::{CliType, NativeEvent};
use crate::correlate::{TurnLedger, TurnSignals};
use crate::error::HostError;
use crate::events::{CanonicalEvent, SessionId, TurnId, TurnSignal};
use crate::translate::Translator;
use crate::upsert::{TurnEvent, UpsertObject};

// ============================================================================
// Stream
// ============================================================================

/// Streaming state for one bound session.
pub struct SessionStream {
    session_id: SessionId,
    state: Mutex<StreamState>,
}

struct StreamState {
    translator: Translator,
    ledger: TurnLedger,
    batch: BatchProcessor,
    upsert_subs: Vec<mpsc::UnboundedSender<UpsertObject>>,
    turn_subs: Vec<mpsc::UnboundedSender<TurnEvent>>,
    /// Set once the stream has been torn down; later events are ignored.
    defunct: bool,
}

impl SessionStream {
    /// New stream for a freshly bound session.
    #[must_use]
    pub fn new(session_id: SessionId, cli_type: CliType, batch_config: BatchConfig) -> Self {
        let batch = BatchProcessor::new(session_id.clone(), cli_type.as_str(), batch_config);
        Self {
            session_id,
            state: Mutex::new(StreamState {
                translator: Translator::for_cli(cli_type),
                ledger: TurnLedger::new(),
                batch,
                upsert_subs: Vec::new(),
                turn_subs: Vec::new(),
                defunct: false,
            }),
        }
    }

    /// Id of the session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Queue a turn behind whatever is already outstanding.
    pub fn enqueue_turn(&self, turn_id: TurnId) -> TurnSignals {
        self.state.lock().ledger.enqueue(turn_id)
    }

    /// Reject a queued turn that never reached the agent.
    pub fn abort_pending(&self, turn_id: &TurnId, error: HostError) -> bool {
        self.state.lock().ledger.abort_pending(turn_id, error)
    }

    /// Whether a turn is currently bound to the native stream.
    #[must_use]
    pub fn has_active_turn(&self) -> bool {
        self.state.lock().ledger.active_id().is_some()
    }

    /// Reject the oldest queued turn before it starts.
    pub fn reject_front_pending(&self, error: &HostError) -> Option<TurnId> {
        self.state.lock().ledger.reject_front(error)
    }

    /// Feed one native event through translation and batching,
    /// delivering whatever falls out to subscribers.
    pub fn handle_native(&self, event: NativeEvent) {
        let mut state = self.state.lock();
        if state.defunct {
            return;
        }
        let canonical = {
            let StreamState { translator, ledger, .. } = &mut *state;
            translator.translate(ledger, event)
        };
        let now = Instant::now();
        let mut outputs = Vec::new();
        for ev in &canonical {
            outputs.extend(state.batch.on_event(ev, now));
        }
        deliver(&mut state, outputs);
    }

    /// Flush items whose idle interval elapsed.
    pub fn flush_idle(&self) {
        let mut state = self.state.lock();
        if state.defunct {
            return;
        }
        let outputs = state.batch.flush_idle(Instant::now());
        deliver(&mut state, outputs);
    }

    /// When the reader should next wake for an idle flush.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().batch.next_deadline()
    }

    /// Tear the stream down loudly: every open item gets an error
    /// upsert, the active turn gets a turn error, queued turns are
    /// rejected. Used for crashes and evictions.
    pub fn fail(&self, code: &str, message: &str) {
        let mut state = self.state.lock();
        if state.defunct {
            return;
        }
        state.defunct = true;
        let mut outputs = state.batch.fail_open_items(code, message);
        let active = state.ledger.fail_all(code, message);
        if let Some(turn_id) = active {
            let ev = CanonicalEvent::turn(turn_id, TurnSignal::Error {
                code: code.to_string(),
                message: message.to_string(),
            });
            outputs.extend(state.batch.on_event(&ev, Instant::now()));
        }
        deliver(&mut state, outputs);
        debug!(session_id = %self.session_id.0, code, "session stream failed");
    }

    /// Tear the stream down silently: subscribers see nothing, but
    /// outstanding turn signals still fire so callers do not hang. Used
    /// for explicit kills.
    pub fn silence(&self, code: &str, message: &str) {
        let mut state = self.state.lock();
        state.upsert_subs.clear();
        state.turn_subs.clear();
        state.defunct = true;
        state.ledger.fail_all(code, message);
    }

    /// Subscribe to this session's upserts.
    pub fn subscribe_upserts(&self) -> mpsc::UnboundedReceiver<UpsertObject> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().upsert_subs.push(tx);
        rx
    }

    /// Subscribe to this session's turn events.
    pub fn subscribe_turns(&self) -> mpsc::UnboundedReceiver<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().turn_subs.push(tx);
        rx
    }
}

/// Fan outputs out to subscribers, pruning any whose receiver is gone.
fn deliver(state: &mut StreamState, outputs: Vec<BatchOutput>) {
    for output in outputs {
        match output {
            BatchOutput::Upsert(upsert) => {
                state.upsert_subs.retain(|tx| tx.send(upsert.clone()).is_ok());
            }
            BatchOutput::Turn(event) => {
                state.turn_subs.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
