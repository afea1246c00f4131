//! Turn Correlator
//!
//! Per-session bookkeeping that binds caller-submitted turns to the native
//! stream's start markers in strict FIFO order, and fires each turn's two
//! single-fire outcome signals: "started" (the translator observed the start
//! marker) and "settled" (the turn reached its terminal).
//!
//! `send_message` returns once "started" resolves rather than waiting for
//! "settled", which bounds caller-visible latency to acknowledgment. A second
//! send on the same session cannot start until the translator observes its
//! predecessor's start marker, so submission order is preserved.

use std::collections::{HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::error::HostError;
use crate::events::{TurnId, TurnStatus};

/// How a turn ended
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    /// The turn completed (or was cancelled by a non-terminal stop reason)
    Done(TurnStatus),
    /// The turn failed
    Failed {
        /// Stable error code
        code: String,
        /// Failure description
        message: String,
    },
}

/// Receivers for one turn's two single-fire signals
pub struct TurnSignals {
    /// Resolves when the translator observes the turn's start marker,
    /// or with an error if the turn is rejected before starting
    pub started: oneshot::Receiver<Result<(), HostError>>,
    /// Resolves when the turn reaches its terminal
    pub settled: oneshot::Receiver<TurnOutcome>,
}

/// A submitted turn not yet bound to a native start marker
struct PendingTurn {
    id: TurnId,
    started: Option<oneshot::Sender<Result<(), HostError>>>,
    settled: Option<oneshot::Sender<TurnOutcome>>,
}

/// The turn currently bound to the native stream
struct ActiveTurn {
    id: TurnId,
    message_ordinal: u32,
    settled: Option<oneshot::Sender<TurnOutcome>>,
}

/// Per-session FIFO turn queue with settle-once guards
#[derive(Default)]
pub struct TurnLedger {
    pending: VecDeque<PendingTurn>,
    active: Option<ActiveTurn>,
    terminated: HashSet<TurnId>,
}

impl TurnLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a submitted turn; its id is assigned by the caller before
    /// enqueueing and is final from this point on.
    pub fn enqueue(&mut self, id: TurnId) -> TurnSignals {
        let (started_tx, started_rx) = oneshot::channel();
        let (settled_tx, settled_rx) = oneshot::channel();
        self.pending.push_back(PendingTurn {
            id,
            started: Some(started_tx),
            settled: Some(settled_tx),
        });
        TurnSignals {
            started: started_rx,
            settled: settled_rx,
        }
    }

    /// Remove a still-pending turn (e.g. the prompt write failed after
    /// enqueueing). Returns true if it was found and removed.
    pub fn abort_pending(&mut self, id: &TurnId, error: HostError) -> bool {
        let Some(pos) = self.pending.iter().position(|t| &t.id == id) else {
            return false;
        };
        let Some(mut turn) = self.pending.remove(pos) else {
            return false;
        };
        if let Some(tx) = turn.started.take() {
            let _ = tx.send(Err(error));
        }
        true
    }

    /// Reject the oldest pending turn before it ever starts.
    ///
    /// Fires its "started" signal with the error and settles it as failed
    /// so neither waiter hangs. Returns the rejected id, if any turn was
    /// pending.
    pub fn reject_front(&mut self, error: &HostError) -> Option<TurnId> {
        let mut turn = self.pending.pop_front()?;
        if let Some(tx) = turn.started.take() {
            let _ = tx.send(Err(error.clone()));
        }
        if let Some(tx) = turn.settled.take() {
            let _ = tx.send(TurnOutcome::Failed {
                code: error.code().to_string(),
                message: error.to_string(),
            });
        }
        self.terminated.insert(turn.id.clone());
        Some(turn.id)
    }

    /// Bind the oldest pending turn to a native start marker.
    ///
    /// Fires its "started" signal exactly once and makes it the active turn
    /// with message ordinal 1. Returns `None` when nothing is pending, which
    /// the translators treat as a protocol error.
    pub fn start_next(&mut self) -> Option<TurnId> {
        let mut turn = self.pending.pop_front()?;
        if let Some(tx) = turn.started.take() {
            let _ = tx.send(Ok(()));
        }
        let id = turn.id.clone();
        self.active = Some(ActiveTurn {
            id: id.clone(),
            message_ordinal: 1,
            settled: turn.settled,
        });
        Some(id)
    }

    /// The turn currently bound to the stream, if any
    #[must_use]
    pub fn active_id(&self) -> Option<&TurnId> {
        self.active.as_ref().map(|t| &t.id)
    }

    /// Message ordinal of the active turn (1-based)
    #[must_use]
    pub fn message_ordinal(&self) -> u32 {
        self.active.as_ref().map_or(1, |t| t.message_ordinal)
    }

    /// The active turn observed another native message start
    pub fn bump_message_ordinal(&mut self) {
        if let Some(turn) = self.active.as_mut() {
            turn.message_ordinal += 1;
        }
    }

    /// Number of turns submitted but not yet started
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether this turn already recorded its terminal
    #[must_use]
    pub fn is_terminated(&self, id: &TurnId) -> bool {
        self.terminated.contains(id)
    }

    /// Record the active turn's terminal and fire its "settled" signal.
    ///
    /// Idempotent on the signal: the sender is taken exactly once. Returns the
    /// settled turn's id, or `None` if no turn was active.
    pub fn settle_active(&mut self, outcome: TurnOutcome) -> Option<TurnId> {
        let mut turn = self.active.take()?;
        if let Some(tx) = turn.settled.take() {
            let _ = tx.send(outcome);
        }
        self.terminated.insert(turn.id.clone());
        Some(turn.id)
    }

    /// Fail the active turn and reject every pending turn.
    ///
    /// Used for eviction, kill, and crash. Returns the id of the turn that was
    /// active (and therefore started), if any; pending turns are rejected
    /// through their "started" signals and never produce events.
    pub fn fail_all(&mut self, code: &str, message: &str) -> Option<TurnId> {
        let failed_active = self.settle_active(TurnOutcome::Failed {
            code: code.to_string(),
            message: message.to_string(),
        });
        for mut turn in self.pending.drain(..) {
            if let Some(tx) = turn.started.take() {
                let _ = tx.send(Err(HostError::for_code(code, message)));
            }
            if let Some(tx) = turn.settled.take() {
                let _ = tx.send(TurnOutcome::Failed {
                    code: code.to_string(),
                    message: message.to_string(),
                });
            }
            self.terminated.insert(turn.id);
        }
        failed_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: u32) -> TurnId {
        TurnId(format!("turn-{n}"))
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let mut ledger = TurnLedger::new();
        let mut sig1 = ledger.enqueue(turn(1));
        let mut sig2 = ledger.enqueue(turn(2));

        assert_eq!(ledger.start_next(), Some(turn(1)));
        assert!(sig1.started.try_recv().unwrap().is_ok());
        // Second turn has not started yet
        assert!(sig2.started.try_recv().is_err());

        ledger.settle_active(TurnOutcome::Done(TurnStatus::Completed));
        assert_eq!(ledger.start_next(), Some(turn(2)));
        assert!(sig2.started.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_started_before_settled() {
        let mut ledger = TurnLedger::new();
        let mut signals = ledger.enqueue(turn(1));

        ledger.start_next();
        assert!(signals.started.try_recv().is_ok());
        assert!(signals.settled.try_recv().is_err());

        ledger.settle_active(TurnOutcome::Done(TurnStatus::Completed));
        assert_eq!(
            signals.settled.try_recv().unwrap(),
            TurnOutcome::Done(TurnStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_settle_is_single_fire() {
        let mut ledger = TurnLedger::new();
        let _signals = ledger.enqueue(turn(1));
        ledger.start_next();

        assert_eq!(
            ledger.settle_active(TurnOutcome::Done(TurnStatus::Completed)),
            Some(turn(1))
        );
        // No active turn remains; a second settle is a no-op
        assert_eq!(
            ledger.settle_active(TurnOutcome::Done(TurnStatus::Cancelled)),
            None
        );
        assert!(ledger.is_terminated(&turn(1)));
    }

    #[tokio::test]
    async fn test_start_next_empty_queue() {
        let mut ledger = TurnLedger::new();
        assert_eq!(ledger.start_next(), None);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_pending() {
        let mut ledger = TurnLedger::new();
        let mut active_sig = ledger.enqueue(turn(1));
        let mut pending_sig = ledger.enqueue(turn(2));
        ledger.start_next();

        let failed = ledger.fail_all("PROCESS_CRASH", "evicted");
        assert_eq!(failed, Some(turn(1)));

        // Active turn settled with the failure
        match active_sig.settled.try_recv().unwrap() {
            TurnOutcome::Failed { code, message } => {
                assert_eq!(code, "PROCESS_CRASH");
                assert_eq!(message, "evicted");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        // Pending turn rejected through its started signal
        let started = pending_sig.started.try_recv().unwrap();
        assert_eq!(started.unwrap_err().code(), "PROCESS_CRASH");
        assert!(ledger.is_terminated(&turn(2)));
    }

    #[tokio::test]
    async fn test_fail_all_rejection_carries_the_code() {
        let mut ledger = TurnLedger::new();
        let mut pending_sig = ledger.enqueue(turn(1));

        ledger.fail_all("SESSION_NOT_FOUND", "session killed");

        let started = pending_sig.started.try_recv().unwrap();
        assert_eq!(started.unwrap_err().code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_reject_front_fires_both_signals() {
        let mut ledger = TurnLedger::new();
        let mut first = ledger.enqueue(turn(1));
        let mut second = ledger.enqueue(turn(2));

        let rejected = ledger.reject_front(&HostError::ProtocolError {
            message: "completion result arrived before any notification".to_string(),
        });
        assert_eq!(rejected, Some(turn(1)));

        let started = first.started.try_recv().unwrap();
        assert_eq!(started.unwrap_err().code(), "PROTOCOL_ERROR");
        match first.settled.try_recv().unwrap() {
            TurnOutcome::Failed { code, .. } => assert_eq!(code, "PROTOCOL_ERROR"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(ledger.is_terminated(&turn(1)));

        // The next turn moves to the front untouched.
        assert!(second.started.try_recv().is_err());
        assert_eq!(ledger.start_next(), Some(turn(2)));
    }

    #[tokio::test]
    async fn test_abort_pending_removes_turn() {
        let mut ledger = TurnLedger::new();
        let mut signals = ledger.enqueue(turn(1));

        assert!(ledger.abort_pending(&turn(1), HostError::crash("prompt write failed")));
        assert_eq!(ledger.pending_len(), 0);
        assert!(signals.started.try_recv().unwrap().is_err());

        // Aborting again finds nothing
        assert!(!ledger.abort_pending(&turn(1), HostError::crash("again")));
    }

    #[test]
    fn test_message_ordinal_bumps() {
        let mut ledger = TurnLedger::new();
        let _signals = ledger.enqueue(turn(1));
        ledger.start_next();
        assert_eq!(ledger.message_ordinal(), 1);
        ledger.bump_message_ordinal();
        assert_eq!(ledger.message_ordinal(), 2);
    }
}
