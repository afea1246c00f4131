//! Protocol translators.
//!
//! Each agent CLI speaks its own streaming dialect. A translator is a
//! synchronous state machine that folds one native event at a time into
//! zero or more [`CanonicalEvent`]s, consulting the session's
//! [`TurnLedger`] to attribute events to the correct turn. Keeping the
//! translators synchronous keeps them trivially unit-testable; all async
//! plumbing lives in the session reader task.
//!
//! # Design Philosophy
//!
//! - **One translator per protocol.** [`PipeTranslator`] handles the
//!   message/content-block dialect, [`AcpTranslator`] the notification
//!   dialect. Both produce the same canonical model.
//! - **Malformed input degrades, never panics.** An event the protocol
//!   state cannot account for is logged and swallowed rather than
//!   tearing down the stream.
//! - **Deterministic item identity.** Item ids are derived purely from
//!   turn id, message ordinal and block index, so replaying the same
//!   native stream yields the same ids.

mod acp;
mod pipe;

pub use acp::AcpTranslator;
pub use pipe::PipeTranslator;

use crate::client::{CliType, NativeEvent};
use crate::correlate::TurnLedger;
use crate::events::CanonicalEvent;

// ============================================================================
// Dispatch
// ============================================================================

/// Protocol-selected translator for one session stream.
pub enum Translator {
    /// Message/content-block streaming dialect.
    Pipe(PipeTranslator),
    /// Notification streaming dialect.
    Acp(AcpTranslator),
}

impl Translator {
    /// Create the translator matching a CLI protocol.
    #[must_use]
    pub fn for_cli(cli_type: CliType) -> Self {
        match cli_type {
            CliType::Pipe => Self::Pipe(PipeTranslator::new()),
            CliType::Acp => Self::Acp(AcpTranslator::new()),
        }
    }

    /// Fold one native event into canonical events.
    ///
    /// A native event from the wrong protocol is dropped with a warning;
    /// it indicates a wiring bug in the client, not a recoverable state.
    pub fn translate(
        &mut self,
        ledger: &mut TurnLedger,
        event: NativeEvent,
    ) -> Vec<CanonicalEvent> {
        match (self, event) {
            (Self::Pipe(t), NativeEvent::Pipe(ev)) => t.translate(ledger, ev),
            (Self::Acp(t), NativeEvent::Acp(ev)) => t.translate(ledger, ev),
            (Self::Pipe(_), NativeEvent::Acp(_)) => {
                tracing::warn!("dropping notification-dialect event on a pipe stream");
                Vec::new()
            }
            (Self::Acp(_), NativeEvent::Pipe(_)) => {
                tracing::warn!("dropping pipe-dialect event on a notification stream");
                Vec::new()
            }
        }
    }
}
