//! Switchboard Core - Conversation Streaming over Pooled Agent CLIs
//!
//! This crate hosts AI coding-agent CLI processes and turns their
//! protocol-specific streams into one canonical conversation model. It is
//! completely headless: a web backend, desktop shell or test harness sits on
//! top of [`SessionHost`] and consumes upserts and turn events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Callers                              │
//! │   create/load session · send message · cancel · kill         │
//! │              on_upsert / on_turn subscriptions               │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │
//! ┌──────────────────────────────┴───────────────────────────────┐
//! │                        SessionHost                           │
//! │  ┌─────────────┐   per session   ┌─────────────────────────┐ │
//! │  │ SessionPool │ ─────────────▶  │      SessionStream      │ │
//! │  │ fixed slots │                 │ Translator → TurnLedger │ │
//! │  │ LRU evict   │                 │      → BatchProcessor   │ │
//! │  └──────┬──────┘                 └─────────────────────────┘ │
//! └─────────┼────────────────────────────────────────────────────┘
//!           │ one reader task per connection
//! ┌─────────┴────────────────────────────────────────────────────┐
//! │               Agent CLI processes (pipe / acp)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SessionHost`]: the public API; everything else hangs off it
//! - [`AgentClient`] / [`AgentClientFactory`]: the seam a provider
//!   integration implements
//! - [`CanonicalEvent`]: the protocol-neutral event model
//! - [`UpsertObject`] / [`TurnEvent`]: what subscribers receive
//! - [`HostError`]: the error taxonomy, with stable codes
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_core::{HostConfig, SessionHost, SessionOptions};
//! use std::sync::Arc;
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let factory = Arc::new(MyCliFactory::new());
//!     let host = SessionHost::new(factory, HostConfig::from_env()).await;
//!
//!     let session = host.create_session(SessionOptions {
//!         project_dir: Some("/work/project".into()),
//!         ..SessionOptions::default()
//!     }).await?;
//!
//!     let mut upserts = host.on_upsert(&session.session_id).await?;
//!     let turn = host.send_message(&session.session_id, "add a README").await?;
//!
//!     while let Some(upsert) = upserts.next().await {
//!         // Persist or render the snapshot
//!     }
//!     let outcome = turn.settled().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`client`]: agent connection traits and native event types
//! - [`events`]: the canonical event model (items, turns, ids)
//! - [`translate`]: per-protocol stream translators
//! - [`correlate`]: turn queueing and start/settle signals
//! - [`batch`]: gradient-paced upsert batching
//! - [`session`]: per-session stream state
//! - [`pool`]: fixed-size connection pool with LRU eviction
//! - [`host`]: the public [`SessionHost`] surface
//! - [`error`]: the error taxonomy
//!
//! # No Provider Dependencies
//!
//! This crate never talks to a model provider itself. It launches and
//! supervises whatever CLI the injected factory opens, and everything
//! provider-specific stays behind the [`AgentClient`] trait.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod client;
pub mod correlate;
pub mod error;
pub mod events;
pub mod host;
pub mod pool;
pub mod session;
pub mod translate;
pub mod upsert;

// Re-exports for convenience
pub use batch::{BatchConfig, BatchOutput, BatchProcessor};
pub use client::{
    AcpEvent, AcpStopReason, AcpUpdate, AgentClient, AgentClientFactory, CliType, Connection,
    NativeEvent, OpenRequest, PipeBlock, PipeEvent,
};
pub use correlate::{TurnLedger, TurnOutcome, TurnSignals};
pub use error::HostError;
pub use events::{
    CanonicalEvent, CanonicalKind, FinalItem, ItemEvent, ItemKind, SessionId, TurnId, TurnSignal,
    TurnStatus, Usage,
};
pub use host::{
    CounterTurnIds, HostConfig, SessionDescriptor, SessionHost, SessionOptions, TurnHandle,
    TurnIdSource,
};
pub use pool::{PoolStats, SessionPool};
pub use session::SessionStream;
pub use translate::{AcpTranslator, PipeTranslator, Translator};
pub use upsert::{TurnEvent, TurnEventKind, UpsertObject, UpsertPayload, UpsertStatus};
