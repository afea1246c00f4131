//! End-to-end tests for the session host
//!
//! These drive the full stack (host, pool, reader task, translator, batch
//! processor) against scripted agent clients. Tests cover:
//! - A complete prompt/response round trip over the pipe protocol
//! - The notification protocol over the same host surface
//! - Pool eviction making the evicted session unresolvable
//! - Kill being silent and keeping the connection warm
//! - Interrupting an in-flight turn

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_test::assert_ok;

use switchboard_core::{
    AcpEvent, AcpStopReason, AcpUpdate, AgentClient, AgentClientFactory, CliType, Connection,
    HostConfig, HostError, NativeEvent, OpenRequest, PipeBlock, PipeEvent, SessionHost,
    SessionOptions, TurnEventKind, TurnOutcome, TurnStatus, UpsertPayload, UpsertStatus,
};

// =============================================================================
// Scripted agent client
// =============================================================================

/// Native events one connection will play back: a batch per `prompt`
/// call and a batch per `interrupt` call.
#[derive(Clone, Default)]
struct Script {
    prompts: VecDeque<Vec<NativeEvent>>,
    interrupts: VecDeque<Vec<NativeEvent>>,
}

impl Script {
    fn on_prompt(mut self, events: Vec<NativeEvent>) -> Self {
        self.prompts.push_back(events);
        self
    }

    fn on_interrupt(mut self, events: Vec<NativeEvent>) -> Self {
        self.interrupts.push_back(events);
        self
    }
}

struct ScriptedClient {
    cli_type: CliType,
    alive: AtomicBool,
    events_tx: mpsc::Sender<NativeEvent>,
    script: Mutex<Script>,
}

impl ScriptedClient {
    async fn play(&self, events: Vec<NativeEvent>) {
        for event in events {
            let _ = self.events_tx.send(event).await;
        }
    }
}

#[async_trait]
impl AgentClient for ScriptedClient {
    fn cli_type(&self) -> CliType {
        self.cli_type
    }

    async fn start_session(&self, _request: &OpenRequest) -> Result<(), HostError> {
        Ok(())
    }

    async fn prompt(&self, _content: &str) -> Result<(), HostError> {
        let batch = self.script.lock().prompts.pop_front().unwrap_or_default();
        self.play(batch).await;
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), HostError> {
        let batch = self.script.lock().interrupts.pop_front().unwrap_or_default();
        self.play(batch).await;
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct ScriptedFactory {
    cli_type: CliType,
    scripts: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
}

impl ScriptedFactory {
    fn new(cli_type: CliType, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            cli_type,
            scripts: Mutex::new(scripts.into_iter().collect()),
            opens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AgentClientFactory for ScriptedFactory {
    fn cli_type(&self) -> CliType {
        self.cli_type
    }

    async fn open(&self, _request: &OpenRequest) -> Result<Connection, HostError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(64);
        let client = Arc::new(ScriptedClient {
            cli_type: self.cli_type,
            alive: AtomicBool::new(true),
            events_tx: tx,
            script: Mutex::new(script),
        });
        Ok(Connection {
            client,
            events: rx,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("switchboard_core=debug")
        .with_test_writer()
        .try_init();
}

fn pipe(ev: PipeEvent) -> NativeEvent {
    NativeEvent::Pipe(ev)
}

fn acp(ev: AcpEvent) -> NativeEvent {
    NativeEvent::Acp(ev)
}

/// A complete pipe-protocol assistant reply with one text block.
fn pipe_reply(text: &str) -> Vec<NativeEvent> {
    vec![
        pipe(PipeEvent::MessageStart {
            model_id: "model-x".to_string(),
        }),
        pipe(PipeEvent::BlockStart {
            index: 0,
            block: PipeBlock::Text,
        }),
        pipe(PipeEvent::BlockDelta {
            index: 0,
            text: text.to_string(),
        }),
        pipe(PipeEvent::BlockStop { index: 0 }),
        pipe(PipeEvent::MessageDelta {
            stop_reason: Some("end_turn".to_string()),
            usage: None,
        }),
        pipe(PipeEvent::MessageStop),
    ]
}

async fn host_with(factory: Arc<ScriptedFactory>, pool_size: usize) -> (SessionHost, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = HostConfig {
        pool_size,
        default_project_dir: Some(dir.path().to_path_buf()),
        ..HostConfig::default()
    };
    (SessionHost::new(factory, config).await, dir)
}

// =============================================================================
// Test 1: pipe round trip
// =============================================================================

#[tokio::test]
async fn test_pipe_round_trip() {
    init_tracing();
    let factory = ScriptedFactory::new(
        CliType::Pipe,
        vec![Script::default().on_prompt(pipe_reply("Hi there"))],
    );
    let (host, _dir) = host_with(factory, 1).await;

    let descriptor = host
        .create_session(SessionOptions::default())
        .await
        .expect("create session");
    assert_eq!(descriptor.cli_type, CliType::Pipe);
    let session = descriptor.session_id;
    assert!(host.is_alive(&session).await);

    let mut upserts = host.on_upsert(&session).await.expect("subscribe upserts");
    let mut turns = host.on_turn(&session).await.expect("subscribe turns");

    let handle = host.send_message(&session, "hello").await.expect("send");
    assert_eq!(handle.turn_id.0, "turn_1");

    let outcome = handle.settled().await.expect("settled");
    assert_eq!(outcome, TurnOutcome::Done(TurnStatus::Completed));

    let complete = upserts.next().await.expect("complete upsert");
    assert_eq!(complete.status, UpsertStatus::Complete);
    assert_eq!(complete.item_id, "turn_1:1:0");
    assert_eq!(complete.session_id, session);
    match complete.payload {
        UpsertPayload::Message { content, .. } => assert_eq!(content, "Hi there"),
        other => panic!("unexpected payload {other:?}"),
    }

    let started = turns.next().await.expect("started");
    assert!(matches!(started.kind, TurnEventKind::Started { .. }));
    let terminal = turns.next().await.expect("terminal");
    match terminal.kind {
        TurnEventKind::Completed { status, finish_reason, .. } => {
            assert_eq!(status, TurnStatus::Completed);
            assert_eq!(finish_reason.as_deref(), Some("end_turn"));
        }
        other => panic!("unexpected terminal {other:?}"),
    }
}

// =============================================================================
// Test 2: notification protocol over the same surface
// =============================================================================

#[tokio::test]
async fn test_acp_round_trip() {
    init_tracing();
    let factory = ScriptedFactory::new(
        CliType::Acp,
        vec![Script::default().on_prompt(vec![
            acp(AcpEvent::Update(AcpUpdate::ThoughtChunk {
                text: "planning".to_string(),
            })),
            acp(AcpEvent::Update(AcpUpdate::MessageChunk {
                text: "Hello from acp".to_string(),
            })),
            acp(AcpEvent::PromptDone {
                stop_reason: AcpStopReason::EndTurn,
                usage: None,
            }),
        ])],
    );
    let (host, _dir) = host_with(factory, 1).await;

    let session = host
        .create_session(SessionOptions::default())
        .await
        .expect("create session")
        .session_id;
    let mut upserts = host.on_upsert(&session).await.expect("subscribe");

    let handle = host.send_message(&session, "hi").await.expect("send");
    let outcome = handle.settled().await.expect("settled");
    assert_eq!(outcome, TurnOutcome::Done(TurnStatus::Completed));

    // Completion closed both items: the thought, then the message.
    let thought = upserts.next().await.expect("thought upsert");
    assert_eq!(thought.item_id, "turn_1:1:0");
    assert!(matches!(thought.payload, UpsertPayload::Thinking { .. }));

    let message = upserts.next().await.expect("message upsert");
    assert_eq!(message.item_id, "turn_1:1:1");
    match message.payload {
        UpsertPayload::Message { content, .. } => assert_eq!(content, "Hello from acp"),
        other => panic!("unexpected payload {other:?}"),
    }
}

// =============================================================================
// Test 3: eviction
// =============================================================================

#[tokio::test]
async fn test_eviction_unbinds_lru_session() {
    init_tracing();
    let factory = ScriptedFactory::new(CliType::Pipe, Vec::new());
    let (host, _dir) = host_with(Arc::clone(&factory), 2).await;

    let s1 = host.create_session(SessionOptions::default()).await.expect("s1").session_id;
    let s2 = host.create_session(SessionOptions::default()).await.expect("s2").session_id;
    // Touch s1 so s2 is the least recently active.
    assert!(host.is_alive(&s1).await);

    let s3 = host.create_session(SessionOptions::default()).await.expect("s3").session_id;

    assert!(host.is_alive(&s1).await);
    assert!(host.is_alive(&s3).await);
    assert!(!host.is_alive(&s2).await);
    let err = host
        .send_message(&s2, "hello?")
        .await
        .map(|handle| handle.turn_id)
        .expect_err("evicted session should not resolve");
    assert!(matches!(err, HostError::SessionNotFound { .. }));
    assert_eq!(err.code(), "SESSION_NOT_FOUND");

    // Two processes total; the third binding reused the evicted handle.
    assert_eq!(factory.opens.load(Ordering::SeqCst), 2);

    let stats = host.pool_stats().await;
    assert_eq!(stats.slots, 2);
    assert_eq!(stats.bound, 2);
}

// =============================================================================
// Test 4: kill is silent
// =============================================================================

#[tokio::test]
async fn test_kill_is_silent_and_keeps_handle_warm() {
    init_tracing();
    let factory = ScriptedFactory::new(CliType::Pipe, Vec::new());
    let (host, _dir) = host_with(Arc::clone(&factory), 2).await;

    let session = host
        .create_session(SessionOptions::default())
        .await
        .expect("create")
        .session_id;
    let mut upserts = host.on_upsert(&session).await.expect("subscribe");
    let mut turns = host.on_turn(&session).await.expect("subscribe");

    host.kill_session(&session).await;
    // Killing again is a no-op, not an error.
    host.kill_session(&session).await;

    assert!(!host.is_alive(&session).await);
    assert!(matches!(
        host.on_upsert(&session).await,
        Err(HostError::SessionNotFound { .. })
    ));
    // Subscribers were disconnected without receiving anything.
    assert!(upserts.next().await.is_none());
    assert!(turns.next().await.is_none());

    // The next session reuses the warm connection.
    host.create_session(SessionOptions::default()).await.expect("recreate");
    assert_eq!(factory.opens.load(Ordering::SeqCst), 1);

    host.shutdown().await;
}

// =============================================================================
// Test 5: interrupt
// =============================================================================

#[tokio::test]
async fn test_cancel_turn_interrupts_active_turn() {
    init_tracing();
    let factory = ScriptedFactory::new(
        CliType::Pipe,
        vec![Script::default()
            // The prompt starts a reply but never finishes it.
            .on_prompt(vec![
                pipe(PipeEvent::MessageStart {
                    model_id: "model-x".to_string(),
                }),
                pipe(PipeEvent::BlockStart {
                    index: 0,
                    block: PipeBlock::Text,
                }),
                pipe(PipeEvent::BlockDelta {
                    index: 0,
                    text: "half a tho".to_string(),
                }),
            ])
            // The interrupt makes the agent wind the message down.
            .on_interrupt(vec![
                pipe(PipeEvent::MessageDelta {
                    stop_reason: Some("aborted".to_string()),
                    usage: None,
                }),
                pipe(PipeEvent::MessageStop),
            ])],
    );
    let (host, _dir) = host_with(factory, 1).await;

    let session = host
        .create_session(SessionOptions::default())
        .await
        .expect("create")
        .session_id;
    let handle = host.send_message(&session, "write an essay").await.expect("send");

    host.cancel_turn(&session).await.expect("cancel");

    let outcome = handle.settled().await.expect("settled");
    assert_eq!(outcome, TurnOutcome::Done(TurnStatus::Cancelled));
}

// =============================================================================
// Test 6: queued turns run in order
// =============================================================================

#[tokio::test]
async fn test_turns_queue_fifo() {
    init_tracing();
    let factory = ScriptedFactory::new(
        CliType::Pipe,
        vec![Script::default()
            .on_prompt(pipe_reply("first answer"))
            .on_prompt(pipe_reply("second answer"))],
    );
    let (host, _dir) = host_with(factory, 1).await;

    let session = host
        .create_session(SessionOptions::default())
        .await
        .expect("create")
        .session_id;

    let first = assert_ok!(host.send_message(&session, "one").await);
    let second = assert_ok!(host.send_message(&session, "two").await);
    assert_eq!(first.turn_id.0, "turn_1");
    assert_eq!(second.turn_id.0, "turn_2");

    assert_eq!(
        first.settled().await.expect("first settled"),
        TurnOutcome::Done(TurnStatus::Completed)
    );
    assert_eq!(
        second.settled().await.expect("second settled"),
        TurnOutcome::Done(TurnStatus::Completed)
    );
}
