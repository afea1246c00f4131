//! Fixed-size connection pool.
//!
//! Sessions outnumber agent processes: the pool owns a fixed number of
//! slots, each holding at most one live connection and at most one bound
//! session. Binding a session when every slot is taken evicts the least
//! recently active one. Eviction and kill both unbind the session but
//! deliberately leave the connection handle open, so the next binding
//! can skip process startup.
//!
//! Every live connection is drained by exactly one reader task. The
//! reader never holds a reference to the bound session directly; it goes
//! through a [`StreamSlot`] indirection, so rebinding a slot redirects
//! the event flow without restarting the reader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::BatchConfig;
use crate::client::{AgentClient, AgentClientFactory, CliType, NativeEvent, OpenRequest};
use crate::error::{codes, HostError};
use crate::events::SessionId;
use crate::session::SessionStream;

// ============================================================================
// Stream slot
// ============================================================================

/// Shared indirection between a slot and its reader task.
pub(crate) struct StreamSlot {
    current: parking_lot::RwLock<Option<Arc<SessionStream>>>,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            current: parking_lot::RwLock::new(None),
        }
    }

    pub(crate) fn current(&self) -> Option<Arc<SessionStream>> {
        self.current.read().clone()
    }

    fn bind(&self, stream: Arc<SessionStream>) {
        *self.current.write() = Some(stream);
    }

    fn clear(&self) {
        *self.current.write() = None;
    }
}

// ============================================================================
// Slots
// ============================================================================

struct Slot {
    client: Option<Arc<dyn AgentClient>>,
    reader: Option<JoinHandle<()>>,
    stream_slot: Arc<StreamSlot>,
    session: Option<SessionId>,
    project_dir: Option<PathBuf>,
    last_active: Instant,
}

impl Slot {
    fn new() -> Self {
        Self {
            client: None,
            reader: None,
            stream_slot: Arc::new(StreamSlot::new()),
            session: None,
            project_dir: None,
            last_active: Instant::now(),
        }
    }

    /// Whether the slot's existing handle can serve `request` without a
    /// process restart.
    fn handle_fits(&self, request: &OpenRequest) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_alive())
            && self.project_dir.as_deref() == Some(request.project_dir.as_path())
    }
}

/// Pool occupancy counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Total slots.
    pub slots: usize,
    /// Slots with a bound session.
    pub bound: usize,
    /// Slots with a live connection (bound or warm).
    pub live: usize,
}

// ============================================================================
// Pool
// ============================================================================

/// The pool of agent connections and their session bindings.
pub struct SessionPool {
    factory: Arc<dyn AgentClientFactory>,
    slots: Mutex<Vec<Slot>>,
    /// session id -> slot index
    sessions: DashMap<SessionId, usize>,
    batch_config: BatchConfig,
}

impl SessionPool {
    /// New pool with `size` slots, all cold.
    #[must_use]
    pub fn new(factory: Arc<dyn AgentClientFactory>, size: usize, batch_config: BatchConfig) -> Self {
        let size = size.max(1);
        Self {
            factory,
            slots: Mutex::new((0..size).map(|_| Slot::new()).collect()),
            sessions: DashMap::new(),
            batch_config,
        }
    }

    /// Provider protocol every connection in this pool speaks.
    #[must_use]
    pub fn cli_type(&self) -> CliType {
        self.factory.cli_type()
    }

    /// Pre-open connections in cold slots so the first bindings skip
    /// process startup. Failures are logged and skipped; warming is
    /// best-effort.
    pub async fn warm_up(&self, request: &OpenRequest) {
        let mut slots = self.slots.lock().await;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.client.is_some() {
                continue;
            }
            match self.open_into(slot, request).await {
                Ok(()) => debug!(index, "warmed pool slot"),
                Err(err) => {
                    warn!(index, %err, "failed to warm pool slot");
                    break;
                }
            }
        }
    }

    /// Bind `session_id` to a slot, starting or reusing a connection.
    ///
    /// Evicts the least recently active slot when none is free; the
    /// evicted session's open items and turns fail with an eviction
    /// crash, and the session stops resolving.
    pub async fn bind_session(
        &self,
        session_id: SessionId,
        request: &OpenRequest,
    ) -> Result<Arc<SessionStream>, HostError> {
        let mut slots = self.slots.lock().await;
        let index = self.pick_slot(&slots, request);

        // Unbind whatever the slot held before.
        if let Some(evicted) = slots[index].session.take() {
            info!(session_id = %evicted.0, "evicting least recently active session");
            self.sessions.remove(&evicted);
            if let Some(stream) = slots[index].stream_slot.current() {
                stream.fail(codes::PROCESS_CRASH, "evicted");
            }
            slots[index].stream_slot.clear();
        }

        let slot = &mut slots[index];
        if !slot.handle_fits(request) {
            self.open_into(slot, request).await.map_err(|err| {
                HostError::SessionCreateFailed {
                    message: "failed to open agent connection".to_string(),
                    source: Some(anyhow::Error::new(err)),
                }
            })?;
        }

        // The handle is up; point it at the session's conversation.
        let client = slot.client.clone().ok_or_else(|| HostError::SessionCreateFailed {
            message: "slot has no connection after open".to_string(),
            source: None,
        })?;
        client.start_session(request).await.map_err(|err| {
            HostError::SessionCreateFailed {
                message: "agent rejected session start".to_string(),
                source: Some(anyhow::Error::new(err)),
            }
        })?;

        let stream = Arc::new(SessionStream::new(
            session_id.clone(),
            self.factory.cli_type(),
            self.batch_config.clone(),
        ));
        slot.stream_slot.bind(Arc::clone(&stream));
        slot.session = Some(session_id.clone());
        slot.last_active = Instant::now();
        self.sessions.insert(session_id, index);
        Ok(stream)
    }

    /// Resolve a bound session to its stream and connection, touching
    /// its activity clock.
    pub async fn lookup(
        &self,
        session_id: &SessionId,
    ) -> Result<(Arc<SessionStream>, Arc<dyn AgentClient>), HostError> {
        let index = self
            .sessions
            .get(session_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| HostError::not_found(session_id.0.clone()))?;
        let mut slots = self.slots.lock().await;
        let slot = &mut slots[index];
        if slot.session.as_ref() != Some(session_id) {
            // The mapping raced an eviction.
            return Err(HostError::not_found(session_id.0.clone()));
        }
        slot.last_active = Instant::now();
        let stream = slot
            .stream_slot
            .current()
            .ok_or_else(|| HostError::not_found(session_id.0.clone()))?;
        let client = slot
            .client
            .clone()
            .ok_or_else(|| HostError::crash("session has no live connection"))?;
        Ok((stream, client))
    }

    /// Whether the session is bound and its process is running.
    pub async fn is_alive(&self, session_id: &SessionId) -> bool {
        match self.lookup(session_id).await {
            Ok((_, client)) => client.is_alive(),
            Err(_) => false,
        }
    }

    /// Unbind a session without a word to its subscribers. The
    /// connection handle stays warm for the next binding. Unbinding a
    /// session that is already gone is a no-op.
    pub async fn unbind_silent(&self, session_id: &SessionId) {
        let Some((_, index)) = self.sessions.remove(session_id) else {
            debug!(session_id = %session_id.0, "unbind of unknown session ignored");
            return;
        };
        let mut slots = self.slots.lock().await;
        let slot = &mut slots[index];
        if slot.session.as_ref() == Some(session_id) {
            if let Some(stream) = slot.stream_slot.current() {
                stream.silence(codes::SESSION_NOT_FOUND, "session killed");
            }
            slot.stream_slot.clear();
            slot.session = None;
        }
    }

    /// Occupancy counters.
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        PoolStats {
            slots: slots.len(),
            bound: slots.iter().filter(|s| s.session.is_some()).count(),
            live: slots
                .iter()
                .filter(|s| s.client.as_ref().is_some_and(|c| c.is_alive()))
                .count(),
        }
    }

    /// Close every connection and stop every reader.
    pub async fn shutdown(&self) {
        let mut slots = self.slots.lock().await;
        self.sessions.clear();
        for slot in slots.iter_mut() {
            if let Some(stream) = slot.stream_slot.current() {
                stream.silence(codes::SESSION_NOT_FOUND, "host shutting down");
            }
            slot.stream_slot.clear();
            slot.session = None;
            if let Some(client) = slot.client.take() {
                client.close().await;
            }
            if let Some(reader) = slot.reader.take() {
                reader.abort();
            }
        }
    }

    /// Slot to bind into: a free one if any, preferring a warm handle
    /// that already fits; otherwise the least recently active.
    fn pick_slot(&self, slots: &[Slot], request: &OpenRequest) -> usize {
        let free = || slots.iter().enumerate().filter(|(_, s)| s.session.is_none());
        if let Some((index, _)) = free().find(|(_, s)| s.handle_fits(request)) {
            return index;
        }
        if let Some((index, _)) = free().next() {
            return index;
        }
        slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_active)
            .map_or(0, |(index, _)| index)
    }

    /// Replace a slot's connection with a freshly opened one.
    async fn open_into(&self, slot: &mut Slot, request: &OpenRequest) -> Result<(), HostError> {
        if let Some(old) = slot.client.take() {
            old.close().await;
        }
        if let Some(reader) = slot.reader.take() {
            reader.abort();
        }
        let connection = self.factory.open(request).await?;
        let client = connection.client;
        slot.reader = Some(tokio::spawn(run_reader(
            Arc::clone(&slot.stream_slot),
            Arc::clone(&client),
            connection.events,
        )));
        slot.client = Some(client);
        slot.project_dir = Some(request.project_dir.clone());
        Ok(())
    }
}

// ============================================================================
// Reader task
// ============================================================================

/// Drain one connection's native events into whatever session is
/// currently bound to its slot, waking early for idle flushes. Exits
/// when the event channel closes; an unexpected process death fails the
/// bound stream.
async fn run_reader(
    stream_slot: Arc<StreamSlot>,
    client: Arc<dyn AgentClient>,
    mut events: mpsc::Receiver<NativeEvent>,
) {
    loop {
        let deadline = stream_slot.current().and_then(|s| s.next_deadline());
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => {
                    if let Some(stream) = stream_slot.current() {
                        stream.handle_native(event);
                    }
                }
                None => break,
            },
            () = idle_sleep(deadline) => {
                if let Some(stream) = stream_slot.current() {
                    stream.flush_idle();
                }
            }
        }
    }
    // Intentional teardown clears the slot before dropping the channel,
    // so a stream still bound here saw its connection end unexpectedly.
    if let Some(stream) = stream_slot.current() {
        warn!(
            session_id = %stream.session_id().0,
            alive = client.is_alive(),
            "native event stream ended unexpectedly"
        );
        stream.fail(codes::PROCESS_CRASH, "agent process exited unexpectedly");
    }
}

/// Sleep until the idle-flush deadline, or forever if nothing is dirty.
async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => futures::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CliType, Connection};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockClient {
        alive: AtomicBool,
        // Held so the reader's channel stays open for the client's life.
        sender: parking_lot::Mutex<Option<mpsc::Sender<NativeEvent>>>,
    }

    #[async_trait]
    impl AgentClient for MockClient {
        fn cli_type(&self) -> CliType {
            CliType::Pipe
        }

        async fn start_session(&self, _request: &OpenRequest) -> Result<(), HostError> {
            Ok(())
        }

        async fn prompt(&self, _content: &str) -> Result<(), HostError> {
            Ok(())
        }

        async fn interrupt(&self) -> Result<(), HostError> {
            Ok(())
        }

        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.sender.lock().take();
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    impl MockClient {
        /// Ends the native event stream without flipping `alive`.
        fn drop_sender(&self) {
            self.sender.lock().take();
        }
    }

    struct MockFactory {
        opens: AtomicUsize,
        last: parking_lot::Mutex<Option<Arc<MockClient>>>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                last: parking_lot::Mutex::new(None),
            }
        }

        fn last_client(&self) -> Arc<MockClient> {
            Arc::clone(self.last.lock().as_ref().unwrap())
        }
    }

    #[async_trait]
    impl AgentClientFactory for MockFactory {
        fn cli_type(&self) -> CliType {
            CliType::Pipe
        }

        async fn open(&self, _request: &OpenRequest) -> Result<Connection, HostError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let client = Arc::new(MockClient {
                alive: AtomicBool::new(true),
                sender: parking_lot::Mutex::new(Some(tx)),
            });
            *self.last.lock() = Some(Arc::clone(&client));
            Ok(Connection {
                client,
                events: rx,
            })
        }
    }

    fn pool(size: usize) -> (Arc<MockFactory>, SessionPool) {
        let factory = Arc::new(MockFactory::new());
        let pool = SessionPool::new(
            Arc::clone(&factory) as Arc<dyn AgentClientFactory>,
            size,
            BatchConfig::default(),
        );
        (factory, pool)
    }

    fn sid(s: &str) -> SessionId {
        SessionId(s.to_string())
    }

    #[tokio::test]
    async fn binding_beyond_capacity_evicts_the_lru_session() {
        let (factory, pool) = pool(2);
        let request = OpenRequest::new("/tmp/project");

        pool.bind_session(sid("s1"), &request).await.unwrap();
        pool.bind_session(sid("s2"), &request).await.unwrap();
        // Touch s1 so s2 becomes the LRU.
        pool.lookup(&sid("s1")).await.unwrap();

        pool.bind_session(sid("s3"), &request).await.unwrap();

        assert!(pool.lookup(&sid("s1")).await.is_ok());
        assert!(matches!(
            pool.lookup(&sid("s2")).await,
            Err(HostError::SessionNotFound { .. })
        ));
        // The evicted slot's handle was warm and was reused as-is.
        assert_eq!(factory.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eviction_fails_the_evicted_stream() {
        let (_factory, pool) = pool(1);
        let request = OpenRequest::new("/tmp/project");

        let stream = pool.bind_session(sid("s1"), &request).await.unwrap();
        let mut turns = stream.subscribe_turns();
        stream.enqueue_turn(crate::events::TurnId("turn-1".to_string()));
        stream.handle_native(NativeEvent::Pipe(crate::client::PipeEvent::MessageStart {
            model_id: "m".to_string(),
        }));

        pool.bind_session(sid("s2"), &request).await.unwrap();

        turns.recv().await.unwrap(); // started
        let terminal = turns.recv().await.unwrap();
        match terminal.kind {
            crate::upsert::TurnEventKind::Error { code, message } => {
                assert_eq!(code, codes::PROCESS_CRASH);
                assert_eq!(message, "evicted");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_keeps_the_handle_warm() {
        let (factory, pool) = pool(2);
        let request = OpenRequest::new("/tmp/project");

        pool.bind_session(sid("s1"), &request).await.unwrap();
        pool.unbind_silent(&sid("s1")).await;
        // A repeated unbind of the same session is a quiet no-op.
        pool.unbind_silent(&sid("s1")).await;
        assert!(matches!(
            pool.lookup(&sid("s1")).await,
            Err(HostError::SessionNotFound { .. })
        ));

        pool.bind_session(sid("s2"), &request).await.unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_end_while_alive_fails_inflight_turns() {
        let (factory, pool) = pool(1);
        let request = OpenRequest::new("/tmp/project");

        let stream = pool.bind_session(sid("s1"), &request).await.unwrap();
        let mut turns = stream.subscribe_turns();
        let signals = stream.enqueue_turn(crate::events::TurnId("turn-1".to_string()));
        stream.handle_native(NativeEvent::Pipe(crate::client::PipeEvent::MessageStart {
            model_id: "m".to_string(),
        }));
        signals.started.await.unwrap().unwrap();

        // The process still claims to be alive when its stream ends.
        let client = factory.last_client();
        client.drop_sender();
        assert!(client.is_alive());

        let outcome = signals.settled.await.unwrap();
        match outcome {
            crate::correlate::TurnOutcome::Failed { code, .. } => {
                assert_eq!(code, codes::PROCESS_CRASH);
            }
            other => panic!("unexpected {other:?}"),
        }
        turns.recv().await.unwrap(); // started
        let terminal = turns.recv().await.unwrap();
        match terminal.kind {
            crate::upsert::TurnEventKind::Error { code, message } => {
                assert_eq!(code, codes::PROCESS_CRASH);
                assert_eq!(message, "agent process exited unexpectedly");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn warm_up_fills_cold_slots() {
        let (factory, pool) = pool(3);
        let request = OpenRequest::new("/tmp/project");

        pool.warm_up(&request).await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
        let stats = pool.stats().await;
        assert_eq!(stats.live, 3);
        assert_eq!(stats.bound, 0);

        // Bindings reuse the warm handles.
        pool.bind_session(sid("s1"), &request).await.unwrap();
        assert_eq!(factory.opens.load(Ordering::SeqCst), 3);
    }
}
