//! The session host.
//!
//! [`SessionHost`] is the public face of the crate: create or load
//! sessions, send messages, cancel or kill, and subscribe to the upsert
//! and turn streams. Everything underneath (pooling, translation,
//! batching, correlation) is an implementation detail.
//!
//! # Design Philosophy
//!
//! - **Send returns at turn start, not turn end.** `send_message`
//!   resolves once the agent acknowledges the turn, handing back a
//!   [`TurnHandle`] the caller can await for settlement separately.
//! - **Subscriptions are independent.** Each `on_upsert`/`on_turn` call
//!   gets its own unbounded stream; a slow consumer never stalls the
//!   session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::batch::BatchConfig;
use crate::client::{AgentClientFactory, CliType, OpenRequest};
use crate::correlate::TurnOutcome;
use crate::error::HostError;
use crate::events::{SessionId, TurnId};
use crate::pool::{PoolStats, SessionPool};
use crate::upsert::{TurnEvent, UpsertObject};

// ============================================================================
// Configuration
// ============================================================================

/// Host-level configuration.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Number of pool slots (agent processes the host will keep at once).
    pub pool_size: usize,
    /// Project directory used when a session does not name one.
    pub default_project_dir: Option<PathBuf>,
    /// Pre-open connections at startup so first sessions bind fast.
    pub warm_start: bool,
    /// Upsert batching knobs.
    pub batch: BatchConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            default_project_dir: None,
            warm_start: false,
            batch: BatchConfig::default(),
        }
    }
}

impl HostConfig {
    /// Read overrides from the environment, falling back to defaults.
    ///
    /// - `SWITCHBOARD_POOL_SIZE`: number of pool slots
    /// - `SWITCHBOARD_PROJECT_DIR`: default project directory
    /// - `SWITCHBOARD_WARM_START`: `1` or `true` to pre-open connections
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            batch: BatchConfig::from_env(),
            ..Self::default()
        };
        if let Ok(raw) = std::env::var("SWITCHBOARD_POOL_SIZE") {
            if let Ok(size) = raw.parse::<usize>() {
                config.pool_size = size.max(1);
            }
        }
        if let Ok(dir) = std::env::var("SWITCHBOARD_PROJECT_DIR") {
            if !dir.is_empty() {
                config.default_project_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(raw) = std::env::var("SWITCHBOARD_WARM_START") {
            config.warm_start = raw == "1" || raw.eq_ignore_ascii_case("true");
        }
        config
    }
}

// ============================================================================
// Turn ids
// ============================================================================

/// Source of turn identifiers.
///
/// Turn ids are host-assigned at submission time so item ids stay stable
/// across protocols and replays; callers with their own id scheme inject
/// it here.
pub trait TurnIdSource: Send + Sync {
    /// The id for the next submitted turn.
    fn next_turn_id(&self) -> TurnId;
}

/// Default turn id source: `turn_1`, `turn_2`, ...
pub struct CounterTurnIds {
    prefix: String,
    counter: AtomicU64,
}

impl CounterTurnIds {
    /// Counter source with a custom prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for CounterTurnIds {
    fn default() -> Self {
        Self::new("turn")
    }
}

impl TurnIdSource for CounterTurnIds {
    fn next_turn_id(&self) -> TurnId {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        TurnId(format!("{}_{n}", self.prefix))
    }
}

// ============================================================================
// Session options / turn handle
// ============================================================================

/// Per-session options for create and load.
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    /// Project directory; falls back to the host default.
    pub project_dir: Option<PathBuf>,
    /// File the session's view is anchored to, if any.
    pub view_file_path: Option<PathBuf>,
    /// Provider-specific options, passed through unvalidated.
    pub provider_options: Option<serde_json::Value>,
}

/// Identity of a bound session, as handed back by create and load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// The session id.
    pub session_id: SessionId,
    /// Which provider protocol the session speaks.
    pub cli_type: CliType,
}

/// Handle to a turn that has started.
///
/// Returned by [`SessionHost::send_message`] once the agent acknowledged
/// the turn. Await [`TurnHandle::settled`] for the terminal outcome.
pub struct TurnHandle {
    /// The id assigned to this turn.
    pub turn_id: TurnId,
    settled: tokio::sync::oneshot::Receiver<TurnOutcome>,
}

impl TurnHandle {
    /// Wait for the turn's terminal outcome.
    pub async fn settled(self) -> Result<TurnOutcome, HostError> {
        self.settled
            .await
            .map_err(|_| HostError::crash("turn abandoned before settling"))
    }
}

// ============================================================================
// Host
// ============================================================================

/// Hosts agent sessions over a pooled set of CLI processes.
pub struct SessionHost {
    pool: SessionPool,
    config: HostConfig,
    turn_ids: Arc<dyn TurnIdSource>,
}

impl SessionHost {
    /// New host over a client factory, with the default turn id source.
    pub async fn new(factory: Arc<dyn AgentClientFactory>, config: HostConfig) -> Self {
        Self::with_turn_ids(factory, config, Arc::new(CounterTurnIds::default())).await
    }

    /// New host with a caller-injected turn id source.
    pub async fn with_turn_ids(
        factory: Arc<dyn AgentClientFactory>,
        config: HostConfig,
        turn_ids: Arc<dyn TurnIdSource>,
    ) -> Self {
        let pool = SessionPool::new(Arc::clone(&factory), config.pool_size, config.batch.clone());
        let host = Self {
            pool,
            config,
            turn_ids,
        };
        if host.config.warm_start {
            if let Some(dir) = host.config.default_project_dir.clone() {
                info!("warming connection pool");
                host.pool.warm_up(&OpenRequest::new(dir)).await;
            }
        }
        host
    }

    /// Create a fresh session, binding it to a pool slot.
    pub async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<SessionDescriptor, HostError> {
        let request = self.open_request(&options, None)?;
        let session_id = SessionId::generate();
        debug!(session_id = %session_id.0, "creating session");
        self.pool.bind_session(session_id.clone(), &request).await?;
        Ok(SessionDescriptor {
            session_id,
            cli_type: self.pool.cli_type(),
        })
    }

    /// Load a session by id.
    ///
    /// A still-bound live session is returned as-is; otherwise the
    /// provider conversation is resumed into a fresh binding.
    pub async fn load_session(
        &self,
        session_id: SessionId,
        options: SessionOptions,
    ) -> Result<SessionDescriptor, HostError> {
        if !self.pool.is_alive(&session_id).await {
            let request = self.open_request(&options, Some(session_id.clone()))?;
            debug!(session_id = %session_id.0, "resuming session");
            self.pool.bind_session(session_id.clone(), &request).await?;
        }
        Ok(SessionDescriptor {
            session_id,
            cli_type: self.pool.cli_type(),
        })
    }

    /// Submit user content as a new turn.
    ///
    /// Queues behind whatever turns are already outstanding and resolves
    /// once the agent acknowledges this one.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<TurnHandle, HostError> {
        let (stream, client) = self.pool.lookup(session_id).await?;
        if !client.is_alive() {
            return Err(HostError::crash("agent process is not running"));
        }

        let turn_id = self.turn_ids.next_turn_id();
        let signals = stream.enqueue_turn(turn_id.clone());

        if let Err(err) = client.prompt(content).await {
            stream.abort_pending(&turn_id, err.clone());
            return Err(err);
        }

        match signals.started.await {
            Ok(Ok(())) => Ok(TurnHandle {
                turn_id,
                settled: signals.settled,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HostError::crash("session torn down before the turn started")),
        }
    }

    /// Interrupt the session's current turn.
    ///
    /// The active turn is interrupted at the agent; its terminal still
    /// arrives through the native stream. With no active turn, the
    /// oldest queued turn is rejected locally instead. With nothing in
    /// flight at all, this is a no-op.
    pub async fn cancel_turn(&self, session_id: &SessionId) -> Result<(), HostError> {
        let (stream, client) = self.pool.lookup(session_id).await?;
        if stream.has_active_turn() {
            return client.interrupt().await.map_err(|err| HostError::InterruptFailed {
                message: format!("agent rejected the interrupt: {err}"),
            });
        }
        stream.reject_front_pending(&HostError::InterruptFailed {
            message: "turn cancelled before it started".to_string(),
        });
        Ok(())
    }

    /// Kill a session: its process binding is dropped silently (no
    /// upserts, no turn events) and the id stops resolving. The
    /// underlying connection stays warm for the next session. Killing
    /// an unknown or already-killed session is a no-op.
    pub async fn kill_session(&self, session_id: &SessionId) {
        info!(session_id = %session_id.0, "killing session");
        self.pool.unbind_silent(session_id).await;
    }

    /// Whether the session is bound and its agent process is running.
    pub async fn is_alive(&self, session_id: &SessionId) -> bool {
        self.pool.is_alive(session_id).await
    }

    /// Subscribe to a session's upsert stream.
    pub async fn on_upsert(
        &self,
        session_id: &SessionId,
    ) -> Result<UnboundedReceiverStream<UpsertObject>, HostError> {
        let (stream, _client) = self.pool.lookup(session_id).await?;
        Ok(UnboundedReceiverStream::new(stream.subscribe_upserts()))
    }

    /// Subscribe to a session's turn events.
    pub async fn on_turn(
        &self,
        session_id: &SessionId,
    ) -> Result<UnboundedReceiverStream<TurnEvent>, HostError> {
        let (stream, _client) = self.pool.lookup(session_id).await?;
        Ok(UnboundedReceiverStream::new(stream.subscribe_turns()))
    }

    /// Pool occupancy counters.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Close every connection and unbind every session.
    pub async fn shutdown(&self) {
        info!("shutting down session host");
        self.pool.shutdown().await;
    }

    fn open_request(
        &self,
        options: &SessionOptions,
        resume: Option<SessionId>,
    ) -> Result<OpenRequest, HostError> {
        let project_dir = options
            .project_dir
            .clone()
            .or_else(|| self.config.default_project_dir.clone())
            .ok_or_else(|| HostError::SessionCreateFailed {
                message: "no project directory given and no default configured".to_string(),
                source: None,
            })?;
        let mut request = OpenRequest::new(project_dir);
        request.resume = resume;
        request.view_file_path = options.view_file_path.clone();
        request.provider_options = options.provider_options.clone();
        Ok(request)
    }
}

// ============================================================================
// Tests
// ============================================================================
