use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::messages::{ControlFrame, StreamEvent, StreamMessage};
use super::transport::{StreamConnector, StreamTransport, TransportEvent, NORMAL_CLOSE_CODE};

/// Stream-level failures a caller can branch on
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream for session {0} did not become ready in time")]
    NotReady(String),

    #[error("stream transport error: {0}")]
    Transport(String),
}

/// Timing knobs for the connection manager
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Liveness heartbeat interval while connected
    pub heartbeat_interval: Duration,
    /// Total time `connect` waits for the transport to report ready
    pub ready_timeout: Duration,
    /// Poll interval during the readiness wait
    pub ready_poll_interval: Duration,
    /// Base delay for reconnect backoff
    pub reconnect_base: Duration,
    /// Reconnect attempts before abandoning
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_millis(100),
            reconnect_base: Duration::from_secs(2),
            max_reconnect_attempts: 5,
        }
    }
}

/// Backoff schedule: `base * 2^attempts`
pub fn reconnect_delay(base: Duration, attempts: u32) -> Duration {
    base.saturating_mul(1u32 << attempts.min(16))
}

/// Identifier handed out by `add_listener`, used to remove the listener.
pub type ListenerId = Uuid;

type ListenerSet = Arc<StdMutex<HashMap<ListenerId, mpsc::UnboundedSender<StreamEvent>>>>;

/// One live physical connection and its service tasks
struct ConnectionRecord {
    transport: Arc<dyn StreamTransport>,
    is_connected: Arc<AtomicBool>,
    heartbeat_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl ConnectionRecord {
    fn teardown(&self) {
        self.heartbeat_task.abort();
        self.dispatch_task.abort();
        self.is_connected.store(false, Ordering::SeqCst);
    }
}

/// Per-session bookkeeping. Listeners live here, outside the connection
/// record, so they survive reconnects; only `disconnect` drops them.
struct SessionEntry {
    connection: Option<ConnectionRecord>,
    listeners: ListenerSet,
    reconnect_attempts: u32,
    reconnect_pending: bool,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            connection: None,
            listeners: Arc::new(StdMutex::new(HashMap::new())),
            reconnect_attempts: 0,
            reconnect_pending: false,
        }
    }
}

struct ManagerInner {
    connector: Arc<dyn StreamConnector>,
    config: StreamConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

/// Owns one reconnecting stream per session id.
///
/// Explicitly constructed and dependency-injected — there is no global
/// registry, so tests (and multiple independent consumers) each get their
/// own instance.
#[derive(Clone)]
pub struct StreamConnectionManager {
    inner: Arc<ManagerInner>,
}

impl StreamConnectionManager {
    pub fn new(connector: Arc<dyn StreamConnector>, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connect the stream for a session. Idempotent: a live connection makes
    /// this a no-op; a stale one is torn down and replaced. Blocks (bounded)
    /// until the transport reports ready.
    pub async fn connect(&self, session_id: &str) -> Result<(), StreamError> {
        {
            let mut sessions = self.inner.sessions.lock().await;
            let entry = sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);

            if let Some(record) = &entry.connection {
                // Reconcile the tracked flag with transport ground truth.
                let live = record.transport.is_open();
                record.is_connected.store(live, Ordering::SeqCst);
                if live {
                    debug!("stream for session {} already connected", session_id);
                    return Ok(());
                }
                info!("tearing down stale stream for session {}", session_id);
                record.teardown();
                entry.connection = None;
            }

            // An explicit connect always starts with a clean slate.
            entry.reconnect_attempts = 0;
            entry.reconnect_pending = false;
        }

        Self::establish(&self.inner, session_id)
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        // Bounded readiness poll, reconciling the flag at each check.
        let deadline = tokio::time::Instant::now() + self.inner.config.ready_timeout;
        loop {
            {
                let sessions = self.inner.sessions.lock().await;
                if let Some(record) = sessions
                    .get(session_id)
                    .and_then(|entry| entry.connection.as_ref())
                {
                    let live = record.transport.is_open();
                    record.is_connected.store(live, Ordering::SeqCst);
                    if live {
                        info!("stream connected for session {}", session_id);
                        return Ok(());
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                // Leave nothing dangling behind a failed connect.
                self.disconnect(session_id).await;
                return Err(StreamError::NotReady(session_id.to_string()));
            }

            tokio::time::sleep(self.inner.config.ready_poll_interval).await;
        }
    }

    /// Hard reset for a session: stop the heartbeat, close the transport,
    /// clear the record and attempt counters, and drop all listeners.
    /// Safe to call for an unconnected session.
    pub async fn disconnect(&self, session_id: &str) {
        let entry = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.remove(session_id)
        };

        if let Some(entry) = entry {
            if let Some(record) = entry.connection {
                record.teardown();
                record.transport.close().await;
            }
            entry.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
            info!("stream disconnected for session {}", session_id);
        }
    }

    /// Register a listener for a session's stream events. Events delivered
    /// in arrival order. The listener survives reconnects; it is dropped by
    /// `remove_listener` or `disconnect`.
    pub async fn add_listener(
        &self,
        session_id: &str,
    ) -> (ListenerId, mpsc::UnboundedReceiver<StreamEvent>) {
        let mut sessions = self.inner.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        entry
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    pub async fn remove_listener(&self, session_id: &str, id: ListenerId) {
        let sessions = self.inner.sessions.lock().await;
        if let Some(entry) = sessions.get(session_id) {
            entry
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
        }
    }

    /// Liveness check, reconciled against the transport's real readiness
    /// rather than the tracked flag alone.
    pub async fn is_connected(&self, session_id: &str) -> bool {
        let sessions = self.inner.sessions.lock().await;
        match sessions
            .get(session_id)
            .and_then(|entry| entry.connection.as_ref())
        {
            Some(record) => {
                let live = record.transport.is_open();
                record.is_connected.store(live, Ordering::SeqCst);
                live
            }
            None => false,
        }
    }

    /// Number of registered listeners (diagnostics and tests).
    pub async fn listener_count(&self, session_id: &str) -> usize {
        let sessions = self.inner.sessions.lock().await;
        sessions
            .get(session_id)
            .map(|entry| entry.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .unwrap_or(0)
    }

    /// Open a fresh transport for the session, wire up the dispatch and
    /// heartbeat tasks, and store the record. Listeners and attempt counters
    /// on an existing entry are preserved.
    async fn establish(inner: &Arc<ManagerInner>, session_id: &str) -> anyhow::Result<()> {
        let (transport, events) = inner.connector.open(session_id).await?;
        let transport: Arc<dyn StreamTransport> = Arc::from(transport);

        // Initial ping unblocks server-side loops that wait for client
        // activity before emitting anything.
        if let Err(e) = transport.send(ControlFrame::Ping).await {
            warn!("initial ping failed for session {}: {}", session_id, e);
        }

        let is_connected = Arc::new(AtomicBool::new(transport.is_open()));

        let listeners = {
            let mut sessions = inner.sessions.lock().await;
            let entry = sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::new);
            entry.listeners.clone()
        };

        let dispatch_task = tokio::spawn(Self::dispatch_loop(
            inner.clone(),
            session_id.to_string(),
            events,
            listeners,
            is_connected.clone(),
        ));

        let heartbeat_task = tokio::spawn(Self::heartbeat_loop(
            inner.clone(),
            session_id.to_string(),
            transport.clone(),
            is_connected.clone(),
        ));

        let record = ConnectionRecord {
            transport,
            is_connected,
            heartbeat_task,
            dispatch_task,
        };

        let mut sessions = inner.sessions.lock().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionEntry::new);
        if let Some(stale) = entry.connection.replace(record) {
            stale.teardown();
        }
        Ok(())
    }

    /// Parse and route inbound frames. Malformed or unknown messages are
    /// logged and dropped; they never take the dispatcher down.
    async fn dispatch_loop(
        inner: Arc<ManagerInner>,
        session_id: String,
        mut events: mpsc::Receiver<TransportEvent>,
        listeners: ListenerSet,
        is_connected: Arc<AtomicBool>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(text) => {
                    let message: StreamMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(
                                "dropping unrecognized stream message for session {}: {}",
                                session_id, e
                            );
                            continue;
                        }
                    };
                    Self::route_message(&session_id, message, &listeners);
                }
                TransportEvent::Closed { code } => {
                    is_connected.store(false, Ordering::SeqCst);
                    if code == Some(NORMAL_CLOSE_CODE) {
                        info!("stream for session {} closed cleanly", session_id);
                    } else {
                        warn!(
                            "stream for session {} closed abnormally (code {:?})",
                            session_id, code
                        );
                        Self::schedule_reconnect(inner.clone(), session_id.clone());
                    }
                    break;
                }
            }
        }
    }

    fn route_message(session_id: &str, message: StreamMessage, listeners: &ListenerSet) {
        match message {
            StreamMessage::TranscriptSegment { text, start_time } => {
                // A text entry is only meaningful when non-empty.
                if text.trim().is_empty() {
                    debug!("dropping empty transcript segment for session {}", session_id);
                    return;
                }
                Self::broadcast(listeners, StreamEvent::Transcript { text, start_time });
            }
            StreamMessage::ConnectionEstablished { .. } => {
                info!("stream established for session {}", session_id);
            }
            StreamMessage::TranscriptComplete => {
                info!("transcript complete for session {}", session_id);
                Self::broadcast(listeners, StreamEvent::Complete);
            }
            StreamMessage::HeartbeatAck | StreamMessage::Pong => {
                debug!("liveness ack for session {}", session_id);
            }
            StreamMessage::Error { message } => {
                error!("stream error for session {}: {}", session_id, message);
                Self::broadcast(listeners, StreamEvent::StreamFailed { message });
            }
            StreamMessage::TranscriptionError { message } => {
                error!("transcription error for session {}: {}", session_id, message);
                Self::broadcast(listeners, StreamEvent::TranscriptionFailed { message });
            }
            StreamMessage::Phase { phase } => {
                if phase == "active" {
                    // Equivalent to a first transcript even without text.
                    Self::broadcast(listeners, StreamEvent::Activated);
                } else {
                    debug!("stream phase for session {}: {}", session_id, phase);
                }
            }
        }
    }

    fn broadcast(listeners: &ListenerSet, event: StreamEvent) {
        let mut set = listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Prune listeners whose receivers are gone.
        set.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Send a heartbeat every interval; a send failure marks the record
    /// disconnected and schedules a reconnect.
    async fn heartbeat_loop(
        inner: Arc<ManagerInner>,
        session_id: String,
        transport: Arc<dyn StreamTransport>,
        is_connected: Arc<AtomicBool>,
    ) {
        let mut interval = tokio::time::interval(inner.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the initial ping already covered it.
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = transport.send(ControlFrame::Heartbeat).await {
                warn!("heartbeat failed for session {}: {}", session_id, e);
                is_connected.store(false, Ordering::SeqCst);
                Self::schedule_reconnect(inner.clone(), session_id.clone());
                break;
            }
            debug!("heartbeat sent for session {}", session_id);
        }
    }

    /// Schedule a backoff reconnect for a session that dropped. Exceeding
    /// the attempt cap abandons reconnection; only an explicit `connect`
    /// resumes after that.
    fn schedule_reconnect(inner: Arc<ManagerInner>, session_id: String) {
        tokio::spawn(async move {
            let delay = {
                let mut sessions = inner.sessions.lock().await;
                let entry = match sessions.get_mut(&session_id) {
                    Some(entry) => entry,
                    // Disconnected in the meantime; nothing to revive.
                    None => return,
                };
                if entry.reconnect_pending {
                    return;
                }
                if entry.reconnect_attempts >= inner.config.max_reconnect_attempts {
                    error!(
                        "reconnect abandoned for session {} after {} attempts",
                        session_id, entry.reconnect_attempts
                    );
                    Self::broadcast(&entry.listeners, StreamEvent::ConnectivityLost);
                    return;
                }
                entry.reconnect_pending = true;
                let delay = reconnect_delay(inner.config.reconnect_base, entry.reconnect_attempts);
                entry.reconnect_attempts += 1;
                delay
            };

            info!(
                "reconnecting stream for session {} in {:?}",
                session_id, delay
            );
            tokio::time::sleep(delay).await;

            // A disconnect or an explicit connect in the meantime wins.
            {
                let mut sessions = inner.sessions.lock().await;
                match sessions.get_mut(&session_id) {
                    Some(entry) if entry.reconnect_pending => {
                        entry.reconnect_pending = false;
                    }
                    _ => return,
                }
            }

            match Self::establish(&inner, &session_id).await {
                Ok(()) => {
                    let mut sessions = inner.sessions.lock().await;
                    if let Some(entry) = sessions.get_mut(&session_id) {
                        entry.reconnect_attempts = 0;
                    }
                    info!("stream reconnected for session {}", session_id);
                }
                Err(e) => {
                    warn!("reconnect failed for session {}: {}", session_id, e);
                    Self::schedule_reconnect(inner.clone(), session_id.clone());
                }
            }
        });
    }
}
