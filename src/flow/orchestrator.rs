use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audio::{AudioSegmenter, CaptureEngineFactory, SegmenterConfig, SegmenterEvent};
use crate::session::{
    CapturePermission, CollaboratorError, DraftStore, Session, SessionCollaborator, SessionKind,
    SessionState, SessionStateMachine, SessionStatus, SideEffect, TranscriptEntry, TranscriptLog,
    TransitionOutcome, Trigger,
};
use crate::stream::{ListenerId, StreamConnectionManager, StreamEvent};
use crate::upload::{IngestionEndpoint, SegmentCache, SegmentUploader, UploaderConfig};

use super::dispatcher::CommandDispatcher;

/// Flow-level failures surfaced to the caller
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("capture permission denied")]
    PermissionDenied,

    #[error("session {0} did not become visible in time")]
    SessionVisibilityTimeout(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Orchestrator-level state, layered on top of the session machine's states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Presentation collaborator for user-facing errors (toast rendering lives
/// elsewhere; the core only hands over the message).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show_error(&self, message: &str);
}

/// Fallback notifier that writes to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn show_error(&self, message: &str) {
        error!("user-facing error: {}", message);
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Bound on the wait for a freshly created session to become visible
    pub session_ready_timeout: Duration,
    /// Segmented capture settings
    pub segmenter: SegmenterConfig,
    /// Segment delivery retry policy
    pub uploader: UploaderConfig,
    /// Root directory for the durable segment cache (one subdir per session)
    pub cache_dir: PathBuf,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            session_ready_timeout: Duration::from_secs(5),
            segmenter: SegmenterConfig::default(),
            uploader: UploaderConfig::default(),
            cache_dir: PathBuf::from("segment-cache"),
        }
    }
}

/// External collaborators the orchestrator composes
pub struct FlowDeps {
    pub streams: StreamConnectionManager,
    pub collaborator: Arc<dyn SessionCollaborator>,
    pub ingest: Arc<dyn IngestionEndpoint>,
    pub permission: Arc<dyn CapturePermission>,
    pub engine_factory: Arc<dyn CaptureEngineFactory>,
    pub drafts: Arc<dyn DraftStore>,
    pub notifier: Arc<dyn Notifier>,
}

/// Live resources for the flow currently in progress
struct ActiveFlow {
    session: Session,
    uploader: Option<Arc<SegmentUploader>>,
    segmenter: Option<AudioSegmenter>,
    upload_task: Option<JoinHandle<()>>,
    ticker_task: Option<JoinHandle<()>>,
    stream_listener: Option<(ListenerId, JoinHandle<()>)>,
    has_cached_segments: Arc<AtomicBool>,
    cached_watch_task: Option<JoinHandle<()>>,
}

impl ActiveFlow {
    fn new(session: Session) -> Self {
        Self {
            session,
            uploader: None,
            segmenter: None,
            upload_task: None,
            ticker_task: None,
            stream_listener: None,
            has_cached_segments: Arc::new(AtomicBool::new(false)),
            cached_watch_task: None,
        }
    }
}

struct FlowInner {
    config: FlowConfig,
    streams: StreamConnectionManager,
    collaborator: Arc<dyn SessionCollaborator>,
    ingest: Arc<dyn IngestionEndpoint>,
    permission: Arc<dyn CapturePermission>,
    engine_factory: Arc<dyn CaptureEngineFactory>,
    drafts: Arc<dyn DraftStore>,
    notifier: Arc<dyn Notifier>,

    machine: Mutex<SessionStateMachine>,
    dispatcher: CommandDispatcher,
    self_weak: Weak<FlowInner>,

    flow_state: Mutex<FlowState>,
    active: Mutex<Option<ActiveFlow>>,
    transcripts: Mutex<TranscriptLog>,
    pending_draft: Mutex<Option<String>>,
    last_flow_error: Mutex<Option<FlowError>>,
    elapsed_seconds: Arc<AtomicU64>,

    /// Triggers raised by pump tasks; executed by the driver task so that a
    /// side effect can safely tear down the very pump that raised it.
    trigger_tx: mpsc::UnboundedSender<Trigger>,
}

/// Composes the state machine, stream manager and capture/upload pipeline
/// into one recording flow. At most one flow is active at a time.
pub struct RecordingFlowOrchestrator {
    inner: Arc<FlowInner>,
}

impl RecordingFlowOrchestrator {
    pub fn new(config: FlowConfig, deps: FlowDeps) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<FlowInner>| {
            let dispatcher = build_dispatcher(weak.clone());
            FlowInner {
                config,
                streams: deps.streams,
                collaborator: deps.collaborator,
                ingest: deps.ingest,
                permission: deps.permission,
                engine_factory: deps.engine_factory,
                drafts: deps.drafts,
                notifier: deps.notifier,
                machine: Mutex::new(SessionStateMachine::new()),
                dispatcher,
                self_weak: weak.clone(),
                flow_state: Mutex::new(FlowState::Idle),
                active: Mutex::new(None),
                transcripts: Mutex::new(TranscriptLog::new()),
                pending_draft: Mutex::new(None),
                last_flow_error: Mutex::new(None),
                elapsed_seconds: Arc::new(AtomicU64::new(0)),
                trigger_tx,
            }
        });

        // Driver: executes triggers raised by pump tasks. Ends when the
        // orchestrator (the only strong holder of the sender) goes away.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(drive_triggers(weak, trigger_rx));

        Self { inner }
    }

    /// Start a recording flow end to end: permission, session resolution,
    /// stream, capture. Starting while another flow is active stops that
    /// flow first.
    pub async fn start_recording_flow(
        &self,
        title: Option<String>,
        content: Option<String>,
    ) -> Result<Session, FlowError> {
        let inner = &self.inner;

        // Single-flow guard: never two concurrent flows.
        if *inner.flow_state.lock().await != FlowState::Idle {
            info!("a flow is already in progress; stopping it first");
            self.stop_recording_flow().await?;
            self.finalize_session().await?;
        }
        *inner.flow_state.lock().await = FlowState::Starting;

        // Capture permission is the gate for everything else.
        let granted = match inner.permission.request().await {
            Ok(granted) => granted,
            Err(e) => {
                *inner.flow_state.lock().await = FlowState::Idle;
                return Err(FlowError::Other(e.context("permission request failed")));
            }
        };
        if !granted {
            warn!("capture permission denied, aborting flow");
            {
                let mut machine = inner.machine.lock().await;
                machine.context_mut().error = Some("microphone permission denied".to_string());
            }
            inner.fire(Trigger::ErrorOccurred).await;
            *inner.flow_state.lock().await = FlowState::Idle;
            return Err(FlowError::PermissionDenied);
        }

        {
            let mut machine = inner.machine.lock().await;
            machine.context_mut().pending_session_title = title;
        }
        if let Some(content) = content {
            if let Err(e) = inner.drafts.save_draft(&content).await {
                warn!("failed to persist draft content: {}", e);
            }
            *inner.pending_draft.lock().await = Some(content);
        }

        let outcome = inner.fire(Trigger::UserStartRecording).await;
        if !outcome.success {
            *inner.flow_state.lock().await = FlowState::Idle;
            return Err(FlowError::Other(anyhow::anyhow!(
                "cannot start flow: {}",
                outcome.reason.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        // The nested handler chain has completed by now; surface anything
        // it recorded as a hard failure.
        if let Some(err) = inner.last_flow_error.lock().await.take() {
            *inner.flow_state.lock().await = FlowState::Idle;
            return Err(err);
        }

        let session = {
            let machine = inner.machine.lock().await;
            machine
                .context()
                .session
                .clone()
                .ok_or_else(|| anyhow::anyhow!("flow started without an established session"))?
        };

        *inner.flow_state.lock().await = FlowState::Active;
        info!("recording flow active for session {}", session.id);
        Ok(session)
    }

    /// Stop capture and move to processing. The stream deliberately stays
    /// connected so trailing transcript results can drain; it is torn down
    /// by `transcript_complete` or an explicit `finalize_session`.
    pub async fn stop_recording_flow(&self) -> Result<(), FlowError> {
        let inner = &self.inner;

        {
            let mut flow_state = inner.flow_state.lock().await;
            if !matches!(*flow_state, FlowState::Active | FlowState::Starting) {
                return Ok(());
            }
            *flow_state = FlowState::Stopping;
        }

        let outcome = inner.fire(Trigger::UserStopRecording).await;
        if !outcome.success {
            warn!(
                "stop requested but no legal transition: {}",
                outcome.reason.unwrap_or_else(|| "unknown".to_string())
            );
        }

        *inner.flow_state.lock().await = FlowState::Idle;
        Ok(())
    }

    /// Explicitly finish the session: disconnect the stream and confirm
    /// completion with the collaborator.
    pub async fn finalize_session(&self) -> Result<(), FlowError> {
        let outcome = self.inner.fire(Trigger::ProcessingCompleted).await;
        if !outcome.success {
            info!(
                "finalize requested with nothing to finalize: {}",
                outcome.reason.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    /// Clear the finished note and return to the default state, ready for
    /// a fresh flow.
    pub async fn new_note(&self) -> Result<(), FlowError> {
        let outcome = self.inner.fire(Trigger::UserNewNote).await;
        if !outcome.success {
            return Err(FlowError::Other(anyhow::anyhow!(
                "cannot start a new note: {}",
                outcome.reason.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        Ok(())
    }

    /// Retry every cached segment for the current flow (user-triggered or
    /// after connectivity returns).
    pub async fn retry_cached_segments(&self) -> Result<usize> {
        let uploader = {
            let active = self.inner.active.lock().await;
            active.as_ref().and_then(|flow| flow.uploader.clone())
        };
        match uploader {
            Some(uploader) => uploader.retry_failed_segments().await,
            None => Ok(0),
        }
    }

    /// Decide on cold start whether the last known session is worth
    /// resuming. Clears stale local state when it is not.
    pub async fn check_cold_start(&self) -> Option<Session> {
        let last = self.inner.drafts.load_last_session().await.ok().flatten()?;
        match self.inner.collaborator.check_active_session().await {
            Ok(Some(session)) if session.id == last.id => Some(session),
            _ => {
                if let Err(e) = self.inner.drafts.clear().await {
                    warn!("failed to clear stale local state: {}", e);
                }
                None
            }
        }
    }

    pub async fn flow_state(&self) -> FlowState {
        *self.inner.flow_state.lock().await
    }

    pub async fn session_state(&self) -> SessionState {
        self.inner.machine.lock().await.current_state()
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner.machine.lock().await.context().session.clone()
    }

    pub async fn transcript_entries(&self) -> Vec<TranscriptEntry> {
        self.inner.transcripts.lock().await.entries().to_vec()
    }

    /// Seconds of recording since the flow went active
    pub fn elapsed_seconds(&self) -> u64 {
        self.inner.elapsed_seconds.load(Ordering::SeqCst)
    }

    /// Register a listener on the underlying state machine
    pub async fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(SessionState, &[SideEffect]) + Send + Sync + 'static,
    {
        self.inner.machine.lock().await.add_listener(listener);
    }
}

/// Wire every side-effect command to its handler.
fn build_dispatcher(weak: Weak<FlowInner>) -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();

    macro_rules! route {
        ($effect:expr, $method:ident) => {{
            let weak = weak.clone();
            dispatcher.register($effect, move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.$method().await,
                        None => Ok(()),
                    }
                }
                .boxed()
            });
        }};
    }

    route!(SideEffect::ClearTranscripts, handle_clear_transcripts);
    route!(SideEffect::CreateSession, handle_create_session);
    route!(SideEffect::ConnectStream, handle_connect_stream);
    route!(SideEffect::StartRecording, handle_start_recording);
    route!(SideEffect::StopRecording, handle_stop_recording);
    route!(SideEffect::DisconnectStream, handle_disconnect_stream);
    route!(SideEffect::FinishSession, handle_finish_session);
    route!(SideEffect::ShowError, handle_show_error);

    dispatcher
}

/// Executes triggers raised by pump tasks, one at a time.
async fn drive_triggers(weak: Weak<FlowInner>, mut rx: mpsc::UnboundedReceiver<Trigger>) {
    while let Some(trigger) = rx.recv().await {
        match weak.upgrade() {
            Some(inner) => {
                inner.fire(trigger).await;
            }
            None => break,
        }
    }
}

impl FlowInner {
    /// Run one trigger through the machine and execute its side effects.
    async fn fire(&self, trigger: Trigger) -> TransitionOutcome {
        let outcome = {
            let mut machine = self.machine.lock().await;
            machine.transition(trigger)
        };
        if outcome.success {
            self.dispatcher.dispatch(&outcome.side_effects).await;
        }
        outcome
    }

    /// Queue a trigger for the driver task. Used from pump tasks, where
    /// executing side effects inline could tear down the pump itself.
    fn raise(&self, trigger: Trigger) {
        if self.trigger_tx.send(trigger).is_err() {
            warn!("trigger {:?} dropped: orchestrator is gone", trigger);
        }
    }

    async fn record_flow_error(&self, err: FlowError) {
        {
            let mut machine = self.machine.lock().await;
            machine.context_mut().error = Some(err.to_string());
        }
        *self.last_flow_error.lock().await = Some(err);
    }

    // ------------------------------------------------------------------
    // Side-effect handlers
    // ------------------------------------------------------------------

    async fn handle_clear_transcripts(self: Arc<Self>) -> Result<()> {
        self.transcripts.lock().await.clear();
        self.machine.lock().await.context_mut().transcript_count = 0;
        Ok(())
    }

    /// Resolve or create the backing session, wait for it to be visible,
    /// then report `SessionCreated` back into the machine.
    async fn handle_create_session(self: Arc<Self>) -> Result<()> {
        let session = match self.resolve_session().await {
            Ok(session) => session,
            Err(err) => {
                let message = err.to_string();
                self.record_flow_error(err).await;
                self.fire(Trigger::ErrorOccurred).await;
                anyhow::bail!("session resolution failed: {}", message);
            }
        };

        // Nothing downstream may observe the session before the
        // collaborator confirms it is visible to reads.
        let ready = self
            .collaborator
            .wait_for_session_ready(&session.id, self.config.session_ready_timeout)
            .await
            .map_err(FlowError::Collaborator);
        match ready {
            Ok(true) => {}
            Ok(false) => {
                let err = FlowError::SessionVisibilityTimeout(session.id.clone());
                let message = err.to_string();
                self.record_flow_error(err).await;
                self.fire(Trigger::ErrorOccurred).await;
                anyhow::bail!("{}", message);
            }
            Err(err) => {
                let message = err.to_string();
                self.record_flow_error(err).await;
                self.fire(Trigger::ErrorOccurred).await;
                anyhow::bail!("{}", message);
            }
        }

        if let Err(e) = self.drafts.save_last_session(&session).await {
            warn!("failed to persist last-known session: {}", e);
        }

        {
            let mut machine = self.machine.lock().await;
            machine.context_mut().session = Some(session.clone());
        }
        *self.active.lock().await = Some(ActiveFlow::new(session));

        self.fire(Trigger::SessionCreated).await;
        Ok(())
    }

    /// Create the session, resolving a conflict by reusing the existing
    /// active session or upgrading a note-only one. A conflict is never a
    /// user-visible failure.
    async fn resolve_session(&self) -> Result<Session, FlowError> {
        let title = {
            let machine = self.machine.lock().await;
            machine.context().pending_session_title.clone()
        };
        let content = self.pending_draft.lock().await.take();

        // An active *recording* session would mean two concurrent
        // recordings; finalize it first. A note-only session is left in
        // place so the conflict path below can upgrade it.
        if let Ok(Some(existing)) = self.collaborator.check_active_session().await {
            if existing.kind == SessionKind::Recording && existing.status == SessionStatus::Active {
                info!("finalizing leftover active recording session {}", existing.id);
                if let Err(e) = self.collaborator.finish_session(&existing.id).await {
                    warn!("failed to finalize leftover session {}: {}", existing.id, e);
                }
            }
        }

        match self
            .collaborator
            .create_recording_session(title.as_deref(), content.as_deref())
            .await
        {
            Ok(session) => Ok(session),
            Err(CollaboratorError::Conflict { existing }) => {
                let existing = match existing {
                    Some(session) => Some(session),
                    None => self
                        .collaborator
                        .check_active_session()
                        .await
                        .ok()
                        .flatten(),
                };
                match existing {
                    Some(session) if session.kind == SessionKind::NoteOnly => {
                        info!("upgrading note-only session {} to recording", session.id);
                        Ok(self.collaborator.upgrade_to_recording(&session.id).await?)
                    }
                    Some(session) => {
                        info!("reusing existing active session {}", session.id);
                        Ok(session)
                    }
                    None => Err(FlowError::Collaborator(CollaboratorError::Conflict {
                        existing: None,
                    })),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Connect the transcript stream and wire its events back into the
    /// machine. A failure here degrades to capture-only; it never aborts
    /// the flow.
    async fn handle_connect_stream(self: Arc<Self>) -> Result<()> {
        let session_id = match self.machine.lock().await.context().session.clone() {
            Some(session) => session.id,
            None => {
                warn!("connect stream requested without a session");
                return Ok(());
            }
        };

        if let Err(e) = self.streams.connect(&session_id).await {
            warn!(
                "transcript stream unavailable for session {}, continuing capture-only: {}",
                session_id, e
            );
            return Ok(());
        }

        // Replace any previous listener so a retried connect never leaks one.
        let stale = {
            let mut active = self.active.lock().await;
            active
                .as_mut()
                .and_then(|flow| flow.stream_listener.take())
        };
        if let Some((listener_id, task)) = stale {
            self.streams.remove_listener(&session_id, listener_id).await;
            task.abort();
        }

        let (listener_id, events) = self.streams.add_listener(&session_id).await;
        let weak = self.self_weak.clone();
        let pump = tokio::spawn(stream_pump(weak, events));

        let mut active = self.active.lock().await;
        if let Some(flow) = active.as_mut() {
            flow.stream_listener = Some((listener_id, pump));
        } else {
            // No flow record to attach to; don't leave the pump running.
            drop(active);
            self.streams.remove_listener(&session_id, listener_id).await;
            pump.abort();
        }
        Ok(())
    }

    /// Start segmented capture wired to the uploader.
    async fn handle_start_recording(self: Arc<Self>) -> Result<()> {
        let session_id = match self.machine.lock().await.context().session.clone() {
            Some(session) => session.id,
            None => anyhow::bail!("start recording requested without a session"),
        };

        {
            let active = self.active.lock().await;
            if let Some(flow) = active.as_ref() {
                if flow.segmenter.as_ref().map(|s| s.is_recording()).unwrap_or(false) {
                    info!("capture already running for session {}", session_id);
                    return Ok(());
                }
            }
        }

        let cache = SegmentCache::new(self.config.cache_dir.join(&session_id))?;
        let mut uploader = SegmentUploader::new(
            self.ingest.clone(),
            cache,
            session_id.clone(),
            self.config.uploader.clone(),
        );
        let mut cached_rx = uploader.cached_events();
        let uploader = Arc::new(uploader);

        let mut segmenter =
            AudioSegmenter::new(self.config.segmenter.clone(), self.engine_factory.clone());
        let segment_events = match segmenter.start().await {
            Ok(rx) => rx,
            Err(e) => {
                let message = format!("audio capture failed to start: {}", e);
                self.record_flow_error(FlowError::Other(e)).await;
                self.fire(Trigger::ErrorOccurred).await;
                anyhow::bail!("{}", message);
            }
        };

        self.machine.lock().await.context_mut().is_recording = true;

        let has_cached = Arc::new(AtomicBool::new(false));
        let cached_flag = has_cached.clone();
        let cached_watch = tokio::spawn(async move {
            while let Some(sequence) = cached_rx.recv().await {
                warn!("segment {} parked in durable cache", sequence);
                cached_flag.store(true, Ordering::SeqCst);
            }
        });

        let upload_task = tokio::spawn(upload_pump(
            self.self_weak.clone(),
            segment_events,
            uploader.clone(),
        ));

        // Elapsed-time ticker for the UI layer.
        self.elapsed_seconds.store(0, Ordering::SeqCst);
        let elapsed = self.elapsed_seconds.clone();
        let ticker_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                elapsed.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut active = self.active.lock().await;
        let flow = active
            .get_or_insert_with(|| ActiveFlow::new(Session::new(
                session_id.clone(),
                SessionStatus::Active,
                SessionKind::Recording,
            )));
        flow.uploader = Some(uploader);
        flow.segmenter = Some(segmenter);
        flow.upload_task = Some(upload_task);
        flow.ticker_task = Some(ticker_task);
        flow.has_cached_segments = has_cached;
        flow.cached_watch_task = Some(cached_watch);

        info!("segmented capture started for session {}", session_id);
        Ok(())
    }

    /// Stop capture, flushing the trailing partial segment and waiting for
    /// in-flight uploads to settle. Idempotent.
    async fn handle_stop_recording(self: Arc<Self>) -> Result<()> {
        let (segmenter, upload_task, ticker_task) = {
            let mut active = self.active.lock().await;
            match active.as_mut() {
                Some(flow) => (
                    flow.segmenter.take(),
                    flow.upload_task.take(),
                    flow.ticker_task.take(),
                ),
                None => (None, None, None),
            }
        };

        if let Some(mut segmenter) = segmenter {
            segmenter.cleanup().await;
        }
        if let Some(task) = upload_task {
            if let Err(e) = task.await {
                error!("upload pump task panicked: {}", e);
            }
        }
        if let Some(task) = ticker_task {
            task.abort();
        }

        self.machine.lock().await.context_mut().is_recording = false;
        Ok(())
    }

    async fn handle_disconnect_stream(self: Arc<Self>) -> Result<()> {
        let session_id = {
            let active = self.active.lock().await;
            active.as_ref().map(|flow| flow.session.id.clone())
        };
        let session_id = match session_id {
            Some(id) => id,
            None => {
                // Fall back to the machine's cached session.
                match self.machine.lock().await.context().session.clone() {
                    Some(session) => session.id,
                    None => return Ok(()),
                }
            }
        };

        // Disconnect drops the listeners, which ends the pump naturally.
        self.streams.disconnect(&session_id).await;
        let stale = {
            let mut active = self.active.lock().await;
            active
                .as_mut()
                .and_then(|flow| flow.stream_listener.take())
        };
        if let Some((_, task)) = stale {
            task.abort();
        }
        Ok(())
    }

    /// Confirm completion with the collaborator and release the flow.
    async fn handle_finish_session(self: Arc<Self>) -> Result<()> {
        let (session, uploader, has_cached, cached_watch) = {
            let mut active = self.active.lock().await;
            match active.take() {
                Some(flow) => (
                    Some(flow.session),
                    flow.uploader,
                    flow.has_cached_segments.load(Ordering::SeqCst),
                    flow.cached_watch_task,
                ),
                None => (None, None, false, None),
            }
        };

        // Last chance to drain segments that were parked in the cache.
        if has_cached {
            if let Some(uploader) = &uploader {
                match uploader.retry_failed_segments().await {
                    Ok(delivered) => info!("drained {} cached segments before finish", delivered),
                    Err(e) => warn!("cached segment drain failed: {}", e),
                }
            }
        }
        if let Some(task) = cached_watch {
            task.abort();
        }

        let session = match session {
            Some(session) => Some(session),
            None => self.machine.lock().await.context().session.clone(),
        };
        if let Some(session) = session {
            self.collaborator
                .finish_session(&session.id)
                .await
                .with_context(|| format!("failed to finish session {}", session.id))?;
            info!("session {} finished", session.id);
        }

        if let Err(e) = self.drafts.clear().await {
            warn!("failed to clear local draft state: {}", e);
        }
        *self.flow_state.lock().await = FlowState::Idle;
        Ok(())
    }

    async fn handle_show_error(self: Arc<Self>) -> Result<()> {
        let message = {
            let machine = self.machine.lock().await;
            machine
                .context()
                .error
                .clone()
                .unwrap_or_else(|| "something went wrong".to_string())
        };
        self.notifier.show_error(&message).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pump-task callbacks
    // ------------------------------------------------------------------

    async fn on_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Transcript { text, start_time } => {
                {
                    let mut transcripts = self.transcripts.lock().await;
                    transcripts.append(TranscriptEntry::new(start_time, text));
                    let count = transcripts.len();
                    self.machine.lock().await.context_mut().transcript_count = count;
                }
                let first = {
                    let machine = self.machine.lock().await;
                    machine.can_transition(Trigger::FirstTranscriptReceived)
                };
                if first {
                    self.raise(Trigger::FirstTranscriptReceived);
                }
            }
            StreamEvent::Activated => {
                // Equivalent to a first transcript, even without text.
                let first = {
                    let machine = self.machine.lock().await;
                    machine.can_transition(Trigger::FirstTranscriptReceived)
                };
                if first {
                    self.raise(Trigger::FirstTranscriptReceived);
                }
            }
            StreamEvent::Complete => {
                self.raise(Trigger::ProcessingCompleted);
            }
            StreamEvent::TranscriptionFailed { message } => {
                self.machine.lock().await.context_mut().error =
                    Some(format!("transcription failed: {}", message));
                self.raise(Trigger::ErrorOccurred);
            }
            StreamEvent::StreamFailed { message } => {
                // Recoverable: the stream manager owns reconnection.
                warn!("stream error (reconnect pending): {}", message);
            }
            StreamEvent::ConnectivityLost => {
                warn!("transcript connectivity lost; capture continues offline");
                self.notifier
                    .show_error("transcript connection lost; recording continues")
                    .await;
            }
        }
    }

    async fn on_segmenter_error(&self, message: String) {
        self.machine.lock().await.context_mut().error = Some(message);
        self.raise(Trigger::ErrorOccurred);
    }
}

/// Forwards stream events into the orchestrator until the listener is
/// dropped (disconnect) or the orchestrator goes away.
async fn stream_pump(
    weak: Weak<FlowInner>,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
) {
    while let Some(event) = events.recv().await {
        match weak.upgrade() {
            Some(inner) => inner.on_stream_event(event).await,
            None => break,
        }
    }
}

/// Moves emitted segments into the uploader; segmenter errors re-enter the
/// machine as `ErrorOccurred`.
async fn upload_pump(
    weak: Weak<FlowInner>,
    mut events: mpsc::Receiver<SegmenterEvent>,
    uploader: Arc<SegmentUploader>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SegmenterEvent::Segment(segment) => {
                if let Err(e) = uploader
                    .upload_segment(segment.sequence_number, &segment.payload)
                    .await
                {
                    // Only cache I/O can fail here; delivery failures were
                    // already retried and cached.
                    error!(
                        "segment {} lost to cache failure: {}",
                        segment.sequence_number, e
                    );
                }
            }
            SegmenterEvent::Error(message) => {
                error!("capture engine failure: {}", message);
                match weak.upgrade() {
                    Some(inner) => inner.on_segmenter_error(message).await,
                    None => break,
                }
            }
        }
    }
}
