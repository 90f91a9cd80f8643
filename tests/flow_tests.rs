// Integration tests for the recording flow orchestrator
//
// Every collaborator is scripted: session service, permission gate, capture
// engines, ingestion endpoint and the stream transport. The tests drive the
// public flow API and observe the machine's state through it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use notestream::audio::{AudioFrame, CaptureEngine, CaptureEngineFactory, SegmenterConfig};
use notestream::flow::{FlowConfig, FlowDeps, FlowError, FlowState, RecordingFlowOrchestrator};
use notestream::session::{
    CapturePermission, CollaboratorError, DraftStore, Session, SessionCollaborator, SessionKind,
    SessionState, SessionStatus,
};
use notestream::stream::{
    ControlFrame, StreamConfig, StreamConnectionManager, StreamConnector, StreamTransport,
    TransportEvent,
};
use notestream::upload::{IngestError, IngestReceipt, IngestionEndpoint, UploaderConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct MockCollaborator {
    /// When set, the next create fails with a conflict carrying this session
    conflict: Mutex<Option<Session>>,
    active: Mutex<Option<Session>>,
    created: AtomicUsize,
    upgraded: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    ready: AtomicBool,
}

impl MockCollaborator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conflict: Mutex::new(None),
            active: Mutex::new(None),
            created: AtomicUsize::new(0),
            upgraded: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl SessionCollaborator for MockCollaborator {
    async fn create_recording_session(
        &self,
        _title: Option<&str>,
        _content: Option<&str>,
    ) -> Result<Session, CollaboratorError> {
        if let Some(existing) = self.conflict.lock().unwrap().take() {
            *self.active.lock().unwrap() = Some(existing.clone());
            return Err(CollaboratorError::Conflict {
                existing: Some(existing),
            });
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let session = Session::new(
            format!("s-{}", n),
            SessionStatus::Active,
            SessionKind::Recording,
        );
        *self.active.lock().unwrap() = Some(session.clone());
        Ok(session)
    }

    async fn upgrade_to_recording(&self, session_id: &str) -> Result<Session, CollaboratorError> {
        self.upgraded.lock().unwrap().push(session_id.to_string());
        let session = Session::new(session_id, SessionStatus::Active, SessionKind::Recording);
        *self.active.lock().unwrap() = Some(session.clone());
        Ok(session)
    }

    async fn finish_session(&self, session_id: &str) -> Result<(), CollaboratorError> {
        self.finished.lock().unwrap().push(session_id.to_string());
        *self.active.lock().unwrap() = None;
        Ok(())
    }

    async fn check_active_session(&self) -> Result<Option<Session>, CollaboratorError> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn delete_session(&self, _session_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn wait_for_session_ready(
        &self,
        _session_id: &str,
        _timeout: Duration,
    ) -> Result<bool, CollaboratorError> {
        Ok(self.ready.load(Ordering::SeqCst))
    }
}

struct MockPermission {
    granted: bool,
}

#[async_trait]
impl CapturePermission for MockPermission {
    async fn request(&self) -> Result<bool> {
        Ok(self.granted)
    }
}

#[derive(Default)]
struct MemoryDrafts {
    draft: Mutex<Option<String>>,
    last_session: Mutex<Option<Session>>,
    cleared: AtomicUsize,
}

#[async_trait]
impl DraftStore for MemoryDrafts {
    async fn save_draft(&self, content: &str) -> Result<()> {
        *self.draft.lock().unwrap() = Some(content.to_string());
        Ok(())
    }

    async fn load_draft(&self) -> Result<Option<String>> {
        Ok(self.draft.lock().unwrap().clone())
    }

    async fn save_last_session(&self, session: &Session) -> Result<()> {
        *self.last_session.lock().unwrap() = Some(session.clone());
        Ok(())
    }

    async fn load_last_session(&self) -> Result<Option<Session>> {
        Ok(self.last_session.lock().unwrap().clone())
    }

    async fn clear(&self) -> Result<()> {
        *self.draft.lock().unwrap() = None;
        *self.last_session.lock().unwrap() = None;
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AcceptAllEndpoint {
    uploads: AtomicUsize,
}

#[async_trait]
impl IngestionEndpoint for AcceptAllEndpoint {
    async fn upload(
        &self,
        _session_id: &str,
        _sequence: u64,
        payload: &[u8],
    ) -> Result<IngestReceipt, IngestError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(IngestReceipt {
            size: payload.len() as u64,
        })
    }
}

/// Engine that emits one frame and stays open until stopped
struct OneShotEngine {
    capturing: AtomicBool,
    hold: Mutex<Option<mpsc::Sender<AudioFrame>>>,
}

#[async_trait]
impl CaptureEngine for OneShotEngine {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(64);
        tx.send(AudioFrame {
            samples: vec![42i16; 1600],
            sample_rate: 16000,
            channels: 1,
            timestamp_ms: 0,
        })
        .await?;
        *self.hold.lock().unwrap() = Some(tx);
        self.capturing.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.capturing.store(false, Ordering::SeqCst);
        self.hold.lock().unwrap().take();
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "one-shot"
    }
}

struct OneShotFactory {
    created: AtomicUsize,
    released: AtomicUsize,
}

#[async_trait]
impl CaptureEngineFactory for OneShotFactory {
    async fn create(&self) -> Result<Box<dyn CaptureEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OneShotEngine {
            capturing: AtomicBool::new(false),
            hold: Mutex::new(None),
        }))
    }

    async fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockTransport {
    open: Arc<AtomicBool>,
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn send(&self, _frame: ControlFrame) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

struct MockConnector {
    opens: AtomicUsize,
    inbound: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl MockConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            inbound: Mutex::new(Vec::new()),
        })
    }

    async fn push_message(&self, json: &str) {
        let tx = self
            .inbound
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no open connection to push into");
        tx.send(TransportEvent::Message(json.to_string()))
            .await
            .expect("dispatch task should be listening");
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn open(
        &self,
        _session_id: &str,
    ) -> Result<(Box<dyn StreamTransport>, mpsc::Receiver<TransportEvent>)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.inbound.lock().unwrap().push(tx);
        Ok((
            Box::new(MockTransport {
                open: Arc::new(AtomicBool::new(true)),
            }),
            rx,
        ))
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    orchestrator: RecordingFlowOrchestrator,
    collaborator: Arc<MockCollaborator>,
    connector: Arc<MockConnector>,
    drafts: Arc<MemoryDrafts>,
    endpoint: Arc<AcceptAllEndpoint>,
    factory: Arc<OneShotFactory>,
    _cache_dir: TempDir,
}

fn build_fixture(granted: bool) -> Result<Fixture> {
    let cache_dir = TempDir::new()?;
    let collaborator = MockCollaborator::new();
    let connector = MockConnector::new();
    let drafts = Arc::new(MemoryDrafts::default());
    let endpoint = Arc::new(AcceptAllEndpoint {
        uploads: AtomicUsize::new(0),
    });
    let factory = Arc::new(OneShotFactory {
        created: AtomicUsize::new(0),
        released: AtomicUsize::new(0),
    });

    let streams = StreamConnectionManager::new(
        connector.clone(),
        StreamConfig {
            heartbeat_interval: Duration::from_secs(60),
            ready_timeout: Duration::from_millis(500),
            ready_poll_interval: Duration::from_millis(5),
            reconnect_base: Duration::from_millis(10),
            max_reconnect_attempts: 2,
        },
    );

    let config = FlowConfig {
        session_ready_timeout: Duration::from_millis(200),
        segmenter: SegmenterConfig {
            segment_duration: Duration::from_secs(10),
            sample_rate: 16000,
            channels: 1,
        },
        uploader: UploaderConfig {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1),
        },
        cache_dir: cache_dir.path().to_path_buf(),
    };

    let orchestrator = RecordingFlowOrchestrator::new(
        config,
        FlowDeps {
            streams,
            collaborator: collaborator.clone(),
            ingest: endpoint.clone(),
            permission: Arc::new(MockPermission { granted }),
            engine_factory: factory.clone(),
            drafts: drafts.clone(),
            notifier: Arc::new(notestream::flow::LogNotifier),
        },
    );

    Ok(Fixture {
        orchestrator,
        collaborator,
        connector,
        drafts,
        endpoint,
        factory,
        _cache_dir: cache_dir,
    })
}

/// Poll an async state accessor until it matches or the deadline passes.
async fn wait_for_state(
    orchestrator: &RecordingFlowOrchestrator,
    expected: SessionState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if orchestrator.session_state().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.session_state().await == expected
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_start_flow_happy_path() -> Result<()> {
    let fx = build_fixture(true)?;

    let session = fx
        .orchestrator
        .start_recording_flow(Some("standup notes".to_string()), None)
        .await
        .expect("flow should start");

    assert_eq!(session.kind, SessionKind::Recording);
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Active);
    assert_eq!(
        fx.orchestrator.session_state().await,
        SessionState::RecordingWaiting,
        "no transcript yet, so the machine waits"
    );
    assert_eq!(fx.collaborator.created.load(Ordering::SeqCst), 1);
    assert_eq!(
        fx.connector.opens.load(Ordering::SeqCst),
        1,
        "the transcript stream should be connected"
    );
    assert!(
        fx.factory.created.load(Ordering::SeqCst) >= 2,
        "current engine plus a pre-built standby"
    );
    assert_eq!(
        fx.drafts.load_last_session().await?.map(|s| s.id),
        Some(session.id),
        "the session should be remembered for cold start"
    );
    Ok(())
}

#[tokio::test]
async fn test_permission_denied_aborts_before_any_session() -> Result<()> {
    let fx = build_fixture(false)?;

    let result = fx.orchestrator.start_recording_flow(None, None).await;

    assert!(matches!(result, Err(FlowError::PermissionDenied)));
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Idle);
    assert_eq!(fx.orchestrator.session_state().await, SessionState::Default);
    assert_eq!(
        fx.collaborator.created.load(Ordering::SeqCst),
        0,
        "no session may be created without permission"
    );
    Ok(())
}

#[tokio::test]
async fn test_note_only_conflict_is_resolved_by_upgrade() -> Result<()> {
    let fx = build_fixture(true)?;
    *fx.collaborator.conflict.lock().unwrap() = Some(Session::new(
        "n-1",
        SessionStatus::Draft,
        SessionKind::NoteOnly,
    ));

    let session = fx
        .orchestrator
        .start_recording_flow(None, None)
        .await
        .expect("conflict with a note-only session should not fail the flow");

    assert_eq!(session.id, "n-1");
    assert_eq!(session.kind, SessionKind::Recording);
    assert_eq!(
        fx.collaborator.upgraded.lock().unwrap().as_slice(),
        ["n-1".to_string()]
    );
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Active);
    Ok(())
}

#[tokio::test]
async fn test_session_visibility_timeout_is_a_hard_failure() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.collaborator.ready.store(false, Ordering::SeqCst);

    let result = fx.orchestrator.start_recording_flow(None, None).await;

    assert!(matches!(
        result,
        Err(FlowError::SessionVisibilityTimeout(_))
    ));
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Idle);
    assert_eq!(
        fx.orchestrator.session_state().await,
        SessionState::Default,
        "a failed start unwinds back to the default state"
    );
    Ok(())
}

#[tokio::test]
async fn test_transcript_activates_recording_exactly_once() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.orchestrator.start_recording_flow(None, None).await.expect("start");

    // Whitespace-only text is filtered before it can activate anything.
    fx.connector
        .push_message(r#"{"type":"transcript_segment","text":"   "}"#)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        fx.orchestrator.session_state().await,
        SessionState::RecordingWaiting
    );
    assert!(fx.orchestrator.transcript_entries().await.is_empty());

    fx.connector
        .push_message(r#"{"type":"transcript_segment","text":"hello there","start_time":1.5}"#)
        .await;

    assert!(
        wait_for_state(
            &fx.orchestrator,
            SessionState::RecordingActive,
            Duration::from_secs(2)
        )
        .await,
        "first real transcript should activate the recording"
    );
    let entries = fx.orchestrator.transcript_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "hello there");
    assert_eq!(entries[0].formatted_time, "00:01");
    Ok(())
}

#[tokio::test]
async fn test_active_phase_activates_without_text() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.orchestrator.start_recording_flow(None, None).await.expect("start");

    fx.connector
        .push_message(r#"{"type":"phase","phase":"active"}"#)
        .await;

    assert!(
        wait_for_state(
            &fx.orchestrator,
            SessionState::RecordingActive,
            Duration::from_secs(2)
        )
        .await
    );
    assert!(fx.orchestrator.transcript_entries().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_stop_flow_moves_to_processing_and_flushes_audio() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.orchestrator.start_recording_flow(None, None).await.expect("start");

    fx.orchestrator.stop_recording_flow().await?;

    assert_eq!(
        fx.orchestrator.session_state().await,
        SessionState::Processing
    );
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Idle);
    assert!(
        fx.endpoint.uploads.load(Ordering::SeqCst) >= 1,
        "the trailing partial segment should have been uploaded"
    );
    // Stopping again is a no-op.
    fx.orchestrator.stop_recording_flow().await?;
    Ok(())
}

#[tokio::test]
async fn test_finalize_confirms_completion_with_collaborator() -> Result<()> {
    let fx = build_fixture(true)?;
    let session = fx
        .orchestrator
        .start_recording_flow(None, None)
        .await
        .expect("start");

    fx.orchestrator.stop_recording_flow().await?;
    fx.orchestrator.finalize_session().await?;

    assert_eq!(fx.orchestrator.session_state().await, SessionState::Finished);
    assert_eq!(
        fx.collaborator.finished.lock().unwrap().as_slice(),
        [session.id]
    );
    assert!(
        fx.drafts.cleared.load(Ordering::SeqCst) >= 1,
        "local draft state should be cleared on finish"
    );
    Ok(())
}

#[tokio::test]
async fn test_transcript_complete_finishes_the_session() -> Result<()> {
    let fx = build_fixture(true)?;
    let session = fx
        .orchestrator
        .start_recording_flow(None, None)
        .await
        .expect("start");

    fx.orchestrator.stop_recording_flow().await?;
    fx.connector
        .push_message(r#"{"type":"transcript_complete"}"#)
        .await;

    assert!(
        wait_for_state(
            &fx.orchestrator,
            SessionState::Finished,
            Duration::from_secs(2)
        )
        .await,
        "transcript completion should drive the finish"
    );
    assert_eq!(
        fx.collaborator.finished.lock().unwrap().as_slice(),
        [session.id]
    );
    Ok(())
}

#[tokio::test]
async fn test_new_note_clears_transcripts_after_finish() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.orchestrator.start_recording_flow(None, None).await.expect("start");

    fx.connector
        .push_message(r#"{"type":"transcript_segment","text":"some words","start_time":0.5}"#)
        .await;
    assert!(
        wait_for_state(
            &fx.orchestrator,
            SessionState::RecordingActive,
            Duration::from_secs(2)
        )
        .await
    );

    fx.orchestrator.stop_recording_flow().await?;
    fx.orchestrator.finalize_session().await?;
    assert_eq!(fx.orchestrator.session_state().await, SessionState::Finished);

    fx.orchestrator.new_note().await?;

    assert_eq!(fx.orchestrator.session_state().await, SessionState::Default);
    assert!(
        fx.orchestrator.transcript_entries().await.is_empty(),
        "a new note starts with an empty transcript log"
    );

    // And new_note from a state with no matching rule is an error.
    assert!(fx.orchestrator.new_note().await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_start_while_active_replaces_the_flow() -> Result<()> {
    let fx = build_fixture(true)?;
    let first = fx
        .orchestrator
        .start_recording_flow(None, None)
        .await
        .expect("first start");

    let second = fx
        .orchestrator
        .start_recording_flow(None, None)
        .await
        .expect("second start should replace the first flow");

    assert_ne!(first.id, second.id);
    assert_eq!(fx.orchestrator.flow_state().await, FlowState::Active);
    assert_eq!(fx.collaborator.created.load(Ordering::SeqCst), 2);
    assert!(
        fx.collaborator
            .finished
            .lock()
            .unwrap()
            .contains(&first.id),
        "the first session should have been finalized"
    );
    Ok(())
}

#[tokio::test]
async fn test_cold_start_discards_stale_local_state() -> Result<()> {
    let fx = build_fixture(true)?;
    fx.drafts
        .save_last_session(&Session::new(
            "ghost",
            SessionStatus::Active,
            SessionKind::Recording,
        ))
        .await?;

    // The collaborator knows nothing about "ghost".
    let resumed = fx.orchestrator.check_cold_start().await;

    assert!(resumed.is_none());
    assert!(
        fx.drafts.load_last_session().await?.is_none(),
        "stale state should be cleared"
    );
    Ok(())
}

#[tokio::test]
async fn test_cold_start_resumes_matching_active_session() -> Result<()> {
    let fx = build_fixture(true)?;
    let session = Session::new("live-1", SessionStatus::Active, SessionKind::Recording);
    fx.drafts.save_last_session(&session).await?;
    *fx.collaborator.active.lock().unwrap() = Some(session.clone());

    let resumed = fx.orchestrator.check_cold_start().await;

    assert_eq!(resumed.map(|s| s.id), Some("live-1".to_string()));
    Ok(())
}
