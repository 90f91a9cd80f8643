use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a session, as confirmed by the remote collaborator.
///
/// The core never guesses a status locally; it caches whatever the
/// collaborator last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Active,
    Processing,
    Completed,
    Error,
}

/// What kind of session this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Text-only note, no audio attached
    NoteOnly,
    /// Note with a live recording
    Recording,
}

/// Cached copy of the server-tracked session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier
    pub id: String,

    /// Last confirmed lifecycle status
    pub status: SessionStatus,

    /// Session kind (note-only sessions can be upgraded to recording)
    pub kind: SessionKind,
}

impl Session {
    pub fn new(id: impl Into<String>, status: SessionStatus, kind: SessionKind) -> Self {
        Self {
            id: id.into(),
            status,
            kind,
        }
    }
}

/// A single transcript entry received from the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Offset of this entry from the start of the recording, in seconds
    pub start_time_seconds: f64,

    /// Human-readable "mm:ss" rendering of the start time
    pub formatted_time: String,

    /// Transcribed text
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(start_time_seconds: f64, text: impl Into<String>) -> Self {
        Self {
            start_time_seconds,
            formatted_time: format_timestamp(start_time_seconds),
            text: text.into(),
        }
    }
}

/// Render a second offset as "mm:ss"
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Append-only transcript log.
///
/// Entries are appended in arrival order and never mutated afterwards, with
/// one exception: an entry whose start time matches the tail entry's start
/// time merges its text into the tail instead of appending a duplicate row.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, merging into the tail when start times are adjacent.
    ///
    /// Empty or whitespace-only text is rejected upstream by the stream
    /// dispatcher; this method still guards against it so the log can never
    /// hold a meaningless entry.
    pub fn append(&mut self, entry: TranscriptEntry) {
        if entry.text.trim().is_empty() {
            return;
        }

        if let Some(tail) = self.entries.last_mut() {
            if (tail.start_time_seconds - entry.start_time_seconds).abs() < f64::EPSILON {
                tail.text.push(' ');
                tail.text.push_str(entry.text.trim());
                return;
            }
        }

        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The single source of truth consulted by every transition guard.
///
/// Mutated only by the orchestrator, and only in response to confirmed
/// external events — never optimistically for guard-relevant fields. The
/// machine itself mirrors `current_state` here after each transition.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Mirror of the machine's current state
    pub current_state: crate::session::machine::SessionState,

    /// Whether audio capture is currently running
    pub is_recording: bool,

    /// Number of transcript entries received so far
    pub transcript_count: usize,

    /// Cached copy of the backing session, if one exists
    pub session: Option<Session>,

    /// Last surfaced error message, if any
    pub error: Option<String>,

    /// Title requested for the next session to be created
    pub pending_session_title: Option<String>,
}

impl Default for TransitionContext {
    fn default() -> Self {
        Self {
            current_state: crate::session::machine::SessionState::Default,
            is_recording: false,
            transcript_count: 0,
            session: None,
            error: None,
            pending_session_title: None,
        }
    }
}

/// Timestamped marker for when a flow-visible event happened
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
