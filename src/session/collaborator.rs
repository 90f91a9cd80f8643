use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::Session;

/// Failures from the remote session service.
///
/// `Conflict` is its own variant so the orchestrator can resolve it by
/// reusing or upgrading the existing session instead of aborting the flow.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("session conflict: an active session already exists")]
    Conflict { existing: Option<Session> },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session service error: {0}")]
    Remote(String),
}

/// Contract for the remote service that owns session records.
///
/// Implemented elsewhere; the core only consumes it. All status transitions
/// on the returned `Session` values reflect remote confirmation.
#[async_trait]
pub trait SessionCollaborator: Send + Sync {
    /// Create a new recording session, optionally seeded with a title and
    /// draft content.
    async fn create_recording_session(
        &self,
        title: Option<&str>,
        content: Option<&str>,
    ) -> Result<Session, CollaboratorError>;

    /// Upgrade a note-only session to a recording session.
    async fn upgrade_to_recording(&self, session_id: &str) -> Result<Session, CollaboratorError>;

    /// Finalize a session (recording uploaded, processing may continue
    /// remotely).
    async fn finish_session(&self, session_id: &str) -> Result<(), CollaboratorError>;

    /// Return the currently active session, if one exists.
    async fn check_active_session(&self) -> Result<Option<Session>, CollaboratorError>;

    /// Delete a session record.
    async fn delete_session(&self, session_id: &str) -> Result<(), CollaboratorError>;

    /// Block until the session is visible to subsequent reads, up to
    /// `timeout`. Returns false if the deadline elapses first.
    async fn wait_for_session_ready(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<bool, CollaboratorError>;
}

/// Local draft persistence, owned by an excluded collaborator.
///
/// Keyed by fixed well-known names; only consulted on cold start to decide
/// whether to resume or discard state. Not part of the core's correctness.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn save_draft(&self, content: &str) -> anyhow::Result<()>;

    async fn load_draft(&self) -> anyhow::Result<Option<String>>;

    async fn save_last_session(&self, session: &Session) -> anyhow::Result<()>;

    async fn load_last_session(&self) -> anyhow::Result<Option<Session>>;

    async fn clear(&self) -> anyhow::Result<()>;
}

/// Capture permission gate (microphone access prompt on a real platform).
#[async_trait]
pub trait CapturePermission: Send + Sync {
    /// Request permission; returns false on denial.
    async fn request(&self) -> anyhow::Result<bool>;
}
