//! Session lifecycle management
//!
//! This module provides:
//! - The guard-evaluated `SessionStateMachine` and its side-effect commands
//! - The `Session`/`TranscriptEntry` data model and transition context
//! - Collaborator traits for the remote session service, draft persistence
//!   and the capture permission gate

pub mod collaborator;
pub mod machine;
pub mod types;

pub use collaborator::{CapturePermission, CollaboratorError, DraftStore, SessionCollaborator};
pub use machine::{
    Guard, SessionState, SessionStateMachine, SideEffect, TransitionOutcome, TransitionRule,
    Trigger,
};
pub use types::{
    format_timestamp, Session, SessionKind, SessionStatus, TranscriptEntry, TranscriptLog,
    TransitionContext,
};
