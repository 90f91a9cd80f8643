pub mod audio;
pub mod config;
pub mod flow;
pub mod session;
pub mod stream;
pub mod upload;

pub use audio::{AudioFrame, AudioSegment, AudioSegmenter, CaptureEngine, CaptureEngineFactory};
pub use config::Config;
pub use flow::{FlowConfig, FlowDeps, FlowError, FlowState, RecordingFlowOrchestrator};
pub use session::{
    Session, SessionCollaborator, SessionKind, SessionState, SessionStateMachine, SessionStatus,
    SideEffect, TranscriptEntry, Trigger,
};
pub use stream::{StreamConfig, StreamConnectionManager, StreamEvent};
pub use upload::{IngestionEndpoint, SegmentCache, SegmentUploader};
