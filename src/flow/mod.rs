//! Recording flow orchestration
//!
//! The `RecordingFlowOrchestrator` wires the session state machine to its
//! collaborators: every side-effect command the machine emits is executed by
//! a handler registered with the `CommandDispatcher`, and external events
//! (stream messages, segment emissions, capture failures) re-enter the
//! machine as triggers.

pub mod dispatcher;
pub mod orchestrator;

pub use dispatcher::{CommandDispatcher, CommandHandler};
pub use orchestrator::{
    FlowConfig, FlowDeps, FlowError, FlowState, LogNotifier, Notifier, RecordingFlowOrchestrator,
};
