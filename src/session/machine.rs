use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::types::{SessionKind, SessionStatus, TransitionContext};

/// Session lifecycle states.
///
/// `Default` doubles as the error-recovery target: `ErrorOccurred` routes
/// back here from every state rather than introducing a terminal error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Default,
    RecordingWaiting,
    RecordingActive,
    Processing,
    Finished,
}

/// Events that can drive a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    UserStartRecording,
    UserStopRecording,
    FirstTranscriptReceived,
    SessionCreated,
    ProcessingCompleted,
    ErrorOccurred,
    UserNewNote,
}

/// Declarative commands emitted by a successful transition.
///
/// The machine never performs I/O; each command is executed by a handler
/// registered with the flow's command dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffect {
    CreateSession,
    StartRecording,
    ConnectStream,
    StopRecording,
    DisconnectStream,
    FinishSession,
    ClearTranscripts,
    ShowError,
}

/// A single condition a rule must satisfy against the current context
#[derive(Clone)]
pub enum Guard {
    /// A session must exist in the context
    SessionExists,
    /// The cached session must have this status
    SessionStatus(SessionStatus),
    /// The cached session must be of this kind
    SessionKind(SessionKind),
    /// The recording flag must match
    IsRecording(bool),
    /// At least one transcript entry must have been received
    HasTranscripts,
    /// Arbitrary predicate over the context
    Custom(fn(&TransitionContext) -> bool),
}

impl Guard {
    fn evaluate(&self, ctx: &TransitionContext) -> bool {
        match self {
            Guard::SessionExists => ctx.session.is_some(),
            Guard::SessionStatus(status) => {
                ctx.session.as_ref().map(|s| s.status) == Some(*status)
            }
            Guard::SessionKind(kind) => ctx.session.as_ref().map(|s| s.kind) == Some(*kind),
            Guard::IsRecording(expected) => ctx.is_recording == *expected,
            Guard::HasTranscripts => ctx.transcript_count > 0,
            Guard::Custom(predicate) => predicate(ctx),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Guard::SessionExists => "session exists",
            Guard::SessionStatus(_) => "session status",
            Guard::SessionKind(_) => "session kind",
            Guard::IsRecording(_) => "recording flag",
            Guard::HasTranscripts => "transcript count > 0",
            Guard::Custom(_) => "custom predicate",
        }
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// One row of the transition table.
///
/// Several rules may share the same `(from, trigger)` key; the first rule
/// whose guards all pass wins, which is how a waiting state is re-entered
/// idempotently without a dedicated retry trigger.
#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub from: SessionState,
    pub trigger: Trigger,
    pub to: SessionState,
    pub guards: Vec<Guard>,
    pub side_effects: Vec<SideEffect>,
}

/// Result of a transition attempt.
///
/// A failed attempt never panics: it carries a diagnostic reason and the
/// machine's state is left untouched.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub success: bool,
    pub new_state: SessionState,
    pub reason: Option<String>,
    pub side_effects: Vec<SideEffect>,
}

type TransitionListener = Box<dyn Fn(SessionState, &[SideEffect]) + Send + Sync>;

/// Guard-evaluated session state machine.
///
/// Pure transition logic: the only mutation `transition` performs is updating
/// `current_state` (and mirroring it into the context); every command it
/// emits is executed elsewhere.
pub struct SessionStateMachine {
    current_state: SessionState,
    context: TransitionContext,
    rules: Vec<TransitionRule>,
    listeners: Vec<TransitionListener>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            current_state: SessionState::Default,
            context: TransitionContext::default(),
            rules: default_rules(),
            listeners: Vec::new(),
        }
    }

    /// Build a machine with a custom rule table (used by tests)
    pub fn with_rules(rules: Vec<TransitionRule>) -> Self {
        Self {
            current_state: SessionState::Default,
            context: TransitionContext::default(),
            rules,
            listeners: Vec::new(),
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.current_state
    }

    pub fn context(&self) -> &TransitionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TransitionContext {
        &mut self.context
    }

    /// Register a listener notified synchronously after every successful
    /// transition with `(new_state, side_effects)`.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(SessionState, &[SideEffect]) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Pure predicate: would `transition(trigger)` succeed right now?
    pub fn can_transition(&self, trigger: Trigger) -> bool {
        self.matching_rule(trigger).is_some()
    }

    /// Attempt a transition. The only mutator of `current_state`.
    pub fn transition(&mut self, trigger: Trigger) -> TransitionOutcome {
        let rule = match self.matching_rule(trigger) {
            Some(rule) => rule.clone(),
            None => {
                let reason = self.failure_reason(trigger);
                debug!(
                    "transition rejected: {:?} in {:?} ({})",
                    trigger, self.current_state, reason
                );
                return TransitionOutcome {
                    success: false,
                    new_state: self.current_state,
                    reason: Some(reason),
                    side_effects: Vec::new(),
                };
            }
        };

        let previous = self.current_state;
        self.current_state = rule.to;
        self.context.current_state = rule.to;

        info!(
            "session state: {:?} -> {:?} on {:?} (effects: {:?})",
            previous, rule.to, trigger, rule.side_effects
        );

        for listener in &self.listeners {
            listener(self.current_state, &rule.side_effects);
        }

        TransitionOutcome {
            success: true,
            new_state: self.current_state,
            reason: None,
            side_effects: rule.side_effects,
        }
    }

    /// Convenience wrapper for callers that treat a rejected transition as a
    /// hard error. `transition` itself never fails loudly.
    pub fn try_transition(&mut self, trigger: Trigger) -> anyhow::Result<TransitionOutcome> {
        let outcome = self.transition(trigger);
        if outcome.success {
            Ok(outcome)
        } else {
            anyhow::bail!(
                "illegal transition: {}",
                outcome.reason.unwrap_or_else(|| "unknown".to_string())
            )
        }
    }

    /// Unconditionally return to `Default` with a freshly zeroed context.
    /// Usable from any state.
    pub fn reset(&mut self) {
        info!("session state machine reset from {:?}", self.current_state);
        self.current_state = SessionState::Default;
        self.context = TransitionContext::default();
    }

    fn matching_rule(&self, trigger: Trigger) -> Option<&TransitionRule> {
        self.rules.iter().find(|rule| {
            rule.from == self.current_state
                && rule.trigger == trigger
                && rule.guards.iter().all(|g| g.evaluate(&self.context))
        })
    }

    fn failure_reason(&self, trigger: Trigger) -> String {
        let candidates: Vec<&TransitionRule> = self
            .rules
            .iter()
            .filter(|rule| rule.from == self.current_state && rule.trigger == trigger)
            .collect();

        if candidates.is_empty() {
            return format!("no rule for {:?} in state {:?}", trigger, self.current_state);
        }

        // Name the guards that blocked the first candidate for diagnostics.
        let failed: Vec<&'static str> = candidates[0]
            .guards
            .iter()
            .filter(|g| !g.evaluate(&self.context))
            .map(|g| g.describe())
            .collect();

        format!(
            "guards failed for {:?} in state {:?}: {}",
            trigger,
            self.current_state,
            failed.join(", ")
        )
    }
}

/// The production rule table.
fn default_rules() -> Vec<TransitionRule> {
    let mut rules = vec![
        // Start a brand-new recording flow.
        TransitionRule {
            from: SessionState::Default,
            trigger: Trigger::UserStartRecording,
            to: SessionState::RecordingWaiting,
            guards: vec![Guard::IsRecording(false)],
            side_effects: vec![SideEffect::ClearTranscripts, SideEffect::CreateSession],
        },
        // Session confirmed by the collaborator while waiting: wire up the
        // stream and capture. Stays in RecordingWaiting until a transcript
        // (or an active phase message) arrives.
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::SessionCreated,
            to: SessionState::RecordingWaiting,
            guards: vec![
                Guard::SessionExists,
                Guard::SessionKind(SessionKind::Recording),
            ],
            side_effects: vec![SideEffect::ConnectStream, SideEffect::StartRecording],
        },
        // Retry path: a second start request while still waiting. If the
        // session already exists, re-wire it; otherwise re-create it. First
        // passing rule wins.
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::UserStartRecording,
            to: SessionState::RecordingWaiting,
            guards: vec![Guard::SessionExists, Guard::IsRecording(false)],
            side_effects: vec![SideEffect::ConnectStream, SideEffect::StartRecording],
        },
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::UserStartRecording,
            to: SessionState::RecordingWaiting,
            guards: vec![Guard::IsRecording(false)],
            side_effects: vec![SideEffect::CreateSession],
        },
        // First meaningful transcript makes the recording visibly live.
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::FirstTranscriptReceived,
            to: SessionState::RecordingActive,
            guards: vec![Guard::IsRecording(true), Guard::HasTranscripts],
            side_effects: vec![],
        },
        // An "active" phase notification counts too, even before any text
        // has arrived.
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::FirstTranscriptReceived,
            to: SessionState::RecordingActive,
            guards: vec![Guard::IsRecording(true)],
            side_effects: vec![],
        },
        // Stopping from either recording state. The stream stays connected
        // so trailing transcript results can drain.
        TransitionRule {
            from: SessionState::RecordingWaiting,
            trigger: Trigger::UserStopRecording,
            to: SessionState::Processing,
            guards: vec![Guard::IsRecording(true)],
            side_effects: vec![SideEffect::StopRecording],
        },
        TransitionRule {
            from: SessionState::RecordingActive,
            trigger: Trigger::UserStopRecording,
            to: SessionState::Processing,
            guards: vec![Guard::IsRecording(true)],
            side_effects: vec![SideEffect::StopRecording],
        },
        // Remote processing finished: now the stream can go away.
        TransitionRule {
            from: SessionState::Processing,
            trigger: Trigger::ProcessingCompleted,
            to: SessionState::Finished,
            guards: vec![Guard::SessionExists],
            side_effects: vec![SideEffect::DisconnectStream, SideEffect::FinishSession],
        },
        // Start over from a finished note.
        TransitionRule {
            from: SessionState::Finished,
            trigger: Trigger::UserNewNote,
            to: SessionState::Default,
            guards: vec![],
            side_effects: vec![SideEffect::ClearTranscripts],
        },
        TransitionRule {
            from: SessionState::Finished,
            trigger: Trigger::UserStartRecording,
            to: SessionState::RecordingWaiting,
            guards: vec![Guard::IsRecording(false)],
            side_effects: vec![SideEffect::ClearTranscripts, SideEffect::CreateSession],
        },
    ];

    // Errors route back to Default from every state, unwinding whatever may
    // still be live before surfacing the message.
    for state in [
        SessionState::Default,
        SessionState::RecordingWaiting,
        SessionState::RecordingActive,
        SessionState::Processing,
        SessionState::Finished,
    ] {
        rules.push(TransitionRule {
            from: state,
            trigger: Trigger::ErrorOccurred,
            to: SessionState::Default,
            guards: vec![],
            side_effects: vec![
                SideEffect::StopRecording,
                SideEffect::DisconnectStream,
                SideEffect::ShowError,
            ],
        });
    }

    rules
}
