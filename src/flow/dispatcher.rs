use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::session::SideEffect;

/// An async handler for one side-effect command
pub type CommandHandler = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps each declarative side-effect command to a registered async handler.
///
/// The state machine stays free of I/O: it emits commands, and this
/// dispatcher awaits the matching handler for each. Handler failures are
/// logged here; whether a failure re-enters the machine as `ErrorOccurred`
/// is the handler's own decision.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: HashMap<SideEffect, CommandHandler>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, effect: SideEffect, handler: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.handlers.insert(effect, Box::new(handler));
    }

    /// Execute the commands of one transition, in order, awaiting each.
    pub async fn dispatch(&self, effects: &[SideEffect]) {
        for effect in effects {
            match self.handlers.get(effect) {
                Some(handler) => {
                    debug!("dispatching side effect {:?}", effect);
                    if let Err(e) = handler().await {
                        error!("side effect {:?} failed: {:#}", effect, e);
                    }
                }
                None => warn!("no handler registered for side effect {:?}", effect),
            }
        }
    }
}
