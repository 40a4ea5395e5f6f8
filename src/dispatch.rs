//! Command fan-out to registered handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::answer::Answer;
use crate::command::Command;

/// A component willing to execute some kinds of [`Command`].
///
/// `accept` must be cheap and side-effect free; `handle` is only invoked
/// for commands the handler accepted and must record every outcome on the
/// given answer.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Whether this handler executes the given command.
    fn accept(&self, command: &Command) -> bool;

    /// Executes the command, recording outcomes on `answer`.
    async fn handle(&self, command: &Command, answer: &Arc<Answer>);
}

/// Routes each dispatched command to every handler that accepts it.
///
/// Handlers run in registration order. The dispatcher records one command
/// on the answer per accepting handler before invoking it, so the answer's
/// command count is stable by the time any handler produces results.
#[derive(Default)]
pub struct CommandDispatcher {
    handlers: Vec<Arc<dyn CommandHandler>>,
}

impl CommandDispatcher {
    /// Creates a dispatcher with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. Later registrations run later.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        debug!(handler = handler.name(), "registering command handler");
        self.handlers.push(handler);
    }

    /// Fans the command out to every accepting handler.
    ///
    /// If no handler accepts, the answer stays empty and is marked updated
    /// so a waiter observes the (vacuously complete) outcome immediately.
    pub async fn dispatch(&self, command: &Command, answer: &Arc<Answer>) {
        let accepting: Vec<&Arc<dyn CommandHandler>> = self
            .handlers
            .iter()
            .filter(|h| h.accept(command))
            .collect();

        trace!(
            command = command.name(),
            handlers = accepting.len(),
            "dispatching command"
        );

        if accepting.is_empty() {
            debug!(command = command.name(), "no handler accepted command");
            answer.notify_updated();
            return;
        }

        for _ in 0..accepting.len() {
            answer.add_command();
        }
        for handler in accepting {
            handler.handle(command, answer).await;
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
