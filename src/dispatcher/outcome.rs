use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::message::{Canceled, CommandFault, CommandResponse, Fail, RegistryError, Success};
use crate::queued::QueueError;

/// Where an in-flight command is in its life.
///
/// ```text
/// Submitted ──► Acked ──► Succeeded | Failed | Canceled
///     │           └─────► TimedOutNoResponse
///     └─────────────────► TimedOutNoAck
/// ```
///
/// A response that beats its own ack moves straight from `Submitted` to a
/// response state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Submitted,
    Acked,
    Succeeded,
    Failed,
    Canceled,
    TimedOutNoAck,
    TimedOutNoResponse,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandState::Submitted | CommandState::Acked)
    }

    /// Terminal because a response arrived (as opposed to a timeout).
    pub(crate) fn is_responded(self) -> bool {
        matches!(
            self,
            CommandState::Succeeded | CommandState::Failed | CommandState::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No handler picked the command up.
    NoAck,
    /// A handler picked it up but did not finish.
    NoResponse,
}

/// Result of executing a command, returned by value.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Succeeded(Arc<Success>),
    Failed(Arc<Fail>),
    Canceled(Arc<Canceled>),
    TimedOut(TimeoutKind),
    NotHandled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded(_))
    }
}

impl From<CommandResponse> for CommandOutcome {
    fn from(response: CommandResponse) -> Self {
        match response {
            CommandResponse::Success(r) => CommandOutcome::Succeeded(r),
            CommandResponse::Fail(r) => CommandOutcome::Failed(r),
            CommandResponse::Canceled(r) => CommandOutcome::Canceled(r),
        }
    }
}

/// Per-call overrides of the configured timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireOptions {
    pub ack_timeout: Option<Duration>,
    pub response_timeout: Option<Duration>,
}

impl FireOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }
}

/// Why `fire` did not return a `Success`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no handler is registered for `{command}`")]
    NotHandled { command: String },

    #[error("`{command}` was not picked up within {timeout:?}")]
    AckTimeout { command: String, timeout: Duration },

    #[error("`{command}` was picked up but did not finish within {timeout:?}")]
    ResponseTimeout { command: String, timeout: Duration },

    #[error("`{command}` was canceled")]
    Canceled { command: String },

    #[error(transparent)]
    Failed(#[from] CommandFault),
}

/// Setup errors from dispatcher construction and handler registration.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("a handler for `{command}` is already registered")]
    DuplicateHandler { command: &'static str },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Counters for one dispatcher.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub fired: u64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub canceled: u64,
    pub not_handled: u64,
    pub ack_timeouts: u64,
    pub response_timeouts: u64,
    /// Responses for a command that was already resolved by a response.
    pub oversubscribed: u64,
    /// Responses that arrived after their command timed out.
    pub late_responses: u64,
}
