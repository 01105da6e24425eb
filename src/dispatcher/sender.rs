//! Command-sending seam for collaborators outside the messaging core.

use std::sync::Arc;

use super::outcome::CommandError;
use crate::message::{Command, MessageType, Success};

/// Anything that can run a command on its single handler.
///
/// Implemented by [`Dispatcher`](super::Dispatcher). Services depend on
/// this trait so tests can substitute a recording fake.
pub trait CommandSender: Send + Sync {
    /// Run `command` and wait for its outcome.
    fn fire_command<C>(&self, command: C) -> Result<Arc<Success>, CommandError>
    where
        C: Command + MessageType;

    /// Hand `command` off without waiting.
    fn send_command<C>(&self, command: C) -> Result<(), CommandError>
    where
        C: Command + MessageType;
}
