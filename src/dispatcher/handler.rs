//! Command handlers and the wrapper that turns their results into responses.

use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, error};

use super::dispatcher::DispatcherCore;
use crate::bus::Bus;
use crate::message::{
    AckCommand, Canceled, Command, CommandFault, Fail, Message, MessageType, Success,
};
use crate::sync::panic_message;

/// What a command handler returns instead of `Ok(())`.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler noticed its cancellation token and stopped.
    #[error("canceled")]
    Canceled,

    /// The command was understood and refused.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Failed(#[from] Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HandlerError::Rejected(reason.into())
    }

    pub fn failed(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        HandlerError::Failed(err.into())
    }
}

/// The single handler registered for command type `C`.
///
/// Runs on the command type's own queue worker, so `&mut self` is never
/// contended. Any `FnMut(&Arc<C>) -> Result<(), HandlerError>` closure is a
/// handler.
pub trait HandleCommand<C>: Send + 'static {
    fn handle(&mut self, command: &Arc<C>) -> Result<(), HandlerError>;
}

impl<C, F> HandleCommand<C> for F
where
    F: FnMut(&Arc<C>) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(&mut self, command: &Arc<C>) -> Result<(), HandlerError> {
        self(command)
    }
}

/// Ack, run the handler, publish exactly one response.
pub(crate) fn run_command<C, H>(
    bus: &Bus,
    core: &Weak<DispatcherCore>,
    handler: &mut H,
    command: Arc<C>,
) where
    C: Command + MessageType,
    H: HandleCommand<C>,
{
    let id = command.id();
    bus.publish(AckCommand::for_command(command.as_ref()));

    let token = command.cancel_token().cloned();
    if let (Some(token), Some(core)) = (&token, core.upgrade()) {
        core.register_token(id, token.clone());
    }

    let response: Arc<dyn Message> = if command.is_canceled() {
        debug!(command_id = %id, command = C::NAME, "canceled before the handler ran");
        Arc::new(Canceled::for_command(&command))
    } else {
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&command))) {
            Ok(Ok(())) => Arc::new(Success::for_command(&command)),
            Ok(Err(HandlerError::Canceled)) => Arc::new(Canceled::for_command(&command)),
            Ok(Err(HandlerError::Rejected(reason))) => Arc::new(Fail::for_command(
                &command,
                CommandFault::Rejected {
                    command: C::NAME.to_string(),
                    reason,
                },
            )),
            Ok(Err(HandlerError::Failed(err))) => Arc::new(Fail::for_command(
                &command,
                CommandFault::HandlerFailed {
                    command: C::NAME.to_string(),
                    message: err.to_string(),
                },
            )),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(command_id = %id, command = C::NAME, panic = %message, "command handler panicked");
                Arc::new(Fail::for_command(
                    &command,
                    CommandFault::HandlerPanicked {
                        command: C::NAME.to_string(),
                        message,
                    },
                ))
            }
        }
    };

    if token.is_some() {
        if let Some(core) = core.upgrade() {
            core.release_token(&id);
        }
    }

    bus.publish_arc(response);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_handlers() {
        fn assert_handler<C, H: HandleCommand<C>>(_: &H) {}
        let handler = |_: &Arc<u32>| -> Result<(), HandlerError> { Ok(()) };
        assert_handler::<u32, _>(&handler);
    }

    #[test]
    fn handler_error_constructors() {
        assert_eq!(HandlerError::rejected("no stock").to_string(), "rejected: no stock");
        assert_eq!(HandlerError::failed("disk full").to_string(), "disk full");
        assert!(matches!(HandlerError::Canceled, HandlerError::Canceled));
    }
}
