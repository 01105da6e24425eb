//! Command responses: exactly one of `Success`, `Fail` or `Canceled` per
//! command execution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{downcast_message, AnyResponse, CorrelationId, Message, MessageHeader, MessageId};

/// Why a command did not succeed. Carried by [`Fail`] and serialisable so it
/// survives the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CommandFault {
    #[error("no handler is registered for `{command}`")]
    NotHandled { command: String },

    #[error("`{command}` was not acknowledged within {timeout_ms} ms")]
    AckTimeout { command: String, timeout_ms: u64 },

    #[error("`{command}` was acknowledged but did not complete within {timeout_ms} ms")]
    ResponseTimeout { command: String, timeout_ms: u64 },

    #[error("`{command}` was rejected: {reason}")]
    Rejected { command: String, reason: String },

    #[error("handler for `{command}` failed: {message}")]
    HandlerFailed { command: String, message: String },

    #[error("handler for `{command}` panicked: {message}")]
    HandlerPanicked { command: String, message: String },
}

/// Reference from a response back to the command that produced it.
///
/// The summary fields are always present; the command itself is attached
/// when the response was built locally or its type could be decoded.
#[derive(Debug, Clone)]
pub struct SourceCommand {
    id: MessageId,
    type_name: String,
    correlation_id: CorrelationId,
    command: Option<Arc<dyn Message>>,
}

impl SourceCommand {
    pub fn of(command: Arc<dyn Message>) -> Self {
        Self {
            id: command.id(),
            type_name: command.type_name().to_string(),
            correlation_id: command.correlation_id(),
            command: Some(command),
        }
    }

    /// A source known only by its identifiers.
    pub fn summary(
        id: MessageId,
        type_name: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            correlation_id,
            command: None,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn command(&self) -> Option<&Arc<dyn Message>> {
        self.command.as_ref()
    }

    pub fn downcast<T: Message>(&self) -> Option<Arc<T>> {
        self.command.as_ref().and_then(downcast_message::<T>)
    }

    fn response_header(&self) -> MessageHeader {
        MessageHeader::correlated(self.correlation_id, Some(self.id))
    }
}

/// The command completed.
#[derive(Debug, Clone, courier::Message)]
#[message(name = "courier.Success", parent = AnyResponse)]
pub struct Success {
    header: MessageHeader,
    source: SourceCommand,
}

impl Success {
    pub fn new(source: SourceCommand) -> Self {
        Self {
            header: source.response_header(),
            source,
        }
    }

    pub fn for_command<C: Message>(command: &Arc<C>) -> Self {
        let command: Arc<dyn Message> = command.clone();
        Self::new(SourceCommand::of(command))
    }

    /// Rebuild a response received from elsewhere, keeping its header.
    pub fn with_header(header: MessageHeader, source: SourceCommand) -> Self {
        Self { header, source }
    }

    pub fn source(&self) -> &SourceCommand {
        &self.source
    }
}

/// The command failed; `fault` says why.
#[derive(Debug, Clone, courier::Message)]
#[message(name = "courier.Fail", parent = AnyResponse)]
pub struct Fail {
    header: MessageHeader,
    source: SourceCommand,
    fault: CommandFault,
}

impl Fail {
    pub fn new(source: SourceCommand, fault: CommandFault) -> Self {
        Self {
            header: source.response_header(),
            source,
            fault,
        }
    }

    pub fn for_command<C: Message>(command: &Arc<C>, fault: CommandFault) -> Self {
        let command: Arc<dyn Message> = command.clone();
        Self::new(SourceCommand::of(command), fault)
    }

    pub fn with_header(header: MessageHeader, source: SourceCommand, fault: CommandFault) -> Self {
        Self {
            header,
            source,
            fault,
        }
    }

    pub fn source(&self) -> &SourceCommand {
        &self.source
    }

    pub fn fault(&self) -> &CommandFault {
        &self.fault
    }
}

/// The handler noticed a cancellation request and stopped.
#[derive(Debug, Clone, courier::Message)]
#[message(name = "courier.Canceled", parent = AnyResponse)]
pub struct Canceled {
    header: MessageHeader,
    source: SourceCommand,
}

impl Canceled {
    pub fn new(source: SourceCommand) -> Self {
        Self {
            header: source.response_header(),
            source,
        }
    }

    pub fn for_command<C: Message>(command: &Arc<C>) -> Self {
        let command: Arc<dyn Message> = command.clone();
        Self::new(SourceCommand::of(command))
    }

    pub fn with_header(header: MessageHeader, source: SourceCommand) -> Self {
        Self { header, source }
    }

    pub fn source(&self) -> &SourceCommand {
        &self.source
    }
}

/// Any one of the three responses.
#[derive(Debug, Clone)]
pub enum CommandResponse {
    Success(Arc<Success>),
    Fail(Arc<Fail>),
    Canceled(Arc<Canceled>),
}

impl CommandResponse {
    /// Classify a bus message; `None` if it is not a response.
    pub fn from_message(message: &Arc<dyn Message>) -> Option<Self> {
        if let Some(success) = downcast_message::<Success>(message) {
            return Some(CommandResponse::Success(success));
        }
        if let Some(fail) = downcast_message::<Fail>(message) {
            return Some(CommandResponse::Fail(fail));
        }
        downcast_message::<Canceled>(message).map(CommandResponse::Canceled)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandResponse::Success(_))
    }

    pub fn source(&self) -> &SourceCommand {
        match self {
            CommandResponse::Success(r) => r.source(),
            CommandResponse::Fail(r) => r.source(),
            CommandResponse::Canceled(r) => r.source(),
        }
    }

    pub fn fault(&self) -> Option<&CommandFault> {
        match self {
            CommandResponse::Fail(r) => Some(r.fault()),
            _ => None,
        }
    }

    pub fn into_message(self) -> Arc<dyn Message> {
        match self {
            CommandResponse::Success(r) => r,
            CommandResponse::Fail(r) => r,
            CommandResponse::Canceled(r) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, courier::Message)]
    #[message(name = "response.DoThing", command)]
    struct DoThing {
        header: MessageHeader,
    }

    #[test]
    fn response_shares_correlation_with_source() {
        let command = Arc::new(DoThing {
            header: MessageHeader::new(),
        });
        let success = Success::for_command(&command);

        assert_eq!(success.correlation_id(), command.correlation_id());
        assert_eq!(success.causation_id(), Some(command.id()));
        assert_eq!(success.source().id(), command.id());
        assert_eq!(success.source().type_name(), "response.DoThing");
        assert!(success.source().downcast::<DoThing>().is_some());
    }

    #[test]
    fn classifies_responses() {
        let command = Arc::new(DoThing {
            header: MessageHeader::new(),
        });
        let fail: Arc<dyn Message> = Arc::new(Fail::for_command(
            &command,
            CommandFault::Rejected {
                command: "response.DoThing".into(),
                reason: "nope".into(),
            },
        ));

        let response = CommandResponse::from_message(&fail).unwrap();
        assert!(!response.is_success());
        assert!(matches!(
            response.fault(),
            Some(CommandFault::Rejected { reason, .. }) if reason == "nope"
        ));

        let not_a_response: Arc<dyn Message> = command;
        assert!(CommandResponse::from_message(&not_a_response).is_none());
    }

    #[test]
    fn fault_messages_read_well() {
        let fault = CommandFault::AckTimeout {
            command: "orders.Place".into(),
            timeout_ms: 250,
        };
        assert_eq!(
            fault.to_string(),
            "`orders.Place` was not acknowledged within 250 ms"
        );
    }
}
