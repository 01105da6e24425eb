use serde::{Deserialize, Serialize};

use super::{Message, MessageHeader, MessageId};

/// Published by a command handler wrapper the moment it picks a command up.
///
/// Carries no outcome; it only stops the dispatcher's ack timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "courier.AckCommand")]
pub struct AckCommand {
    header: MessageHeader,
    command_id: MessageId,
    command_type: String,
}

impl AckCommand {
    pub fn for_command<M: Message + ?Sized>(command: &M) -> Self {
        Self {
            header: MessageHeader::caused_by(command),
            command_id: command.id(),
            command_type: command.type_name().to_string(),
        }
    }

    pub fn command_id(&self) -> MessageId {
        self.command_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }
}

/// Best-effort request to cancel one in-flight command.
///
/// Nothing guarantees the target handler is listening, or that it polls
/// its token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "courier.CancelCommand")]
pub struct CancelCommand {
    header: MessageHeader,
    command_id: MessageId,
    command_type: String,
}

impl CancelCommand {
    pub fn for_command<M: Message + ?Sized>(command: &M) -> Self {
        Self {
            header: MessageHeader::caused_by(command),
            command_id: command.id(),
            command_type: command.type_name().to_string(),
        }
    }

    /// Cancel request when only the command id is known.
    pub fn for_id(command_id: MessageId, command_type: impl Into<String>) -> Self {
        Self {
            header: MessageHeader::new(),
            command_id,
            command_type: command_type.into(),
        }
    }

    pub fn command_id(&self) -> MessageId {
        self.command_id
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }
}
