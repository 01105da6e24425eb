//! Message model: the vocabulary every other module speaks.
//!
//! A message is any `Send + Sync` struct that carries a [`MessageHeader`] and
//! implements [`Message`] (usually through `#[derive(Message)]`). Each
//! concrete type also implements [`MessageType`], which gives it a stable
//! wire name and a *declared* place in the message hierarchy:
//!
//! ```text
//! AnyMessage
//!  ├── AnyCommand ── user commands
//!  ├── AnyEvent ──── user events
//!  ├── AnyResponse ─ Success, Fail, Canceled
//!  ├── AckCommand
//!  └── CancelCommand
//! ```
//!
//! Subscribing to a parent type receives every descendant. The hierarchy is
//! resolved once, at registration time, by the [`MessageRegistry`].
//!
//! ## Example
//!
//! ```ignore
//! use courier::{Message, MessageHeader};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Message)]
//! #[message(name = "orders.OrderPlaced", event)]
//! struct OrderPlaced {
//!     header: MessageHeader,
//!     order_id: String,
//! }
//! ```

mod cancellation;
mod control;
mod ids;
mod registry;
mod response;

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use cancellation::CancellationToken;
pub use control::{AckCommand, CancelCommand};
pub use ids::{CorrelationId, MessageId};
pub use registry::{MessageRegistry, RegistryError, TypeTag};
pub use response::{Canceled, CommandFault, CommandResponse, Fail, SourceCommand, Success};

/// Identity and causality metadata carried by every message.
///
/// Headers are created once, with the message, and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    id: MessageId,
    correlation_id: CorrelationId,
    causation_id: Option<MessageId>,
}

impl MessageHeader {
    /// Header for a root message: it starts its own correlation chain.
    pub fn new() -> Self {
        let id = MessageId::new();
        Self {
            id,
            correlation_id: id.into(),
            causation_id: None,
        }
    }

    /// Header for a message caused by `parent`.
    ///
    /// Inherits the parent's correlation id and records the parent as the
    /// immediate cause.
    pub fn caused_by<M: Message + ?Sized>(parent: &M) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id: parent.correlation_id(),
            causation_id: Some(parent.id()),
        }
    }

    /// Header with explicit correlation and causation.
    pub fn correlated(correlation_id: CorrelationId, causation_id: Option<MessageId>) -> Self {
        Self {
            id: MessageId::new(),
            correlation_id,
            causation_id,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<MessageId> {
        self.causation_id
    }

    /// True when this header starts its own correlation chain.
    pub fn is_root(&self) -> bool {
        self.causation_id.is_none() && self.correlation_id.as_uuid() == self.id.as_uuid()
    }
}

impl Default for MessageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Static description of a message type: identity, name, declared parents.
#[derive(Clone, Copy)]
pub struct TypeDescriptor {
    type_id: TypeId,
    name: &'static str,
    parents: fn() -> Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    pub fn of<T: MessageType>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
            parents: T::parents,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parents(&self) -> Vec<TypeDescriptor> {
        (self.parents)()
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TypeDescriptor {}

/// A type that can be subscribed to: a concrete message or an abstract family.
pub trait MessageType: 'static {
    /// Name used in the registry and on the wire. Must be unique per process.
    const NAME: &'static str;

    /// Direct parents in the declared hierarchy.
    fn parents() -> Vec<TypeDescriptor> {
        Vec::new()
    }

    fn descriptor() -> TypeDescriptor
    where
        Self: Sized,
    {
        TypeDescriptor::of::<Self>()
    }
}

/// A message instance. Implemented by `#[derive(Message)]`.
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn header(&self) -> &MessageHeader;

    /// Descriptor of the concrete runtime type.
    fn descriptor(&self) -> TypeDescriptor;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn id(&self) -> MessageId {
        self.header().id()
    }

    fn correlation_id(&self) -> CorrelationId {
        self.header().correlation_id()
    }

    fn causation_id(&self) -> Option<MessageId> {
        self.header().causation_id()
    }

    fn type_name(&self) -> &'static str {
        self.descriptor().name()
    }
}

/// A request for something to happen, handled by exactly one handler.
pub trait Command: Message {
    /// Token a cooperative handler polls to notice cancellation.
    fn cancel_token(&self) -> Option<&CancellationToken> {
        None
    }

    fn is_canceled(&self) -> bool {
        self.cancel_token().map(|t| t.is_canceled()).unwrap_or(false)
    }
}

/// A fact that already happened.
pub trait Event: Message {}

/// Root of the hierarchy. Subscribing to it sees every message.
pub struct AnyMessage;

impl MessageType for AnyMessage {
    const NAME: &'static str = "courier.Message";
}

/// Family of every command.
pub struct AnyCommand;

impl MessageType for AnyCommand {
    const NAME: &'static str = "courier.Command";

    fn parents() -> Vec<TypeDescriptor> {
        vec![AnyMessage::descriptor()]
    }
}

/// Family of every event.
pub struct AnyEvent;

impl MessageType for AnyEvent {
    const NAME: &'static str = "courier.Event";

    fn parents() -> Vec<TypeDescriptor> {
        vec![AnyMessage::descriptor()]
    }
}

/// Family of `Success`, `Fail` and `Canceled`.
pub struct AnyResponse;

impl MessageType for AnyResponse {
    const NAME: &'static str = "courier.CommandResponse";

    fn parents() -> Vec<TypeDescriptor> {
        vec![AnyMessage::descriptor()]
    }
}

/// Recover the concrete type behind a shared message.
pub fn downcast_message<T: Message>(message: &Arc<dyn Message>) -> Option<Arc<T>> {
    Arc::clone(message).into_any().downcast::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, courier::Message)]
    #[message(name = "test.Ping", command)]
    struct Ping {
        header: MessageHeader,
        #[message(cancel_token)]
        token: Option<CancellationToken>,
    }

    #[derive(Debug, Clone, courier::Message)]
    #[message(name = "test.Ponged", event)]
    struct Ponged {
        header: MessageHeader,
    }

    #[test]
    fn root_header_correlates_to_itself() {
        let header = MessageHeader::new();
        assert!(header.is_root());
        assert_eq!(header.correlation_id().as_uuid(), header.id().as_uuid());
    }

    #[test]
    fn caused_by_inherits_correlation() {
        let ping = Ping {
            header: MessageHeader::new(),
            token: None,
        };
        let ponged = Ponged {
            header: MessageHeader::caused_by(&ping),
        };

        assert_eq!(ponged.correlation_id(), ping.correlation_id());
        assert_eq!(ponged.causation_id(), Some(ping.id()));
        assert!(!ponged.header().is_root());
    }

    #[test]
    fn derive_declares_family() {
        let parents = <Ping as MessageType>::parents();
        assert_eq!(parents, vec![AnyCommand::descriptor()]);
        assert_eq!(Ping::NAME, "test.Ping");
    }

    #[test]
    fn cancel_token_is_exposed() {
        let token = CancellationToken::new();
        let ping = Ping {
            header: MessageHeader::new(),
            token: Some(token.clone()),
        };
        assert!(!ping.is_canceled());
        token.cancel();
        assert!(ping.is_canceled());
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let message: Arc<dyn Message> = Arc::new(Ponged {
            header: MessageHeader::new(),
        });
        assert!(downcast_message::<Ponged>(&message).is_some());
        assert!(downcast_message::<Ping>(&message).is_none());
        assert_eq!(message.type_name(), "test.Ponged");
    }
}
