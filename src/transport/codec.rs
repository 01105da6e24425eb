//! Message bodies on the wire.
//!
//! Every frame carries one [`WirePayload`]: the sender's type name and the
//! serialized body. The receiver looks the name up in its
//! [`CodecRegistry`] to rebuild the message.
//!
//! Serializers come in two kinds:
//!
//! - **default**: [`BitcodeSerializer<T>`], added by
//!   [`CodecRegistry::register`] for any `Serialize + DeserializeOwned`
//!   message type. Registering also records the type with the process
//!   type registry, so names resolve to tags on the receiving side.
//! - **custom**: anything added with [`CodecRegistry::register_custom`].
//!   Custom serializers are consulted before defaults.
//!
//! Responses use built-in custom serializers: the source command is
//! embedded as a nested payload when its type has a codec, and otherwise
//! reduced to its id, type name and correlation id.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::Bus;
use crate::message::{
    AckCommand, CancelCommand, Canceled, CommandFault, CorrelationId, Fail, Message,
    MessageHeader, MessageId, MessageRegistry, MessageType, RegistryError, SourceCommand, Success,
};
use crate::sync::{read, write};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no serializer registered for `{0}`")]
    UnknownType(String),

    #[error("serializer for `{expected}` was given a `{actual}`")]
    TypeMismatch { expected: String, actual: String },

    #[error("encoding `{type_name}` failed: {source}")]
    Encode {
        type_name: String,
        #[source]
        source: bitcode::Error,
    },

    #[error("decoding `{type_name}` failed: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: bitcode::Error,
    },

    #[error("malformed `{type_name}`: {reason}")]
    Malformed { type_name: String, reason: String },
}

/// One frame's worth of message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub type_name: String,
    pub body: Vec<u8>,
}

const ENVELOPE: &str = "courier.WirePayload";

impl WirePayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        bitcode::serialize(self).map_err(|source| CodecError::Encode {
            type_name: ENVELOPE.to_string(),
            source,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        bitcode::deserialize(bytes).map_err(|source| CodecError::Decode {
            type_name: ENVELOPE.to_string(),
            source,
        })
    }
}

/// Turns one message type into bytes and back.
///
/// The registry is passed in so a serializer can encode nested messages
/// with whatever codecs the process knows.
pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, message: &dyn Message, codecs: &CodecRegistry) -> Result<Vec<u8>, CodecError>;

    fn deserialize(&self, body: &[u8], codecs: &CodecRegistry) -> Result<Arc<dyn Message>, CodecError>;
}

/// Default serializer: the message's own serde impl, encoded with bitcode.
pub struct BitcodeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BitcodeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BitcodeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageSerializer for BitcodeSerializer<T>
where
    T: Message + MessageType + Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &dyn Message, _codecs: &CodecRegistry) -> Result<Vec<u8>, CodecError> {
        let typed = message
            .as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| CodecError::TypeMismatch {
                expected: T::NAME.to_string(),
                actual: message.type_name().to_string(),
            })?;
        bitcode::serialize(typed).map_err(|source| CodecError::Encode {
            type_name: T::NAME.to_string(),
            source,
        })
    }

    fn deserialize(&self, body: &[u8], _codecs: &CodecRegistry) -> Result<Arc<dyn Message>, CodecError> {
        let message: T = bitcode::deserialize(body).map_err(|source| CodecError::Decode {
            type_name: T::NAME.to_string(),
            source,
        })?;
        Ok(Arc::new(message))
    }
}

/// Name-keyed serializers for one process.
pub struct CodecRegistry {
    types: Arc<MessageRegistry>,
    defaults: RwLock<HashMap<String, Arc<dyn MessageSerializer>>>,
    custom: RwLock<HashMap<String, Arc<dyn MessageSerializer>>>,
}

impl CodecRegistry {
    /// A registry that already knows the control messages and responses.
    pub fn new(types: Arc<MessageRegistry>) -> Result<Self, RegistryError> {
        let codecs = Self {
            types,
            defaults: RwLock::new(HashMap::new()),
            custom: RwLock::new(HashMap::new()),
        };

        codecs.register::<AckCommand>()?;
        codecs.register::<CancelCommand>()?;

        codecs.types.register::<Success>()?;
        codecs.types.register::<Fail>()?;
        codecs.types.register::<Canceled>()?;
        codecs.register_custom(Success::NAME, ResponseSerializer::new(ResponseKind::Success));
        codecs.register_custom(Fail::NAME, ResponseSerializer::new(ResponseKind::Fail));
        codecs.register_custom(Canceled::NAME, ResponseSerializer::new(ResponseKind::Canceled));

        Ok(codecs)
    }

    /// Codecs sharing `bus`'s type registry.
    pub fn for_bus(bus: &Bus) -> Result<Self, RegistryError> {
        Self::new(Arc::clone(bus.registry()))
    }

    pub fn types(&self) -> &Arc<MessageRegistry> {
        &self.types
    }

    /// Add the default serializer for `T` and record `T` with the type
    /// registry.
    pub fn register<T>(&self) -> Result<(), RegistryError>
    where
        T: Message + MessageType + Serialize + DeserializeOwned,
    {
        self.types.register::<T>()?;
        write(&self.defaults).insert(
            T::NAME.to_string(),
            Arc::new(BitcodeSerializer::<T>::new()),
        );
        Ok(())
    }

    /// Override the encoding of `name`. The type still has to be known to
    /// the type registry for inbound filtering by ancestor.
    pub fn register_custom<S>(&self, name: impl Into<String>, serializer: S)
    where
        S: MessageSerializer + 'static,
    {
        write(&self.custom).insert(name.into(), Arc::new(serializer));
    }

    pub fn serializer_for(&self, name: &str) -> Option<Arc<dyn MessageSerializer>> {
        if let Some(serializer) = read(&self.custom).get(name) {
            return Some(Arc::clone(serializer));
        }
        read(&self.defaults).get(name).cloned()
    }

    pub fn knows(&self, name: &str) -> bool {
        self.serializer_for(name).is_some()
    }

    pub fn encode(&self, message: &dyn Message) -> Result<WirePayload, CodecError> {
        let type_name = message.type_name();
        let serializer = self
            .serializer_for(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_string()))?;
        Ok(WirePayload {
            type_name: type_name.to_string(),
            body: serializer.serialize(message, self)?,
        })
    }

    pub fn decode(&self, payload: &WirePayload) -> Result<Arc<dyn Message>, CodecError> {
        let serializer = self
            .serializer_for(&payload.type_name)
            .ok_or_else(|| CodecError::UnknownType(payload.type_name.clone()))?;
        serializer.deserialize(&payload.body, self)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = read(&self.defaults).keys().cloned().collect();
        names.extend(read(&self.custom).keys().cloned());
        names.sort();
        names.dedup();
        f.debug_struct("CodecRegistry").field("types", &names).finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum ResponseKind {
    Success,
    Fail,
    Canceled,
}

impl ResponseKind {
    fn name(self) -> &'static str {
        match self {
            ResponseKind::Success => Success::NAME,
            ResponseKind::Fail => Fail::NAME,
            ResponseKind::Canceled => Canceled::NAME,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseWire {
    header: MessageHeader,
    source_id: MessageId,
    source_type: String,
    source_correlation: CorrelationId,
    source: Option<WirePayload>,
    fault: Option<CommandFault>,
}

struct ResponseSerializer {
    kind: ResponseKind,
}

impl ResponseSerializer {
    fn new(kind: ResponseKind) -> Self {
        Self { kind }
    }

    fn mismatch(&self, message: &dyn Message) -> CodecError {
        CodecError::TypeMismatch {
            expected: self.kind.name().to_string(),
            actual: message.type_name().to_string(),
        }
    }
}

impl MessageSerializer for ResponseSerializer {
    fn serialize(&self, message: &dyn Message, codecs: &CodecRegistry) -> Result<Vec<u8>, CodecError> {
        let any = message.as_any();
        let (source, fault) = match self.kind {
            ResponseKind::Success => {
                let r = any.downcast_ref::<Success>().ok_or_else(|| self.mismatch(message))?;
                (r.source(), None)
            }
            ResponseKind::Fail => {
                let r = any.downcast_ref::<Fail>().ok_or_else(|| self.mismatch(message))?;
                (r.source(), Some(r.fault().clone()))
            }
            ResponseKind::Canceled => {
                let r = any.downcast_ref::<Canceled>().ok_or_else(|| self.mismatch(message))?;
                (r.source(), None)
            }
        };

        // A source without a codec travels as its summary only.
        let nested = source
            .command()
            .and_then(|command| codecs.encode(command.as_ref()).ok());

        let wire = ResponseWire {
            header: message.header().clone(),
            source_id: source.id(),
            source_type: source.type_name().to_string(),
            source_correlation: source.correlation_id(),
            source: nested,
            fault,
        };
        bitcode::serialize(&wire).map_err(|source| CodecError::Encode {
            type_name: self.kind.name().to_string(),
            source,
        })
    }

    fn deserialize(&self, body: &[u8], codecs: &CodecRegistry) -> Result<Arc<dyn Message>, CodecError> {
        let wire: ResponseWire = bitcode::deserialize(body).map_err(|source| CodecError::Decode {
            type_name: self.kind.name().to_string(),
            source,
        })?;

        let source = match wire.source.as_ref().map(|payload| codecs.decode(payload)) {
            Some(Ok(command)) => SourceCommand::of(command),
            _ => SourceCommand::summary(wire.source_id, wire.source_type, wire.source_correlation),
        };

        Ok(match self.kind {
            ResponseKind::Success => Arc::new(Success::with_header(wire.header, source)),
            ResponseKind::Canceled => Arc::new(Canceled::with_header(wire.header, source)),
            ResponseKind::Fail => {
                let fault = wire.fault.ok_or_else(|| CodecError::Malformed {
                    type_name: Fail::NAME.to_string(),
                    reason: "missing fault".to_string(),
                })?;
                Arc::new(Fail::with_header(wire.header, source, fault))
            }
        })
    }
}
