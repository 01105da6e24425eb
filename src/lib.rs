//! In-process messaging with an optional TCP bridge.
//!
//! - [`Bus`]: typed publish/subscribe where subscribers to a type also see
//!   its descendants.
//! - [`QueuedHandler`]: one worker thread per subscriber, strict FIFO.
//! - [`Dispatcher`]: fire a command, await its single correlated response,
//!   with ack/response timeouts and cooperative cancellation.
//! - [`transport`]: mirror selected bus traffic to another process.
//!
//! ```ignore
//! use courier::{Bus, Dispatcher, DispatcherConfig, MessageHeader};
//!
//! #[derive(Debug, courier::Message)]
//! #[message(name = "orders.PlaceOrder", command)]
//! struct PlaceOrder {
//!     header: MessageHeader,
//!     sku: String,
//! }
//!
//! let bus = Bus::new("orders");
//! let dispatcher = Dispatcher::new(bus.clone(), DispatcherConfig::default())?;
//! dispatcher.subscribe(|order: &Arc<PlaceOrder>| {
//!     println!("placing {}", order.sku);
//!     Ok(())
//! })?;
//!
//! dispatcher.fire(PlaceOrder { header: MessageHeader::new(), sku: "A-1".into() })?;
//! ```

extern crate self as courier;

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod queued;
pub mod telemetry;
#[cfg(feature = "tcp")]
pub mod transport;

mod recent;
mod sync;

pub use bus::{Bus, Publisher, Route, Subscription};
pub use config::{BackoffConfig, CourierConfig, DispatcherConfig, QueueConfig, TransportConfig};
pub use dispatcher::{
    CommandError, CommandOutcome, CommandSender, CommandState, CommandSubscription, Dispatcher,
    DispatcherError, DispatcherStats, FireOptions, HandleCommand, HandlerError, TimeoutKind,
};
pub use message::{
    downcast_message, AckCommand, AnyCommand, AnyEvent, AnyMessage, AnyResponse, CancelCommand,
    CancellationToken, Canceled, Command, CommandFault, CommandResponse, CorrelationId, Event,
    Fail, Message, MessageHeader, MessageId, MessageRegistry, MessageType, RegistryError,
    SourceCommand, Success, TypeDescriptor, TypeTag,
};
pub use queued::{QueueEntry, QueueError, QueueState, QueueStats, QueuedHandler};
#[cfg(feature = "tcp")]
pub use transport::{CodecRegistry, TcpBusClient, TcpBusServer, TransportError, TransportStats};

pub use courier_macros::Message;
