//! Bus - in-process publish/subscribe keyed by message type.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Bus                                │
//! │  subscribe::<T>() / subscribe_family::<F>() / publish()     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │  routes by TypeTag
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   runtime type tag + every ancestor tag (MessageRegistry)   │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//!          ▼                  ▼                     ▼
//! ┌─────────────┐    ┌──────────────────┐   ┌────────────────────┐
//! │ plain route │    │  QueuedHandler   │   │  TCP transport     │
//! │ (caller's   │    │  (own worker,    │   │  (outbound queue   │
//! │  thread)    │    │   FIFO)          │   │   per connection)  │
//! └─────────────┘    └──────────────────┘   └────────────────────┘
//! ```
//!
//! Collaborators that only need to publish depend on the [`Publisher`] seam.

#[allow(clippy::module_inception)]
mod bus;
mod publisher;

pub use bus::{Bus, Route, Subscription};
pub use publisher::Publisher;
