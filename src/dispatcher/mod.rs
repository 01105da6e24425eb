//! Command Dispatcher - "fire and await one correlated response".
//!
//! ```text
//!  caller ── fire(cmd) ─┐
//!                       │ pending[cmd.id] = Submitted
//!                       ▼
//!              dispatcher outbound queue ── publish ──► Bus
//!                                                        │
//!                              ┌─────────────────────────┘
//!                              ▼
//!                  per-type QueuedHandler<C>
//!                   1. publish AckCommand          ──► pending → Acked
//!                   2. handler.handle(&cmd)
//!                   3. publish Success | Fail | Canceled ──► pending removed,
//!                                                            caller wakes
//! ```
//!
//! The caller never delivers its own command, so a handler that publishes
//! back into the same bus during the call cannot deadlock it.
//!
//! ## Cancellation
//!
//! Commands may carry a [`CancellationToken`](crate::CancellationToken).
//! [`Dispatcher::request_cancel`] broadcasts a `CancelCommand`; every
//! dispatcher holding the target's token flips it, and a cooperative
//! handler returns [`HandlerError::Canceled`]. Nested commands built with a
//! clone of the same token are canceled together.

#[allow(clippy::module_inception)]
mod dispatcher;
mod handler;
mod outcome;
mod sender;

pub use dispatcher::{CommandSubscription, Dispatcher};
pub use handler::{HandleCommand, HandlerError};
pub use outcome::{
    CommandError, CommandOutcome, CommandState, DispatcherError, DispatcherStats, FireOptions,
    TimeoutKind,
};
pub use sender::CommandSender;
