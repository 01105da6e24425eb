//! Queued Handler - ordered, single-threaded delivery to one subscriber.
//!
//! The bus delivers synchronously on the publishing thread. Wrapping a
//! subscriber in a [`QueuedHandler`] moves delivery onto one dedicated
//! worker thread fed by an unbounded FIFO channel:
//!
//! ```text
//!   producer A ─┐
//!   producer B ─┼─► enqueue ──► [ m1 | m2 | m3 | ... ] ──► worker ──► handler
//!   producer C ─┘   (never blocks)                          (one thread, FIFO)
//! ```
//!
//! On top of ordering the queue offers an idempotent mode, a slow-consumer
//! watchdog and starvation probes; see [`QueuedHandler`].

mod handler;

pub use handler::{QueueEntry, QueueError, QueueState, QueueStats, QueuedHandler};
