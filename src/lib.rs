//! Smallware Rendezvous
//!
//! This library pairs producers that submit requests with consumers that
//! process them and send back responses, across any number of tokio tasks
//! and threads.
//!
//! # Overview
//!
//! A producer calls [`FifoQueue::enqueue()`] and waits for the response. A
//! consumer calls [`FifoQueue::dequeue()`], receives a [`RequestItem`], does
//! the work and finishes the item with exactly one terminal call. Whichever
//! side arrives first waits for the other.
//!
//! ```text
//! ┌──────────────┐  enqueue(req)  ┌──────────────┐   dequeue()    ┌──────────────┐
//! │  Producer    │───────────────►│  FifoQueue   │◄───────────────│  Consumer    │
//! │              │                │  (Matcher)   │───── item ────►│              │
//! │              │◄──────────────────── item.respond(resp) ───────│              │
//! └──────────────┘                └──────────────┘                └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use smallware_rendezvous::{FifoQueue, MatcherConfig, RendezvousError, WaitOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue: Arc<FifoQueue<String, String>> =
//!         Arc::new(FifoQueue::new(MatcherConfig::new("echo")));
//!
//!     // A consumer answering requests until it is dismissed
//!     let worker = queue.clone();
//!     tokio::spawn(async move {
//!         loop {
//!             match worker.dequeue().await {
//!                 Ok(item) => {
//!                     let answer = item.request()?.to_uppercase();
//!                     item.respond(answer)?;
//!                 }
//!                 Err(RendezvousError::Cancelled) => break,
//!                 Err(e) => return Err(e),
//!             }
//!         }
//!         Ok(())
//!     });
//!
//!     let opts = WaitOptions::new().with_timeout(Duration::from_secs(1));
//!     let answer = queue.enqueue_with("hello".to_string(), opts).await?;
//!     assert_eq!(answer, "HELLO");
//!     queue.dismiss_consumers();
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! - Every request reaches at most one consumer, and every consumer receives
//!   at most one request per `dequeue`.
//! - Both sides are served strictly oldest first.
//! - An item finishes exactly once. The first terminal call wins; later calls
//!   fail with [`RendezvousError::AlreadyFinished`].
//! - Timeouts and cancellation abandon the caller's wait only. A request the
//!   consumer already holds stays with the consumer, which can watch
//!   [`RequestItem::still_needed()`] or [`RequestItem::cancellation_signal()`]
//!   to stop early.
//!
//! # Ownership
//!
//! The consumer that dequeued an item must finish it. Dropping the last
//! handle to an unfinished item fails the producer's wait with
//! [`RendezvousError::Abandoned`] and logs a warning.

pub mod config;
pub mod error;
pub mod fifo_queue;
pub mod matcher;
pub mod request_item;
pub mod storage;
mod trace_id;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CompletionPolicy, MatcherConfig, WaitOptions};
pub use error::{RendezvousError, Result};
pub use fifo_queue::FifoQueue;
pub use matcher::{ConsumerSlot, MatchStorage, Matcher, SharedItem};
pub use request_item::{ItemOutcome, ItemPhase, PendingResponse, RequestItem};
pub use storage::{Fifo, Storage, WaitingSet};
pub use trace_id::TraceId;

/// Locks `mutex`, recovering the data if another thread panicked while
/// holding it. Every critical section in this crate leaves its data
/// consistent between statements.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
