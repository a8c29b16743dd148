//! The unit of work exchanged between a producer and a consumer.
//!
//! A [`RequestItem`] correlates one request with its eventual response. The
//! producer that submitted the request keeps a [`PendingResponse`]; the
//! consumer that dequeued it holds the item and must finish it with exactly
//! one terminal call:
//!
//! - [`RequestItem::respond()`] / [`RequestItem::respond_default()`]
//! - [`RequestItem::cancel()`]
//! - [`RequestItem::abort()`]
//!
//! # Lifecycle
//!
//! ```text
//! +---------------+  initialize  +-------------+  respond / cancel /  +----------+
//! | Uninitialized |------------->| Initialized |--------------------->| Finished |
//! +---------------+              +-------------+  abort / no longer   +----------+
//!                                                 needed
//! ```
//!
//! The transition to `Finished` happens at most once, guarded by the item's own
//! lock. That lock is independent of any matcher lock, and it is never held
//! while the producer is woken.
//!
//! # Ownership
//!
//! Whoever holds the item last must finish it. If every handle is dropped while
//! the item is still `Initialized`, the producer's wait fails with
//! [`RendezvousError::Abandoned`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::CompletionPolicy;
use crate::error::{RendezvousError, Result};
use crate::lock_unpoisoned;
use crate::trace_id::{next_trace_id, TraceId};

/// Lifecycle state of a [`RequestItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Uninitialized,
    Initialized,
    Finished,
}

/// How an item's response was (or wasn't) produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// No terminal call yet.
    Pending,
    /// The consumer supplied a response.
    Responded,
    /// The consumer cancelled the request.
    Cancelled,
    /// The consumer or a drain aborted the request with an error.
    Aborted,
    /// The producer stopped waiting before a response arrived.
    NoLongerNeeded,
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = match self {
            Self::Pending => "PENDING",
            Self::Responded => "RESPONDED",
            Self::Cancelled => "CANCELLED",
            Self::Aborted => "ABORTED",
            Self::NoLongerNeeded => "NO_LONGER_NEEDED",
        };
        write!(f, "{}", str)
    }
}

type Reply<RESP> = Result<RESP>;

/// State guarded by the item's lock.
struct ItemState<RESP> {
    phase: ItemPhase,
    outcome: ItemOutcome,
    /// Taken by the first terminal transition; dropping it unanswered is what
    /// fails the producer's wait with `Abandoned`
    reply_tx: Option<oneshot::Sender<Reply<RESP>>>,
}

/// One request together with its completion state.
///
/// Items are created by the matcher and handed to consumers as
/// `Arc<RequestItem<REQ, RESP>>`.
pub struct RequestItem<REQ, RESP> {
    id: TraceId,
    created: coarsetime::Instant,
    request: OnceLock<REQ>,
    /// Readable without the item lock, so a matcher can skip stale items
    /// while holding its own lock
    still_needed: AtomicBool,
    cancel: CancellationToken,
    completion: CompletionPolicy,
    state: Mutex<ItemState<RESP>>,
}

impl<REQ, RESP> fmt::Debug for RequestItem<REQ, RESP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.state);
        f.debug_struct("RequestItem")
            .field("id", &self.id)
            .field("phase", &state.phase)
            .field("outcome", &state.outcome)
            .field("still_needed", &self.still_needed.load(Ordering::Acquire))
            .finish()
    }
}

impl<REQ, RESP> RequestItem<REQ, RESP>
where
    RESP: Send + 'static,
{
    /// Creates an uninitialized item and the future its producer waits on.
    pub fn new() -> (Self, PendingResponse<RESP>) {
        Self::with_completion(CompletionPolicy::Inline)
    }

    /// Creates an uninitialized item that completes its response according
    /// to `completion`.
    pub fn with_completion(completion: CompletionPolicy) -> (Self, PendingResponse<RESP>) {
        let (reply_tx, rx) = oneshot::channel();
        let item = Self {
            id: next_trace_id(),
            created: coarsetime::Instant::now(),
            request: OnceLock::new(),
            still_needed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            completion,
            state: Mutex::new(ItemState {
                phase: ItemPhase::Uninitialized,
                outcome: ItemOutcome::Pending,
                reply_tx: Some(reply_tx),
            }),
        };
        (item, PendingResponse { rx })
    }

    /// Attaches the request. Allowed exactly once.
    pub fn initialize(&self, request: REQ) -> Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        if state.phase != ItemPhase::Uninitialized {
            return Err(RendezvousError::AlreadyInitialized);
        }
        self.request
            .set(request)
            .map_err(|_| RendezvousError::AlreadyInitialized)?;
        state.phase = ItemPhase::Initialized;
        self.still_needed.store(true, Ordering::Release);
        Ok(())
    }

    /// Completes the producer's wait with `response`.
    pub fn respond(&self, response: RESP) -> Result<()> {
        self.finish(ItemOutcome::Responded, Some(Ok(response)))
    }

    /// Completes the producer's wait with `RESP::default()`.
    pub fn respond_default(&self) -> Result<()>
    where
        RESP: Default,
    {
        self.respond(RESP::default())
    }

    /// Completes the producer's wait with [`RendezvousError::Cancelled`].
    pub fn cancel(&self) -> Result<()> {
        self.finish(ItemOutcome::Cancelled, Some(Err(RendezvousError::Cancelled)))
    }

    /// Completes the producer's wait with `error`.
    pub fn abort(&self, error: RendezvousError) -> Result<()> {
        self.finish(ItemOutcome::Aborted, Some(Err(error)))
    }

    /// Marks the item as abandoned by its producer.
    ///
    /// Silent when the item is already finished (or was never initialized).
    /// Returns true if this call performed the transition.
    pub(crate) fn no_longer_needed(&self) -> bool {
        match self.finish(ItemOutcome::NoLongerNeeded, None) {
            Ok(()) => {
                tracing::debug!(item = %self.id, "request no longer needed");
                true
            }
            Err(_) => false,
        }
    }

    fn finish(&self, outcome: ItemOutcome, reply: Option<Reply<RESP>>) -> Result<()> {
        let reply_tx = {
            let mut state = lock_unpoisoned(&self.state);
            match state.phase {
                ItemPhase::Uninitialized => return Err(RendezvousError::NotInitialized),
                ItemPhase::Finished => return Err(RendezvousError::AlreadyFinished),
                ItemPhase::Initialized => {}
            }
            state.phase = ItemPhase::Finished;
            state.outcome = outcome;
            self.still_needed.store(false, Ordering::Release);
            state.reply_tx.take()
        };
        // The item lock is released before the producer is woken
        if let (Some(tx), Some(reply)) = (reply_tx, reply) {
            self.completion.deliver(tx, reply);
        }
        self.cancel.cancel();
        Ok(())
    }
}

impl<REQ, RESP> RequestItem<REQ, RESP> {
    /// Identifier used in log events for this item.
    pub fn id(&self) -> &TraceId {
        &self.id
    }

    /// Time elapsed since the item was created.
    pub fn age(&self) -> coarsetime::Duration {
        self.created.elapsed()
    }

    pub fn phase(&self) -> ItemPhase {
        lock_unpoisoned(&self.state).phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == ItemPhase::Finished
    }

    /// The request carried by this item.
    pub fn request(&self) -> Result<&REQ> {
        self.request.get().ok_or(RendezvousError::NotInitialized)
    }

    /// False once the item finished, including when its producer gave up.
    ///
    /// Consumers doing long work can poll this to stop early.
    pub fn still_needed(&self) -> Result<bool> {
        self.request()?;
        Ok(self.still_needed.load(Ordering::Acquire))
    }

    pub(crate) fn is_still_needed(&self) -> bool {
        self.still_needed.load(Ordering::Acquire)
    }

    /// A token that is cancelled when the item finishes for any reason.
    pub fn cancellation_signal(&self) -> Result<CancellationToken> {
        self.request()?;
        Ok(self.cancel.clone())
    }

    /// Resolves once the item has finished.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// How the response was produced so far.
    pub fn outcome(&self) -> Result<ItemOutcome> {
        let state = lock_unpoisoned(&self.state);
        match state.phase {
            ItemPhase::Uninitialized => Err(RendezvousError::NotInitialized),
            _ => Ok(state.outcome),
        }
    }
}

impl<REQ, RESP> Drop for RequestItem<REQ, RESP> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.phase == ItemPhase::Initialized {
            tracing::warn!(item = %self.id, "request item dropped without a terminal call");
            self.cancel.cancel();
        }
    }
}

/// The producer's side of a [`RequestItem`].
///
/// Resolves to the consumer's response, to the error it aborted with, or to
/// [`RendezvousError::Abandoned`] if the item was dropped unanswered.
#[derive(Debug)]
pub struct PendingResponse<RESP> {
    rx: oneshot::Receiver<Reply<RESP>>,
}

impl<RESP> PendingResponse<RESP> {
    /// Returns the response if one was already delivered.
    ///
    /// `None` means no response was sent, either not yet or never.
    pub fn try_take(&mut self) -> Option<Result<RESP>> {
        self.rx.try_recv().ok()
    }
}

impl<RESP> Future for PendingResponse<RESP> {
    type Output = Result<RESP>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|reply| match reply {
            Ok(reply) => reply,
            Err(_) => Err(RendezvousError::Abandoned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized(request: &str) -> (RequestItem<String, u32>, PendingResponse<u32>) {
        let (item, pending) = RequestItem::new();
        item.initialize(request.to_string()).unwrap();
        (item, pending)
    }

    #[test]
    fn test_uninitialized_accessors_fail() {
        let (item, _pending) = RequestItem::<String, u32>::new();
        assert_eq!(item.phase(), ItemPhase::Uninitialized);
        assert_eq!(item.request().unwrap_err(), RendezvousError::NotInitialized);
        assert_eq!(item.still_needed().unwrap_err(), RendezvousError::NotInitialized);
        assert_eq!(item.outcome().unwrap_err(), RendezvousError::NotInitialized);
        assert!(item.cancellation_signal().is_err());
    }

    #[test]
    fn test_terminal_before_initialize_fails() {
        let (item, _pending) = RequestItem::<String, u32>::new();
        assert_eq!(item.respond(1).unwrap_err(), RendezvousError::NotInitialized);
        assert_eq!(item.cancel().unwrap_err(), RendezvousError::NotInitialized);
        assert_eq!(
            item.abort(RendezvousError::aborted("x")).unwrap_err(),
            RendezvousError::NotInitialized
        );
        assert!(!item.no_longer_needed());
    }

    #[test]
    fn test_initialize_twice_fails() {
        let (item, _pending) = initialized("a");
        assert_eq!(
            item.initialize("b".to_string()).unwrap_err(),
            RendezvousError::AlreadyInitialized
        );
        assert_eq!(item.request().unwrap(), "a");
        assert!(item.still_needed().unwrap());
        assert_eq!(item.outcome().unwrap(), ItemOutcome::Pending);
    }

    #[tokio::test]
    async fn test_respond_first_write_wins() {
        let (item, pending) = initialized("req");
        item.respond(1).unwrap();
        assert_eq!(item.respond(2).unwrap_err(), RendezvousError::AlreadyFinished);
        assert_eq!(item.cancel().unwrap_err(), RendezvousError::AlreadyFinished);
        assert_eq!(pending.await.unwrap(), 1);
        assert_eq!(item.outcome().unwrap(), ItemOutcome::Responded);
        assert!(!item.still_needed().unwrap());
        assert!(item.cancellation_signal().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_respond_default() {
        let (item, pending) = initialized("req");
        item.respond_default().unwrap();
        assert_eq!(pending.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_abort_reach_producer() {
        let (item, pending) = initialized("req");
        item.cancel().unwrap();
        assert_eq!(pending.await.unwrap_err(), RendezvousError::Cancelled);
        assert_eq!(item.outcome().unwrap(), ItemOutcome::Cancelled);

        let (item, pending) = initialized("req");
        item.abort(RendezvousError::aborted("boom")).unwrap();
        assert_eq!(pending.await.unwrap_err(), RendezvousError::aborted("boom"));
        assert_eq!(item.outcome().unwrap(), ItemOutcome::Aborted);
    }

    #[test]
    fn test_no_longer_needed_is_silent_and_final() {
        let (item, mut pending) = initialized("req");
        let signal = item.cancellation_signal().unwrap();
        assert!(item.no_longer_needed());
        assert!(!item.no_longer_needed());
        assert!(signal.is_cancelled());
        assert!(!item.still_needed().unwrap());
        assert_eq!(item.outcome().unwrap(), ItemOutcome::NoLongerNeeded);
        // The consumer's late answer is refused and never reaches the producer
        assert_eq!(item.respond(5).unwrap_err(), RendezvousError::AlreadyFinished);
        assert!(pending.try_take().is_none());
    }

    #[test]
    fn test_no_longer_needed_after_respond_keeps_response() {
        let (item, mut pending) = initialized("req");
        item.respond(9).unwrap();
        assert!(!item.no_longer_needed());
        assert_eq!(item.outcome().unwrap(), ItemOutcome::Responded);
        assert_eq!(pending.try_take(), Some(Ok(9)));
    }

    #[tokio::test]
    async fn test_dropped_item_abandons_producer() {
        let (item, pending) = initialized("req");
        drop(item);
        assert_eq!(pending.await.unwrap_err(), RendezvousError::Abandoned);
    }

    #[tokio::test]
    async fn test_cancelled_resolves_on_finish() {
        let (item, _pending) = initialized("req");
        let item = std::sync::Arc::new(item);
        let waiter = {
            let item = item.clone();
            tokio::spawn(async move { item.cancelled().await })
        };
        item.respond(3).unwrap();
        waiter.await.unwrap();
        assert!(item.is_finished());
    }
}
