//! The put/take protocol that pairs producers with consumers.
//!
//! # Overview
//!
//! A [`Matcher`] owns two waiting sets: requests nobody has taken yet, and
//! consumers waiting for a request. At any moment at most one of them is
//! non-empty (apart from transient races), because each arrival first tries
//! to match against the other side.
//!
//! ```text
//! Producer                       Matcher                         Consumer
//!    |                              |                                |
//!    |-- put(req) ----------------->|                                |
//!    |   (no consumer: queued)      |                                |
//!    |                              |<------------------- take() ----|
//!    |                              |-- item ----------------------->|
//!    |                              |                                |
//!    |<------------------------------------------ item.respond(r) ---|
//!    | returns r                    |                                |
//! ```
//!
//! # Locking
//!
//! One mutex guards both waiting sets. Every registration, match and removal
//! happens under it; every wait happens outside it. Each item carries its own
//! lock for its lifecycle state, and the two are never nested: the matcher
//! reads an item's "still needed" flag atomically, and finishes items only
//! after releasing its own lock.
//!
//! # Waiting
//!
//! Each call suspends exactly once, racing its result against the caller's
//! cancellation token and timeout. The race is biased towards the real
//! result, and a loser double-checks for a result that arrived while it was
//! cleaning up, so a completed match always beats a synthetic failure.
//!
//! Dropping a `put`/`take` future mid-wait is handled like a timeout: the
//! waiter is withdrawn, and an item already handed to a dropped consumer is
//! passed on to the next consumer instead of being lost.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;

use crate::config::{MatcherConfig, WaitOptions};
use crate::error::{RendezvousError, Result};
use crate::lock_unpoisoned;
use crate::request_item::{PendingResponse, RequestItem};
use crate::storage::{Fifo, Storage, WaitingSet};

/// A request item as shared between the matcher, its producer and its consumer.
pub type SharedItem<REQ, RESP> = Arc<RequestItem<REQ, RESP>>;

/// A consumer waiting in a matcher.
pub struct ConsumerSlot<REQ, RESP> {
    key: u64,
    tx: oneshot::Sender<SharedItem<REQ, RESP>>,
}

impl<REQ, RESP> fmt::Debug for ConsumerSlot<REQ, RESP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSlot")
            .field("key", &self.key)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A [`Storage`] strategy usable by a `Matcher<REQ, RESP, _>`.
pub trait MatchStorage<REQ, RESP>:
    Storage<SharedItem<REQ, RESP>, ConsumerSlot<REQ, RESP>>
{
}

impl<REQ, RESP, S> MatchStorage<REQ, RESP> for S where
    S: Storage<SharedItem<REQ, RESP>, ConsumerSlot<REQ, RESP>>
{
}

/// State protected by the matcher's mutex.
struct Pending<REQ, RESP, S>
where
    S: MatchStorage<REQ, RESP>,
{
    requests: S::Requests,
    consumers: S::Consumers,
    next_key: u64,
}

/// Result of the three-way wait.
enum Raced<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}

/// Waits for `fut`, the caller's cancellation token, or the timeout,
/// preferring them in that order when several are ready.
async fn race<F>(fut: &mut F, opts: &WaitOptions) -> Raced<F::Output>
where
    F: Future + Unpin,
{
    let cancelled = async {
        match &opts.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = async {
        match opts.timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        out = fut => Raced::Ready(out),
        _ = cancelled => Raced::Cancelled,
        _ = expired => Raced::TimedOut,
    }
}

/// Pairs submitted requests with waiting consumers.
///
/// `S` selects the ordering of both waiting sets; the default [`Fifo`]
/// serves the oldest waiter first on each side.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use smallware_rendezvous::{Matcher, MatcherConfig, WaitOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), smallware_rendezvous::RendezvousError> {
/// let matcher: Arc<Matcher<String, usize>> =
///     Arc::new(Matcher::new(MatcherConfig::new("lengths")));
///
/// let worker = {
///     let matcher = matcher.clone();
///     tokio::spawn(async move {
///         let item = matcher.take(WaitOptions::new()).await?;
///         let len = item.request()?.len();
///         item.respond(len)
///     })
/// };
///
/// let len = matcher.put(Some("hello".to_string()), WaitOptions::new()).await?;
/// assert_eq!(len, 5);
/// # worker.await.unwrap()?;
/// # Ok(())
/// # }
/// ```
pub struct Matcher<REQ, RESP, S = Fifo>
where
    S: MatchStorage<REQ, RESP>,
{
    config: MatcherConfig,
    pending: Mutex<Pending<REQ, RESP, S>>,
}

impl<REQ, RESP, S> fmt::Debug for Matcher<REQ, RESP, S>
where
    S: MatchStorage<REQ, RESP>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = lock_unpoisoned(&self.pending);
        f.debug_struct("Matcher")
            .field("name", &self.config.name)
            .field("waiting_requests", &pending.requests.len())
            .field("waiting_consumers", &pending.consumers.len())
            .finish()
    }
}

impl<REQ, RESP, S> Default for Matcher<REQ, RESP, S>
where
    S: MatchStorage<REQ, RESP>,
{
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

impl<REQ, RESP, S> Matcher<REQ, RESP, S>
where
    S: MatchStorage<REQ, RESP>,
{
    /// Creates an empty matcher.
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(Pending {
                requests: Default::default(),
                consumers: Default::default(),
                next_key: 0,
            }),
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Number of requests waiting for a consumer.
    pub fn waiting_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// Number of consumers waiting for a request.
    pub fn waiting_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Pending<REQ, RESP, S>> {
        lock_unpoisoned(&self.pending)
    }

    /// Withdraws a consumer registration.
    ///
    /// Returns false if it was already gone, meaning it was either handed an
    /// item or dismissed.
    fn withdraw_consumer(&self, key: u64) -> bool {
        let removed = self
            .lock()
            .consumers
            .remove_first(&mut |slot: &ConsumerSlot<REQ, RESP>| slot.key == key);
        removed.is_some()
    }

    /// Wakes every waiting consumer with [`RendezvousError::Cancelled`].
    ///
    /// Returns the number of consumers dismissed.
    pub fn dismiss_consumers(&self) -> usize {
        let dismissed = self.lock().consumers.drain_all();
        let count = dismissed.len();
        // Dropping the senders ends the consumers' waits
        drop(dismissed);
        tracing::debug!(matcher = %self.config.name, count, "dismissed waiting consumers");
        count
    }
}

impl<REQ, RESP, S> Matcher<REQ, RESP, S>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
    S: MatchStorage<REQ, RESP>,
{
    /// Submits a request and waits for its response.
    ///
    /// The request goes straight to the oldest waiting consumer if there is
    /// one, and is queued otherwise.
    ///
    /// # Errors
    ///
    /// - [`RendezvousError::ArgumentNull`] if `request` is `None`
    /// - [`RendezvousError::Timeout`] / [`RendezvousError::Cancelled`] if the
    ///   wait was abandoned before a response arrived. A consumer that already
    ///   took the request keeps it, and sees it as no longer needed.
    /// - Whatever error the consumer aborted with, `Cancelled` if it
    ///   cancelled, or [`RendezvousError::Abandoned`] if it dropped the item
    pub async fn put(&self, request: Option<REQ>, opts: WaitOptions) -> Result<RESP> {
        let request = request.ok_or(RendezvousError::ArgumentNull)?;
        if opts.already_cancelled() {
            return Err(RendezvousError::Cancelled);
        }
        let (item, pending) = RequestItem::with_completion(self.config.completion.clone());
        item.initialize(request)?;
        let item = Arc::new(item);
        let mut wait = ProducerWait {
            matcher: self,
            item: Arc::downgrade(&item),
            pending,
            armed: true,
        };
        self.offer(item, false);

        let raced = race(&mut wait.pending, &opts).await;
        wait.armed = false;
        let err = match raced {
            Raced::Ready(reply) => return reply,
            Raced::Cancelled => RendezvousError::Cancelled,
            Raced::TimedOut => RendezvousError::Timeout,
        };
        if !self.withdraw_request(&wait.item) {
            // Someone else finished the item first and owns the reply sender,
            // so the real result (or Abandoned) is on its way
            tracing::debug!(matcher = %self.config.name, "late result beat {}", err);
            return (&mut wait.pending).await;
        }
        tracing::debug!(matcher = %self.config.name, "put abandoned: {}", err);
        Err(err)
    }

    /// Waits for a request to process.
    ///
    /// Returns the oldest queued request that is still needed, or waits for
    /// the next one to arrive. The caller must finish the returned item.
    ///
    /// # Errors
    ///
    /// - [`RendezvousError::Timeout`] / [`RendezvousError::Cancelled`] if the
    ///   wait was abandoned first
    /// - [`RendezvousError::Cancelled`] if the consumer was dismissed
    pub async fn take(&self, opts: WaitOptions) -> Result<SharedItem<REQ, RESP>> {
        if opts.already_cancelled() {
            return Err(RendezvousError::Cancelled);
        }
        let (key, rx) = {
            let mut stale = Vec::new();
            let mut pending = self.lock();
            while let Some(item) = pending.requests.pop() {
                if item.is_still_needed() {
                    drop(pending);
                    tracing::debug!(
                        matcher = %self.config.name,
                        item = %item.id(),
                        "took queued request"
                    );
                    return Ok(item);
                }
                stale.push(item);
            }
            let key = pending.next_key;
            pending.next_key += 1;
            let (tx, rx) = oneshot::channel();
            pending.consumers.push(ConsumerSlot { key, tx });
            drop(pending);
            if !stale.is_empty() {
                tracing::trace!(
                    matcher = %self.config.name,
                    count = stale.len(),
                    "discarded stale requests"
                );
            }
            tracing::trace!(matcher = %self.config.name, key, "consumer waiting");
            (key, rx)
        };

        let mut wait = ConsumerWait {
            matcher: self,
            key,
            rx,
            armed: true,
        };
        let raced = race(&mut wait.rx, &opts).await;
        wait.armed = false;
        let err = match raced {
            Raced::Ready(Ok(item)) => return Ok(item),
            // Dismissed
            Raced::Ready(Err(_)) => return Err(RendezvousError::Cancelled),
            Raced::Cancelled => RendezvousError::Cancelled,
            Raced::TimedOut => RendezvousError::Timeout,
        };
        if !self.withdraw_consumer(key) {
            // Matched while we were giving up: the item is ours
            if let Ok(item) = wait.rx.try_recv() {
                return Ok(item);
            }
        }
        tracing::debug!(matcher = %self.config.name, key, "take abandoned: {}", err);
        Err(err)
    }

    /// Hands `item` to the oldest live consumer, or queues it.
    ///
    /// `requeue` puts an unmatched item back at the head of the queue instead
    /// of the tail.
    fn offer(&self, item: SharedItem<REQ, RESP>, requeue: bool) {
        let mut item = item;
        let mut pending = self.lock();
        while let Some(slot) = pending.consumers.pop() {
            match slot.tx.send(item) {
                Ok(()) => {
                    drop(pending);
                    tracing::debug!(
                        matcher = %self.config.name,
                        key = slot.key,
                        "matched request with waiting consumer"
                    );
                    return;
                }
                // That consumer stopped waiting; try the next one
                Err(returned) => item = returned,
            }
        }
        let id = item.id().clone();
        if requeue {
            pending.requests.push_front(item);
        } else {
            pending.requests.push(item);
        }
        drop(pending);
        tracing::trace!(matcher = %self.config.name, item = %id, requeue, "request queued");
    }

    /// Removes an abandoned request from the queue if it is still there, then
    /// marks it as no longer needed.
    ///
    /// Returns true only if this call finished the item. False means a
    /// terminal call or a drain got there first.
    fn withdraw_request(&self, item: &Weak<RequestItem<REQ, RESP>>) -> bool {
        let target = item.as_ptr();
        let removed = self
            .lock()
            .requests
            .remove_first(&mut |queued: &SharedItem<REQ, RESP>| {
                std::ptr::eq(Arc::as_ptr(queued), target)
            });
        let was_queued = removed.is_some();
        // Outside the matcher lock: finishing takes the item's lock
        let Some(item) = removed.or_else(|| item.upgrade()) else {
            return false;
        };
        let withdrawn = item.no_longer_needed();
        if withdrawn {
            tracing::debug!(
                matcher = %self.config.name,
                item = %item.id(),
                was_queued,
                "withdrew request"
            );
        }
        withdrawn
    }

    fn drain_requests<F>(&self, action: &str, mut finish: F) -> usize
    where
        F: FnMut(&RequestItem<REQ, RESP>) -> Result<()>,
    {
        let drained = self.lock().requests.drain_all();
        let count = drained.len();
        for item in drained {
            // Already-finished items are skipped, keeping drains total
            if let Err(e) = finish(&item) {
                tracing::trace!(
                    matcher = %self.config.name,
                    item = %item.id(),
                    "drain skipped item: {}",
                    e
                );
            }
        }
        tracing::debug!(matcher = %self.config.name, action, count, "drained waiting requests");
        count
    }

    /// Aborts every queued request with `error`.
    ///
    /// Returns the number of requests drained.
    pub fn abort_requests(&self, error: RendezvousError) -> usize {
        self.drain_requests("abort", |item| item.abort(error.clone()))
    }

    /// Cancels every queued request.
    pub fn cancel_requests(&self) -> usize {
        self.drain_requests("cancel", |item| item.cancel())
    }

    /// Answers every queued request with a clone of `response`.
    pub fn respond_requests(&self, response: RESP) -> usize
    where
        RESP: Clone,
    {
        self.drain_requests("respond", |item| item.respond(response.clone()))
    }

    /// Answers every queued request with `RESP::default()`.
    pub fn respond_requests_default(&self) -> usize
    where
        RESP: Default,
    {
        self.drain_requests("respond", |item| item.respond_default())
    }
}

/// Cleans up after a `put` whose future is dropped mid-wait.
struct ProducerWait<'a, REQ, RESP, S>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
    S: MatchStorage<REQ, RESP>,
{
    matcher: &'a Matcher<REQ, RESP, S>,
    item: Weak<RequestItem<REQ, RESP>>,
    pending: PendingResponse<RESP>,
    armed: bool,
}

impl<REQ, RESP, S> Drop for ProducerWait<'_, REQ, RESP, S>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
    S: MatchStorage<REQ, RESP>,
{
    fn drop(&mut self) {
        if self.armed {
            let _ = self.matcher.withdraw_request(&self.item);
        }
    }
}

/// Cleans up after a `take` whose future is dropped mid-wait.
struct ConsumerWait<'a, REQ, RESP, S>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
    S: MatchStorage<REQ, RESP>,
{
    matcher: &'a Matcher<REQ, RESP, S>,
    key: u64,
    rx: oneshot::Receiver<SharedItem<REQ, RESP>>,
    armed: bool,
}

impl<REQ, RESP, S> Drop for ConsumerWait<'_, REQ, RESP, S>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
    S: MatchStorage<REQ, RESP>,
{
    fn drop(&mut self) {
        if !self.armed || self.matcher.withdraw_consumer(self.key) {
            return;
        }
        // An item was handed to us but never returned to the caller
        if let Ok(item) = self.rx.try_recv() {
            if item.is_still_needed() {
                tracing::debug!(
                    matcher = %self.matcher.config.name,
                    item = %item.id(),
                    "passing on item of dropped consumer"
                );
                self.matcher.offer(item, true);
            }
        }
    }
}
