//! First-in, first-out request queue.
//!
//! [`FifoQueue`] is a [`Matcher`] with [`Fifo`] storage and queue-flavoured
//! names: producers [`enqueue`](FifoQueue::enqueue) a request and get its
//! response back, consumers [`dequeue`](FifoQueue::dequeue) an item and
//! answer it.

use std::fmt;

use crate::config::{MatcherConfig, WaitOptions};
use crate::error::{RendezvousError, Result};
use crate::matcher::{Matcher, SharedItem};
use crate::storage::Fifo;

/// A request/response queue serving the oldest waiter first on both sides.
///
/// Share it between tasks with an `Arc`.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use smallware_rendezvous::FifoQueue;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), smallware_rendezvous::RendezvousError> {
/// let queue: Arc<FifoQueue<u32, u32>> = Arc::new(FifoQueue::default());
///
/// let worker = {
///     let queue = queue.clone();
///     tokio::spawn(async move {
///         let item = queue.dequeue().await?;
///         let doubled = item.request()? * 2;
///         item.respond(doubled)
///     })
/// };
///
/// assert_eq!(queue.enqueue(21).await?, 42);
/// # worker.await.unwrap()?;
/// # Ok(())
/// # }
/// ```
pub struct FifoQueue<REQ, RESP> {
    matcher: Matcher<REQ, RESP, Fifo>,
}

impl<REQ, RESP> fmt::Debug for FifoQueue<REQ, RESP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FifoQueue").field(&self.matcher).finish()
    }
}

impl<REQ, RESP> Default for FifoQueue<REQ, RESP> {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}

impl<REQ, RESP> FifoQueue<REQ, RESP> {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            matcher: Matcher::new(config),
        }
    }

    /// The underlying matcher.
    pub fn as_matcher(&self) -> &Matcher<REQ, RESP, Fifo> {
        &self.matcher
    }

    pub fn waiting_requests(&self) -> usize {
        self.matcher.waiting_requests()
    }

    pub fn waiting_consumers(&self) -> usize {
        self.matcher.waiting_consumers()
    }

    /// Ends the wait of every consumer with [`RendezvousError::Cancelled`].
    pub fn dismiss_consumers(&self) -> usize {
        self.matcher.dismiss_consumers()
    }
}

impl<REQ, RESP> FifoQueue<REQ, RESP>
where
    REQ: Send + Sync + 'static,
    RESP: Send + 'static,
{
    /// Submits a request and waits, without limit, for its response.
    pub async fn enqueue(&self, request: REQ) -> Result<RESP> {
        self.matcher.put(Some(request), WaitOptions::new()).await
    }

    /// Submits a request and waits for its response within `opts`.
    pub async fn enqueue_with(&self, request: REQ, opts: WaitOptions) -> Result<RESP> {
        self.matcher.put(Some(request), opts).await
    }

    /// Like [`enqueue_with`](Self::enqueue_with) for callers holding an
    /// optional request; `None` fails with [`RendezvousError::ArgumentNull`].
    pub async fn enqueue_opt(&self, request: Option<REQ>, opts: WaitOptions) -> Result<RESP> {
        self.matcher.put(request, opts).await
    }

    /// Waits, without limit, for the oldest request still needed.
    pub async fn dequeue(&self) -> Result<SharedItem<REQ, RESP>> {
        self.matcher.take(WaitOptions::new()).await
    }

    /// Waits for the oldest request still needed within `opts`.
    pub async fn dequeue_with(&self, opts: WaitOptions) -> Result<SharedItem<REQ, RESP>> {
        self.matcher.take(opts).await
    }

    /// Fails every queued request with `error`.
    pub fn abort_requests(&self, error: RendezvousError) -> usize {
        self.matcher.abort_requests(error)
    }

    /// Fails every queued request with [`RendezvousError::Cancelled`].
    pub fn cancel_requests(&self) -> usize {
        self.matcher.cancel_requests()
    }

    /// Answers every queued request with a clone of `response`.
    pub fn respond_requests(&self, response: RESP) -> usize
    where
        RESP: Clone,
    {
        self.matcher.respond_requests(response)
    }

    /// Answers every queued request with `RESP::default()`.
    pub fn respond_requests_default(&self) -> usize
    where
        RESP: Default,
    {
        self.matcher.respond_requests_default()
    }
}
