//! Construction-time settings for a matcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Decides where a producer's pending response gets completed.
///
/// Completing a response only wakes the waiting producer; it never runs the
/// producer's code on the consumer's thread. `Spawn` additionally moves the
/// hand-off itself onto another runtime, so the terminal call returns without
/// touching the producer's channel.
#[derive(Debug, Clone, Default)]
pub enum CompletionPolicy {
    /// Complete the response from the thread making the terminal call.
    #[default]
    Inline,
    /// Complete the response from a task spawned on the given runtime.
    Spawn(Handle),
}

impl CompletionPolicy {
    pub(crate) fn deliver<T: Send + 'static>(&self, tx: oneshot::Sender<T>, value: T) {
        match self {
            CompletionPolicy::Inline => {
                // The receiver is gone if the producer stopped waiting
                let _ = tx.send(value);
            }
            CompletionPolicy::Spawn(handle) => {
                handle.spawn(async move {
                    let _ = tx.send(value);
                });
            }
        }
    }
}

/// Configuration for a [`Matcher`](crate::Matcher) or [`FifoQueue`](crate::FifoQueue).
///
/// # Construction
///
/// Use [`MatcherConfig::new()`] to create a configuration, then chain
/// `with_*` methods to customize it:
///
/// ```rust
/// use smallware_rendezvous::{CompletionPolicy, MatcherConfig};
///
/// let config = MatcherConfig::new("jobs").with_completion(CompletionPolicy::Inline);
/// assert_eq!(config.name.as_ref(), "jobs");
/// ```
///
/// # Stability
///
/// This struct is marked `#[non_exhaustive]`, meaning new fields may be added
/// in future versions without a breaking change. Always use the constructor
/// and builder methods rather than struct literal syntax.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MatcherConfig {
    /// Label attached to every log event emitted by the matcher
    pub name: Arc<str>,

    /// Where responses are completed (defaults to [`CompletionPolicy::Inline`])
    pub completion: CompletionPolicy,
}

impl MatcherConfig {
    /// Creates a configuration with default settings and the given log label.
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            completion: CompletionPolicy::Inline,
        }
    }

    /// Sets the completion policy used by every item the matcher creates.
    pub fn with_completion(mut self, completion: CompletionPolicy) -> Self {
        self.completion = completion;
        self
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::new("rendezvous")
    }
}

/// Limits on a single `put`/`take` wait.
///
/// The default waits forever and can't be cancelled.
///
/// ```rust
/// use std::time::Duration;
/// use smallware_rendezvous::WaitOptions;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let opts = WaitOptions::new()
///     .with_timeout(Duration::from_millis(50))
///     .with_cancel(token.clone());
/// assert_eq!(opts.timeout, Some(Duration::from_millis(50)));
/// ```
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct WaitOptions {
    /// Maximum wait; `None` disables the timeout
    pub timeout: Option<Duration>,

    /// Caller-owned signal that abandons the wait when cancelled
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    /// Wait forever, never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn already_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MatcherConfig::default();
        assert_eq!(config.name.as_ref(), "rendezvous");
        assert!(matches!(config.completion, CompletionPolicy::Inline));
    }

    #[test]
    fn test_wait_options_builder() {
        let opts = WaitOptions::new();
        assert_eq!(opts.timeout, None);
        assert!(!opts.already_cancelled());

        let token = CancellationToken::new();
        let opts = opts
            .with_timeout(Duration::from_secs(1))
            .with_cancel(token.clone());
        assert_eq!(opts.timeout, Some(Duration::from_secs(1)));
        assert!(!opts.already_cancelled());
        token.cancel();
        assert!(opts.already_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_policy_delivers() {
        let policy = CompletionPolicy::Spawn(Handle::current());
        let (tx, rx) = oneshot::channel();
        policy.deliver(tx, 7u32);
        assert_eq!(rx.await.unwrap(), 7);
    }
}
