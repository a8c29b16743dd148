//! Ordering strategies for the two waiting sets of a matcher.
//!
//! A [`Matcher`](crate::Matcher) keeps pending requests and pending consumers
//! in two [`WaitingSet`]s. The [`Storage`] trait picks their concrete types, so
//! an alternate ordering can be plugged in without touching the put/take
//! protocol. [`Fifo`] is the standard strategy: oldest first on both sides.

use std::collections::VecDeque;

/// An ordered collection of waiting entries.
///
/// "Oldest" is defined by the implementation; for [`VecDeque`] it is the
/// entry pushed first.
pub trait WaitingSet<T> {
    /// Adds an entry as the newest one.
    fn push(&mut self, entry: T);

    /// Re-inserts an entry that was popped but couldn't be used, as the
    /// oldest one.
    fn push_front(&mut self, entry: T);

    /// Removes and returns the entry that should be served next.
    fn pop(&mut self) -> Option<T>;

    /// Removes the first entry matching `pred`.
    ///
    /// Used only when a waiter gives up, so it may be O(n).
    fn remove_first(&mut self, pred: &mut dyn FnMut(&T) -> bool) -> Option<T>;

    /// Removes every entry, in serving order.
    fn drain_all(&mut self) -> Vec<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> WaitingSet<T> for VecDeque<T> {
    #[inline]
    fn push(&mut self, entry: T) {
        self.push_back(entry);
    }

    #[inline]
    fn push_front(&mut self, entry: T) {
        VecDeque::push_front(self, entry);
    }

    #[inline]
    fn pop(&mut self) -> Option<T> {
        self.pop_front()
    }

    fn remove_first(&mut self, pred: &mut dyn FnMut(&T) -> bool) -> Option<T> {
        let pos = self.iter().position(|e| pred(e))?;
        self.remove(pos)
    }

    fn drain_all(&mut self) -> Vec<T> {
        self.drain(..).collect()
    }

    #[inline]
    fn len(&self) -> usize {
        VecDeque::len(self)
    }
}

/// Selects the waiting-set types of a matcher.
///
/// `R` is the pending-request entry type and `C` the pending-consumer entry
/// type; both are opaque to implementations.
pub trait Storage<R, C> {
    type Requests: WaitingSet<R> + Default;
    type Consumers: WaitingSet<C> + Default;
}

/// Strict first-in, first-out ordering on both sides.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl<R, C> Storage<R, C> for Fifo {
    type Requests = VecDeque<R>;
    type Consumers = VecDeque<C>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut set: VecDeque<u32> = VecDeque::new();
        assert!(WaitingSet::is_empty(&set));
        for i in 1..=4 {
            WaitingSet::push(&mut set, i);
        }
        assert_eq!(WaitingSet::len(&set), 4);
        assert_eq!(WaitingSet::pop(&mut set), Some(1));
        WaitingSet::push_front(&mut set, 1);
        assert_eq!(WaitingSet::pop(&mut set), Some(1));
        assert_eq!(WaitingSet::pop(&mut set), Some(2));
    }

    #[test]
    fn test_remove_first() {
        let mut set: VecDeque<u32> = (1..=5).collect();
        assert_eq!(set.remove_first(&mut |e: &u32| *e % 2 == 0), Some(2));
        assert_eq!(set.remove_first(&mut |e: &u32| *e == 42), None);
        assert_eq!(set.drain_all(), vec![1, 3, 4, 5]);
        assert!(WaitingSet::is_empty(&set));
    }
}
