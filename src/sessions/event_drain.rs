use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::SessionEvent;

/// A zero-allocation opaque iterator that drains events from a session.
///
/// This type wraps the internal event queue drain, providing a stable public API
/// that doesn't expose `std::collections::vec_deque::Drain` directly. It implements
/// [`Iterator`], [`DoubleEndedIterator`], [`ExactSizeIterator`], and [`FusedIterator`].
///
/// Obtain an `EventDrain` by calling [`ServerSession::events()`] or
/// [`ClientSession::events()`].
///
/// # Examples
///
/// ```ignore
/// for event in client.events() {
///     match event {
///         SessionEvent::Disconnected { reason, message } => {
///             println!("left the server: {reason} ({message})");
///         }
///         _ => { /* handle other events */ }
///     }
/// }
/// ```
///
/// [`ServerSession::events()`]: crate::ServerSession::events
/// [`ClientSession::events()`]: crate::ClientSession::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: Drain<'a, SessionEvent>,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, SessionEvent>) -> Self {
        Self { inner: drain }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = SessionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        self.inner.len()
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::iter_with_drain
)]
mod tests {
    use super::*;
    use crate::{PlayerSlot, Tic};
    use std::collections::VecDeque;

    fn stalled(slot: u8) -> SessionEvent {
        SessionEvent::PlayerStalled {
            slot: PlayerSlot::new(slot).unwrap(),
            tic: Tic::new(u32::from(slot)),
        }
    }

    #[test]
    fn drain_yields_events_in_order_and_empties_the_queue() {
        let mut queue: VecDeque<SessionEvent> = (1..=3).map(stalled).collect();
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(events, vec![stalled(1), stalled(2), stalled(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn double_ended_and_exact_size() {
        let mut queue: VecDeque<SessionEvent> = (1..=3).map(stalled).collect();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.len(), 3);
        assert_eq!(drain.next_back(), Some(stalled(3)));
        assert_eq!(drain.next(), Some(stalled(1)));
        assert_eq!(drain.size_hint(), (1, Some(1)));
        assert_eq!(drain.next(), Some(stalled(2)));
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }

    #[test]
    fn debug_format_shows_remaining_count() {
        let mut queue: VecDeque<SessionEvent> = (1..=2).map(stalled).collect();
        let drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 2 }");
    }
}
