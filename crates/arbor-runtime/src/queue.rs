//! Ordered event queue
//!
//! Many producers (one per connection) and exactly one consumer, the
//! engine loop. Events from one connection keep their arrival order; a
//! deferred event goes to the back of the queue, behind everything that
//! has been enqueued so far.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use arbor_core::{ArborError, ArborResult};

use crate::Inbound;

/// Create a queue, returning the producer and consumer halves
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSender { tx },
        EventReceiver {
            rx,
            pending: VecDeque::new(),
            deferred_streak: 0,
        },
    )
}

/// Producer half; cheap to clone, never blocks
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl EventSender {
    pub fn push(&self, inbound: Inbound) -> ArborResult<()> {
        self.tx.send(inbound).map_err(|_| ArborError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the engine loop
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
    /// Events pulled off the channel but not yet handed out
    pending: VecDeque<Inbound>,
    /// Deferrals since the last event that made progress
    deferred_streak: usize,
}

impl EventReceiver {
    /// Next event in queue order.
    ///
    /// When every pending event has been deferred since the last
    /// successful step, nothing can change until a new event arrives, so
    /// this waits for one instead of cycling the deferred events. Returns
    /// `None` once all senders are gone and no further progress is
    /// possible.
    pub async fn next(&mut self) -> Option<Inbound> {
        self.drain_ready();

        if self.pending.is_empty() || self.deferred_streak >= self.pending.len() {
            let inbound = self.rx.recv().await?;
            self.pending.push_back(inbound);
            self.deferred_streak = 0;
        }

        self.pending.pop_front()
    }

    /// Non-blocking variant of [`next`](Self::next)
    #[cfg(test)]
    fn try_next(&mut self) -> Option<Inbound> {
        self.drain_ready();
        if self.deferred_streak >= self.pending.len() {
            return None;
        }
        self.pending.pop_front()
    }

    /// Put a deferred event at the back of the queue
    pub fn requeue(&mut self, inbound: Inbound) {
        self.drain_ready();
        self.pending.push_back(inbound);
        self.deferred_streak += 1;
    }

    /// Record that the last event was fully processed
    pub fn progressed(&mut self) {
        self.deferred_streak = 0;
    }

    /// Events buffered locally, deferred ones included
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Pull everything already sent. A fresh arrival may unblock deferred
    /// events, so it resets the deferral streak.
    fn drain_ready(&mut self) {
        while let Ok(inbound) = self.rx.try_recv() {
            self.pending.push_back(inbound);
            self.deferred_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{ConnectionId, Message};
    use crate::Event;
    use proptest::prelude::*;

    fn connect(conn: u64, level: u32) -> Inbound {
        Inbound::message(ConnectionId::new(conn), Message::Connect { level })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = event_queue();
        tx.push(connect(1, 0)).unwrap();
        tx.push(connect(1, 1)).unwrap();

        assert_eq!(rx.next().await, Some(connect(1, 0)));
        rx.progressed();
        assert_eq!(rx.next().await, Some(connect(1, 1)));
    }

    #[tokio::test]
    async fn test_requeue_goes_behind_earlier_arrivals() {
        let (tx, mut rx) = event_queue();
        tx.push(connect(1, 0)).unwrap();
        tx.push(connect(2, 0)).unwrap();

        let first = rx.next().await.unwrap();
        tx.push(connect(3, 0)).unwrap();
        rx.requeue(first);

        assert_eq!(rx.next().await, Some(connect(2, 0)));
        rx.progressed();
        assert_eq!(rx.next().await, Some(connect(3, 0)));
        rx.progressed();
        assert_eq!(rx.next().await, Some(connect(1, 0)));
    }

    #[tokio::test]
    async fn test_parks_when_only_deferred_events_remain() {
        let (tx, mut rx) = event_queue();
        tx.push(connect(1, 0)).unwrap();

        let first = rx.next().await.unwrap();
        rx.requeue(first);
        assert!(rx.try_next().is_none());
        assert_eq!(rx.pending(), 1);

        tx.push(connect(2, 0)).unwrap();
        // The fresh arrival lifts the park; older deferred events retry first.
        let retried = rx.next().await.unwrap();
        assert_eq!(retried, connect(1, 0));
        rx.requeue(retried);
        assert_eq!(rx.next().await, Some(connect(2, 0)));
    }

    #[tokio::test]
    async fn test_ends_when_senders_dropped() {
        let (tx, mut rx) = event_queue();
        tx.push(connect(1, 0)).unwrap();
        drop(tx);

        assert!(rx.next().await.is_some());
        rx.progressed();
        assert!(rx.next().await.is_none());
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let (tx, rx) = event_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.push(connect(1, 0)), Err(ArborError::QueueClosed)));
    }

    proptest! {
        /// Every event comes out exactly once, and events that were never
        /// deferred keep their arrival order.
        #[test]
        fn prop_requeue_preserves_undeferred_order(
            budgets in prop::collection::vec((0u64..4, 0u32..3), 1..40),
        ) {
            let (tx, mut rx) = event_queue();
            let mut remaining = Vec::new();
            for (seq, (conn, defers)) in budgets.iter().enumerate() {
                tx.push(connect(*conn, seq as u32)).unwrap();
                remaining.push(*defers);
            }

            let mut delivered = Vec::new();
            while delivered.len() < budgets.len() {
                let Some(inbound) = rx.try_next() else {
                    // Everything left was just deferred; stand in for
                    // progress made elsewhere.
                    prop_assert!(rx.pending() > 0);
                    rx.progressed();
                    continue;
                };
                let Event::Message(Message::Connect { level }) = inbound.event else {
                    unreachable!();
                };
                let seq = level as usize;
                if remaining[seq] > 0 {
                    remaining[seq] -= 1;
                    rx.requeue(inbound);
                } else {
                    rx.progressed();
                    delivered.push(seq);
                }
            }

            let mut sorted = delivered.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..budgets.len()).collect::<Vec<_>>());

            let undeferred: Vec<usize> = delivered
                .iter()
                .copied()
                .filter(|seq| budgets[*seq].1 == 0)
                .collect();
            prop_assert!(undeferred.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(rx.try_next().is_none());
        }
    }
}
