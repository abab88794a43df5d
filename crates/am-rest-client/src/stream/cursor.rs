//! Per-task sequence tracking: deduplication and gap resync.

/// What to do with an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Next in order; deliver and advance the cursor.
    Deliver,
    /// At or below the cursor; already delivered.
    Duplicate,
    /// First event past a hole; report the gap and resubscribe.
    Gap { expected: u64, observed: u64 },
    /// Out-of-order event received while waiting for the resync ack.
    Straggler,
    /// The hole survived a resync; deliver and jump the cursor.
    GiveUp { expected: u64, observed: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resync {
    InSync,
    AwaitingAck,
    Acked,
}

/// Delivery cursor for one task
///
/// The cursor is the sequence number of the last delivered event. It only
/// ever moves forward, so nothing at or below it is delivered twice.
#[derive(Debug, Clone)]
pub(crate) struct TaskCursor {
    cursor: u64,
    resync: Resync,
}

impl TaskCursor {
    pub(crate) fn new(cursor: u64) -> Self {
        Self {
            cursor,
            resync: Resync::InSync,
        }
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    pub(crate) fn classify(&mut self, sequence: u64) -> Delivery {
        if sequence <= self.cursor {
            return Delivery::Duplicate;
        }

        let expected = self.cursor + 1;
        if sequence == expected {
            self.cursor = sequence;
            self.resync = Resync::InSync;
            return Delivery::Deliver;
        }

        match self.resync {
            Resync::InSync => {
                self.resync = Resync::AwaitingAck;
                Delivery::Gap {
                    expected,
                    observed: sequence,
                }
            }
            Resync::AwaitingAck => Delivery::Straggler,
            Resync::Acked => {
                self.cursor = sequence;
                self.resync = Resync::InSync;
                Delivery::GiveUp {
                    expected,
                    observed: sequence,
                }
            }
        }
    }

    /// Events past the cursor were skipped on purpose; treat everything
    /// ahead of it as stragglers until the next acknowledgement brings the
    /// replay.
    pub(crate) fn await_replay(&mut self) {
        self.resync = Resync::AwaitingAck;
    }

    /// The server acknowledged a subscription that includes this task.
    pub(crate) fn on_ack(&mut self) {
        if self.resync == Resync::AwaitingAck {
            self.resync = Resync::Acked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_in_order_delivery() {
        let mut cursor = TaskCursor::new(0);
        assert_eq!(cursor.classify(1), Delivery::Deliver);
        assert_eq!(cursor.classify(2), Delivery::Deliver);
        assert_eq!(cursor.cursor(), 2);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut cursor = TaskCursor::new(2);
        assert_eq!(cursor.classify(1), Delivery::Duplicate);
        assert_eq!(cursor.classify(2), Delivery::Duplicate);
        assert_eq!(cursor.classify(3), Delivery::Deliver);
    }

    #[test]
    fn test_gap_resolved_by_replay() {
        let mut cursor = TaskCursor::new(0);
        cursor.classify(1);
        cursor.classify(2);
        assert_eq!(
            cursor.classify(5),
            Delivery::Gap {
                expected: 3,
                observed: 5
            }
        );
        assert_eq!(cursor.classify(6), Delivery::Straggler);

        cursor.on_ack();
        assert_eq!(cursor.classify(3), Delivery::Deliver);
        assert_eq!(cursor.classify(4), Delivery::Deliver);
        assert_eq!(cursor.classify(5), Delivery::Deliver);
        assert_eq!(cursor.cursor(), 5);
    }

    #[test]
    fn test_gap_persisting_after_resync_gives_up() {
        let mut cursor = TaskCursor::new(2);
        assert!(matches!(cursor.classify(5), Delivery::Gap { .. }));
        cursor.on_ack();
        assert_eq!(
            cursor.classify(5),
            Delivery::GiveUp {
                expected: 3,
                observed: 5
            }
        );
        assert_eq!(cursor.cursor(), 5);

        // A fresh hole starts a fresh resync.
        assert!(matches!(cursor.classify(9), Delivery::Gap { .. }));
    }

    #[test]
    fn test_ack_without_pending_resync_is_noop() {
        let mut cursor = TaskCursor::new(0);
        cursor.on_ack();
        assert!(matches!(cursor.classify(3), Delivery::Gap { .. }));
    }

    #[test]
    fn test_await_replay_holds_back_until_ack() {
        let mut cursor = TaskCursor::new(3);
        cursor.await_replay();
        assert_eq!(cursor.classify(7), Delivery::Straggler);
        assert_eq!(cursor.classify(4), Delivery::Deliver);

        cursor.await_replay();
        cursor.on_ack();
        assert_eq!(cursor.classify(5), Delivery::Deliver);
        assert_eq!(cursor.cursor(), 5);
    }

    proptest! {
        #[test]
        fn prop_delivered_sequences_strictly_increase(
            start in 0u64..10,
            incoming in proptest::collection::vec((0u64..40, any::<bool>()), 0..200),
        ) {
            let mut cursor = TaskCursor::new(start);
            let mut last = start;
            for (sequence, ack) in incoming {
                if ack {
                    cursor.on_ack();
                }
                match cursor.classify(sequence) {
                    Delivery::Deliver | Delivery::GiveUp { .. } => {
                        prop_assert!(sequence > last);
                        last = sequence;
                    }
                    _ => {}
                }
                prop_assert_eq!(cursor.cursor(), last);
            }
        }

        #[test]
        fn prop_replays_after_reconnect_deliver_each_event_once(
            total in 1u64..60,
            drops in proptest::collection::vec(0u64..60, 0..8),
        ) {
            // An honest server replays everything after the resume cursor,
            // sometimes starting earlier than it needs to.
            let mut cursor = TaskCursor::new(0);
            let mut delivered = Vec::new();
            let mut next = 1;
            for drop_at in drops {
                let stop = drop_at.min(total);
                while next <= stop {
                    if cursor.classify(next) == Delivery::Deliver {
                        delivered.push(next);
                    }
                    next += 1;
                }
                next = cursor.cursor().saturating_sub(drop_at % 3).max(1);
            }
            while next <= total {
                if cursor.classify(next) == Delivery::Deliver {
                    delivered.push(next);
                }
                next += 1;
            }
            prop_assert_eq!(delivered, (1..=total).collect::<Vec<_>>());
        }
    }
}
