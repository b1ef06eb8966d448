//! Per-topic in-order delivery over an unreliable, out-of-order transport
//! (§4.1): bounded reordering, wrap-around sequence arithmetic, and a
//! one-shot missing-message timer.

use std::time::Duration;

/// Outcome of a single `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Delivered immediately (possibly draining buffered successors too).
    Delivered,
    /// Strictly in the past; dropped.
    Old,
    /// Placed in a reorder slot, awaiting its predecessors.
    Buffered,
    /// A future message that doesn't fit in the reorder window.
    Dropped,
}

/// Callback surface a sequencer drives. Implemented by whatever owns the
/// topic's inbound dispatch; `on_message` may call back into
/// `reset_sequence_number` re-entrantly (the overrun-redrive pattern).
pub trait SequenceHandler {
    /// A message payload, opaque to the sequencer.
    type Message;

    /// Deliver `msg` at `sequence`, strictly in order.
    fn on_message(&mut self, sequence: u32, msg: Self::Message);

    /// The missing-message timer expired while still waiting.
    fn on_timeout_expired(&mut self) {}
}

struct Slot<M> {
    occupied: bool,
    msg: Option<M>,
}

impl<M> Slot<M> {
    fn empty() -> Self {
        Slot {
            occupied: false,
            msg: None,
        }
    }
}

/// Computes the wrap-around-aware old/future decision for `incoming` against
/// `expected`. Returns `true` if `incoming` is in the future (or exactly
/// tied, which counts as future to allow forward progress).
fn is_future(incoming: u32, expected: u32) -> bool {
    let forward = incoming.wrapping_sub(expected);
    let backward = forward.wrapping_neg();
    forward <= backward
}

/// A plain, synchronous, mutex-free per-topic reorder buffer. Owned
/// exclusively by the task that drives the topic's inbound dispatch loop —
/// never shared behind a second lock.
pub struct Sequencer<M> {
    next_expected: u32,
    slots: Vec<Slot<M>>,
    max_slots: usize,
    sequence_timeout: Duration,
    waiting_for_missing: bool,
}

impl<M> Sequencer<M> {
    pub fn new(initial_expected: u32, max_slots: usize, sequence_timeout: Duration) -> Self {
        let mut slots = Vec::with_capacity(max_slots);
        slots.resize_with(max_slots, Slot::empty);
        Sequencer {
            next_expected: initial_expected,
            slots,
            max_slots,
            sequence_timeout,
            waiting_for_missing: false,
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// `true` when a missing-message timer should be armed: the reorder
    /// buffer is non-empty and timeouts are enabled for this sequencer.
    pub fn should_arm_timer(&self) -> bool {
        self.waiting_for_missing && !self.sequence_timeout.is_zero()
    }

    pub fn timeout_duration(&self) -> Duration {
        self.sequence_timeout
    }

    fn buffer_is_empty(&self) -> bool {
        self.slots.iter().all(|s| !s.occupied)
    }

    /// Write an inbound message at `sequence`, delivering it (and any
    /// already-buffered successors) to `handler` in order.
    pub fn write<H>(&mut self, sequence: u32, msg: M, handler: &mut H) -> WriteOutcome
    where
        H: SequenceHandler<Message = M>,
    {
        if sequence == self.next_expected {
            // Advance before invoking the handler so a re-entrant
            // `reset_sequence_number` call from within `on_message` wins.
            self.next_expected = self.next_expected.wrapping_add(1);
            handler.on_message(sequence, msg);
            self.drain(handler);
            self.waiting_for_missing = !self.buffer_is_empty();
            return WriteOutcome::Delivered;
        }

        if !is_future(sequence, self.next_expected) {
            return WriteOutcome::Old;
        }

        let distance = sequence.wrapping_sub(self.next_expected);
        let slot_index = (distance - 1) as usize;
        if slot_index >= self.max_slots {
            return WriteOutcome::Dropped;
        }
        self.slots[slot_index] = Slot {
            occupied: true,
            msg: Some(msg),
        };
        self.waiting_for_missing = true;
        WriteOutcome::Buffered
    }

    /// Drain contiguous buffered slots starting at slot 0, delivering each
    /// to `handler` and shifting the window forward.
    fn drain<H>(&mut self, handler: &mut H)
    where
        H: SequenceHandler<Message = M>,
    {
        loop {
            if self.slots.is_empty() || !self.slots[0].occupied {
                break;
            }
            let slot = std::mem::replace(&mut self.slots[0], Slot::empty());
            let delivered_seq = self.next_expected;
            self.next_expected = self.next_expected.wrapping_add(1);
            self.slots.remove(0);
            self.slots.push(Slot::empty());
            handler.on_message(delivered_seq, slot.msg.expect("occupied slot has a message"));
        }
    }

    /// Sets `expected` without touching buffered slots. Used by the speaker
    /// manager after an overrun to demand a redrive.
    pub fn reset_sequence_number(&mut self, new_expected: u32) {
        self.next_expected = new_expected;
    }

    /// The missing-message timer fired; notify the handler if still
    /// waiting, and clear the waiting flag either way.
    pub fn on_timer_expired<H>(&mut self, handler: &mut H)
    where
        H: SequenceHandler<Message = M>,
    {
        if self.waiting_for_missing {
            handler.on_timeout_expired();
        }
        self.waiting_for_missing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        received: Vec<u32>,
        timeouts: u32,
    }

    impl Recorder {
        fn new() -> Self {
            Recorder {
                received: Vec::new(),
                timeouts: 0,
            }
        }
    }

    impl SequenceHandler for Recorder {
        type Message = u32;

        fn on_message(&mut self, sequence: u32, msg: u32) {
            assert_eq!(sequence, msg, "test messages carry their own sequence");
            self.received.push(sequence);
        }

        fn on_timeout_expired(&mut self) {
            self.timeouts += 1;
        }
    }

    #[test]
    fn in_order_delivery() {
        let mut seq = Sequencer::new(7, 4, Duration::from_millis(100));
        let mut rec = Recorder::new();
        for n in [7u32, 8, 9] {
            let outcome = seq.write(n, n, &mut rec);
            assert_eq!(outcome, WriteOutcome::Delivered);
        }
        assert_eq!(rec.received, vec![7, 8, 9]);
        assert_eq!(seq.next_expected(), 10);
        assert!(seq.buffer_is_empty());
        assert!(!seq.should_arm_timer());
    }

    #[test]
    fn reorder_within_window() {
        let mut seq = Sequencer::new(0, 4, Duration::from_millis(100));
        let mut rec = Recorder::new();
        assert_eq!(seq.write(2, 2, &mut rec), WriteOutcome::Buffered);
        assert!(rec.received.is_empty());
        assert_eq!(seq.write(1, 1, &mut rec), WriteOutcome::Buffered);
        assert!(rec.received.is_empty());
        assert_eq!(seq.write(0, 0, &mut rec), WriteOutcome::Delivered);
        assert_eq!(rec.received, vec![0, 1, 2]);
        assert_eq!(seq.next_expected(), 3);
    }

    #[test]
    fn wrap_and_late() {
        let mut seq = Sequencer::new(0xFFFF_FFFE, 2, Duration::from_millis(100));
        let mut rec = Recorder::new();
        assert_eq!(
            seq.write(0xFFFF_FFFF, 0xFFFF_FFFF, &mut rec),
            WriteOutcome::Delivered
        );
        assert_eq!(seq.write(0x0000_0000, 0x0000_0000, &mut rec), WriteOutcome::Delivered);
        assert_eq!(rec.received, vec![0xFFFF_FFFF, 0x0000_0000]);
        // Third write is strictly in the past relative to expected == 1.
        assert_eq!(seq.write(0xFFFF_FFFD, 0xFFFF_FFFD, &mut rec), WriteOutcome::Old);
        assert_eq!(rec.received, vec![0xFFFF_FFFF, 0x0000_0000]);
    }

    #[test]
    fn future_message_past_window_is_dropped() {
        let mut seq = Sequencer::new(0, 2, Duration::from_millis(100));
        let mut rec = Recorder::new();
        // distance 3 -> slot index 2, max_slots=2 -> dropped.
        assert_eq!(seq.write(3, 3, &mut rec), WriteOutcome::Dropped);
        assert!(rec.received.is_empty());
    }

    #[test]
    fn duplicate_slot_write_overwrites() {
        let mut seq = Sequencer::new(0, 4, Duration::from_millis(100));
        let mut rec = Recorder::new();
        assert_eq!(seq.write(2, 200, &mut rec), WriteOutcome::Buffered);
        assert_eq!(seq.write(2, 2, &mut rec), WriteOutcome::Buffered);
        seq.write(1, 1, &mut rec);
        seq.write(0, 0, &mut rec);
        assert_eq!(rec.received, vec![0, 1, 2]);
    }

    #[test]
    fn reset_sequence_number_does_not_touch_buffered_slots() {
        let mut seq = Sequencer::new(0, 4, Duration::from_millis(100));
        let mut rec = Recorder::new();
        seq.write(2, 2, &mut rec);
        seq.reset_sequence_number(5);
        assert_eq!(seq.next_expected(), 5);
        // The buffered slot at old index 1 (seq 2) is now stale relative to
        // the new expectation, but it is still physically present.
        assert!(!seq.buffer_is_empty());
    }

    #[test]
    fn timer_fires_timeout_only_while_waiting() {
        let mut seq = Sequencer::new(0, 4, Duration::from_millis(50));
        let mut rec = Recorder::new();
        seq.write(1, 1, &mut rec);
        assert!(seq.should_arm_timer());
        seq.on_timer_expired(&mut rec);
        assert_eq!(rec.timeouts, 1);
        assert!(!seq.should_arm_timer());

        // A second expiry with nothing pending must not re-notify.
        seq.on_timer_expired(&mut rec);
        assert_eq!(rec.timeouts, 1);
    }

    #[test]
    fn zero_timeout_never_arms() {
        let mut seq = Sequencer::new(0, 4, Duration::from_millis(0));
        let mut rec = Recorder::new();
        seq.write(1, 1, &mut rec);
        assert!(!seq.should_arm_timer());
    }
}
