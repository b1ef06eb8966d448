//! Generic sorted queue of actions keyed to an absolute byte offset,
//! shared by the speaker manager and the UX manager (§4.4, §4.6). The
//! "arena + indices" design note (§9) is realized here: a handle is a
//! stable `u64` id rather than an intrusive-linked-list node, and
//! cancellation tombstones an entry instead of shifting the vector around
//! a live iterator.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionHandle(u64);

struct Entry<T> {
    offset: u64,
    handle: ActionHandle,
    payload: Option<T>,
}

/// Actions are kept sorted by `offset` ascending via
/// `Vec::partition_point` + `insert`; ties are broken by insertion order
/// since handle ids are monotonically increasing.
pub struct OffsetActionQueue<T> {
    next_id: u64,
    entries: Vec<Entry<T>>,
}

impl<T> Default for OffsetActionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OffsetActionQueue<T> {
    pub fn new() -> Self {
        OffsetActionQueue {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.payload.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule `payload` to fire once the reader/offset cursor reaches
    /// `offset` or later. Returns a handle usable with `cancel`.
    pub fn schedule(&mut self, offset: u64, payload: T) -> ActionHandle {
        let handle = ActionHandle(self.next_id);
        self.next_id += 1;
        let idx = self.entries.partition_point(|e| e.offset <= offset);
        self.entries.insert(
            idx,
            Entry {
                offset,
                handle,
                payload: Some(payload),
            },
        );
        handle
    }

    /// Tombstone a still-pending action so it never fires. Returns `true`
    /// if the handle was found and pending.
    pub fn cancel(&mut self, handle: ActionHandle) -> bool {
        for entry in &mut self.entries {
            if entry.handle == handle && entry.payload.is_some() {
                entry.payload = None;
                return true;
            }
        }
        false
    }

    /// Remove and return every non-cancelled action with
    /// `offset <= up_to_offset`, in non-decreasing offset order.
    pub fn drain_due(&mut self, up_to_offset: u64) -> Vec<(ActionHandle, T)> {
        let mut fired = Vec::new();
        while let Some(first) = self.entries.first() {
            if first.offset > up_to_offset {
                break;
            }
            let entry = self.entries.remove(0);
            if let Some(payload) = entry.payload {
                fired.push((entry.handle, payload));
            }
        }
        fired
    }

    /// Barge-in: remove every still-pending action regardless of offset,
    /// for the caller to re-fire with `valid = false`.
    pub fn invalidate_all(&mut self) -> Vec<(ActionHandle, T)> {
        self.entries
            .drain(..)
            .filter_map(|e| e.payload.map(|p| (e.handle, p)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_fire_in_non_decreasing_offset_order_regardless_of_registration_order() {
        let mut queue = OffsetActionQueue::new();
        queue.schedule(8, "third");
        queue.schedule(2, "first");
        queue.schedule(5, "second");

        let fired = queue.drain_due(100);
        let payloads: Vec<_> = fired.into_iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec!["first", "second", "third"]);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut queue = OffsetActionQueue::new();
        queue.schedule(4, "a");
        queue.schedule(4, "b");
        queue.schedule(4, "c");
        let fired: Vec<_> = queue.drain_due(4).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec!["a", "b", "c"]);
    }

    #[test]
    fn drain_due_only_returns_actions_within_the_offset_bound() {
        let mut queue = OffsetActionQueue::new();
        queue.schedule(10, "far");
        queue.schedule(1, "near");
        let fired: Vec<_> = queue.drain_due(5).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec!["near"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut queue = OffsetActionQueue::new();
        let handle = queue.schedule(4, "cancel-me");
        queue.schedule(4, "keep-me");
        assert!(queue.cancel(handle));
        let fired: Vec<_> = queue.drain_due(4).into_iter().map(|(_, p)| p).collect();
        assert_eq!(fired, vec!["keep-me"]);
    }

    #[test]
    fn cancel_on_unknown_handle_returns_false() {
        let mut queue: OffsetActionQueue<&str> = OffsetActionQueue::new();
        let handle = queue.schedule(1, "x");
        queue.drain_due(10);
        assert!(!queue.cancel(handle));
    }

    #[test]
    fn invalidate_all_drains_everything_for_barge_in() {
        let mut queue = OffsetActionQueue::new();
        queue.schedule(8, "volume");
        queue.schedule(20, "attention");
        let invalidated: Vec<_> = queue.invalidate_all().into_iter().map(|(_, p)| p).collect();
        assert_eq!(invalidated, vec!["volume", "attention"]);
        assert!(queue.is_empty());
    }
}
