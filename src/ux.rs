//! UX manager (§4.6): aggregates the attention state pushed by the
//! service with local microphone state into a single UX state, reported
//! to an observer capability on every recomputation. Schedules
//! offset-gated attention changes through the same `OffsetActionQueue`
//! type the speaker manager owns — one shared generic queue, not a
//! copy-pasted one.

use crate::offset_action::OffsetActionQueue;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UxState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
    Listening,
}

impl From<AttentionState> for UxState {
    fn from(a: AttentionState) -> Self {
        match a {
            AttentionState::Idle => UxState::Idle,
            AttentionState::Thinking => UxState::Thinking,
            AttentionState::Speaking => UxState::Speaking,
            AttentionState::Alerting => UxState::Alerting,
            AttentionState::NotificationAvailable => UxState::NotificationAvailable,
            AttentionState::DoNotDisturb => UxState::DoNotDisturb,
        }
    }
}

/// Observer capability replacing a C callback pointer.
pub trait UxObserver: Send + Sync {
    fn on_ux_state_changed(&self, state: UxState);
}

/// Default observer that just logs, matching `LoggingCriticalFailureHook`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingUxObserver;

impl UxObserver for LoggingUxObserver {
    fn on_ux_state_changed(&self, state: UxState) {
        tracing::debug!(?state, "ux state changed");
    }
}

struct UxManagerState {
    attention: AttentionState,
    microphone_open: bool,
    current: UxState,
    offset_actions: OffsetActionQueue<AttentionState>,
}

pub struct UxManager {
    state: Mutex<UxManagerState>,
    observer: std::sync::Arc<dyn UxObserver>,
}

impl UxManager {
    pub fn new(observer: std::sync::Arc<dyn UxObserver>) -> Self {
        UxManager {
            state: Mutex::new(UxManagerState {
                attention: AttentionState::Idle,
                microphone_open: false,
                current: UxState::Idle,
                offset_actions: OffsetActionQueue::new(),
            }),
            observer,
        }
    }

    fn recompute_locked(&self, state: &mut UxManagerState) {
        let next = if state.microphone_open {
            UxState::Listening
        } else {
            state.attention.into()
        };
        if next != state.current {
            state.current = next;
            self.observer.on_ux_state_changed(next);
        }
    }

    /// `SetAttentionState{state, offset?}`. Without an offset, applies
    /// immediately; with one, schedules through the offset-action queue
    /// (drained by whichever caller owns the reader cursor, mirroring the
    /// speaker manager's own offset actions).
    pub fn set_attention_state(&self, attention: AttentionState, offset: Option<u64>) {
        let mut state = self.state.lock();
        match offset {
            None => {
                state.attention = attention;
                self.recompute_locked(&mut state);
            }
            Some(o) => {
                state.offset_actions.schedule(o, attention);
            }
        }
    }

    /// Drains attention actions due by `reader_offset`, applying each.
    pub fn drain_due_attention_actions(&self, reader_offset: u64) {
        let due = self.state.lock().offset_actions.drain_due(reader_offset);
        for (_handle, attention) in due {
            let mut state = self.state.lock();
            state.attention = attention;
            self.recompute_locked(&mut state);
        }
    }

    /// Barge-in: invalidate every pending attention action without
    /// applying it.
    pub fn invalidate_pending_attention_actions(&self) {
        self.state.lock().offset_actions.invalidate_all();
    }

    pub fn set_microphone_open(&self, open: bool) {
        let mut state = self.state.lock();
        state.microphone_open = open;
        self.recompute_locked(&mut state);
    }

    pub fn current(&self) -> UxState {
        self.state.lock().current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingObserver {
        seen: StdMutex<Vec<UxState>>,
    }

    impl RecordingObserver {
        fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(RecordingObserver { seen: StdMutex::new(Vec::new()) })
        }
    }

    impl UxObserver for RecordingObserver {
        fn on_ux_state_changed(&self, state: UxState) {
            self.seen.lock().unwrap().push(state);
        }
    }

    #[test]
    fn listening_wins_over_any_attention_state_while_microphone_is_open() {
        let observer = RecordingObserver::new();
        let manager = UxManager::new(observer.clone());
        manager.set_attention_state(AttentionState::Thinking, None);
        manager.set_microphone_open(true);
        assert_eq!(manager.current(), UxState::Listening);

        manager.set_attention_state(AttentionState::Alerting, None);
        assert_eq!(manager.current(), UxState::Listening, "mic open must keep masking attention changes");
    }

    #[test]
    fn attention_state_surfaces_once_microphone_closes() {
        let observer = RecordingObserver::new();
        let manager = UxManager::new(observer.clone());
        manager.set_microphone_open(true);
        manager.set_attention_state(AttentionState::Alerting, None);
        assert_eq!(manager.current(), UxState::Listening);

        manager.set_microphone_open(false);
        assert_eq!(manager.current(), UxState::Alerting);
    }

    #[test]
    fn repeated_identical_state_does_not_notify_again() {
        let observer = RecordingObserver::new();
        let manager = UxManager::new(observer.clone());
        manager.set_attention_state(AttentionState::Idle, None);
        manager.set_attention_state(AttentionState::Idle, None);
        assert_eq!(observer.seen.lock().unwrap().len(), 0, "idle->idle is the initial state, no transition");
    }

    #[test]
    fn offset_gated_attention_change_applies_only_once_drained() {
        let observer = RecordingObserver::new();
        let manager = UxManager::new(observer.clone());
        manager.set_attention_state(AttentionState::Speaking, Some(100));
        assert_eq!(manager.current(), UxState::Idle, "offset-gated change must not apply immediately");

        manager.drain_due_attention_actions(50);
        assert_eq!(manager.current(), UxState::Idle, "not yet due");

        manager.drain_due_attention_actions(100);
        assert_eq!(manager.current(), UxState::Speaking);
    }

    #[test]
    fn barge_in_invalidates_pending_attention_actions() {
        let observer = RecordingObserver::new();
        let manager = UxManager::new(observer.clone());
        manager.set_attention_state(AttentionState::Speaking, Some(100));
        manager.invalidate_pending_attention_actions();
        manager.drain_due_attention_actions(1000);
        assert_eq!(manager.current(), UxState::Idle);
    }
}
