//! Clock manager (§6 "Platform callbacks"): the NTP-epoch / monotonic
//! clock is an external collaborator whose interface is fixed by the
//! platform, realized as a capability trait like the speaker/microphone
//! platform hooks. The manager itself only tracks whether the platform
//! clock has been synchronized since boot and emits `SynchronizeClock`
//! the first time a sync is requested.

use crate::events::Event;
use parking_lot::Mutex;
use std::sync::Arc;

/// Platform clock capability, replacing a `void*`-callback pair.
pub trait ClockCapability: Send + Sync {
    fn time_since_ntp_epoch_s(&self) -> u64;
    fn monotonic_ms(&self) -> u64;
    fn set_ntp_epoch_s(&self, epoch_s: u64);
}

/// Default clock backed by the host's system clock and a process-start
/// `Instant`. A real device would source `time_since_ntp_epoch_s` from an
/// actual NTP client instead.
pub struct SystemClock {
    started_at: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock { started_at: std::time::Instant::now() }
    }
}

impl ClockCapability for SystemClock {
    fn time_since_ntp_epoch_s(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn monotonic_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    fn set_ntp_epoch_s(&self, epoch_s: u64) {
        tracing::debug!(epoch_s, "set_ntp_epoch_s (system clock is read-only, logged only)");
    }
}

struct ClockManagerState {
    synchronized: bool,
}

pub struct ClockManager {
    state: Mutex<ClockManagerState>,
    clock: Arc<dyn ClockCapability>,
}

impl ClockManager {
    pub fn new(clock: Arc<dyn ClockCapability>) -> Self {
        ClockManager {
            state: Mutex::new(ClockManagerState { synchronized: false }),
            clock,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.state.lock().synchronized
    }

    /// Called once the connection is established; emits `SynchronizeClock`
    /// the first time, so the service knows to push an epoch. Idempotent
    /// after a successful `apply_epoch`.
    pub fn request_sync_if_needed(&self) -> Vec<Event> {
        let state = self.state.lock();
        if state.synchronized {
            return Vec::new();
        }
        vec![Event::SynchronizeClock]
    }

    /// Applies an NTP epoch pushed by the service, forwarding it to the
    /// platform and marking the clock synchronized.
    pub fn apply_epoch(&self, epoch_s: u64) {
        self.clock.set_ntp_epoch_s(epoch_s);
        self.state.lock().synchronized = true;
    }

    pub fn time_since_ntp_epoch_s(&self) -> u64 {
        self.clock.time_since_ntp_epoch_s()
    }

    pub fn monotonic_ms(&self) -> u64 {
        self.clock.monotonic_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClock {
        epoch: AtomicU64,
    }

    impl ClockCapability for FakeClock {
        fn time_since_ntp_epoch_s(&self) -> u64 {
            self.epoch.load(Ordering::Relaxed)
        }
        fn monotonic_ms(&self) -> u64 {
            0
        }
        fn set_ntp_epoch_s(&self, epoch_s: u64) {
            self.epoch.store(epoch_s, Ordering::Relaxed);
        }
    }

    #[test]
    fn requests_sync_exactly_once_before_applied() {
        let clock = Arc::new(FakeClock { epoch: AtomicU64::new(0) });
        let manager = ClockManager::new(clock);
        assert_eq!(manager.request_sync_if_needed().len(), 1);
        assert_eq!(manager.request_sync_if_needed().len(), 1, "still unsynchronized, still requests");

        manager.apply_epoch(1_700_000_000);
        assert!(manager.is_synchronized());
        assert!(manager.request_sync_if_needed().is_empty());
        assert_eq!(manager.time_since_ntp_epoch_s(), 1_700_000_000);
    }
}
