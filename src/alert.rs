//! Alert manager (§4.7): owns the persistent alerts list and the
//! offline-playback / disconnect decision loop. Same `Mutex`-guarded-state
//! idiom as the speaker and microphone managers; persistence is an
//! injected `Arc<dyn AlertStore>`/`Arc<dyn VolumeStore>` capability pair
//! instead of a database crate, matching the corpus's preference for
//! `serde`/`serde_json` over pulling in a new persistence dependency.

use crate::events::{BufferState, Event};
use crate::speaker::SpeakerManager;
use crate::ux::{AttentionState, UxManager, UxState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub token: [u8; 8],
    pub scheduled_time_s: u64,
    pub duration_ms: u32,
    pub kind: u8,
}

pub trait AlertStore: Send + Sync {
    fn size(&self) -> usize;
    fn load_all(&self) -> Vec<Alert>;
    fn store_alert(&self, alert: &Alert) -> Result<(), std::io::Error>;
    fn delete_alert(&self, token: &[u8; 8]) -> Result<(), std::io::Error>;
}

pub trait VolumeStore: Send + Sync {
    fn load_volume(&self) -> u8;
    fn store_volume(&self, volume: u8) -> Result<(), std::io::Error>;
}

/// Request the transport layer tear the connection down and reconnect,
/// mirroring `CriticalFailureHook`'s "notify, don't act" contract.
pub trait ConnectionSupervisor: Send + Sync {
    fn request_disconnect(&self, cause: &str);
}

/// In-memory test double for both stores.
pub struct InMemoryAlertStore {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        InMemoryAlertStore { alerts: Mutex::new(Vec::new()) }
    }
}

impl Default for InMemoryAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertStore for InMemoryAlertStore {
    fn size(&self) -> usize {
        self.alerts.lock().len()
    }

    fn load_all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), std::io::Error> {
        let mut alerts = self.alerts.lock();
        alerts.retain(|a| a.token != alert.token);
        alerts.push(*alert);
        Ok(())
    }

    fn delete_alert(&self, token: &[u8; 8]) -> Result<(), std::io::Error> {
        self.alerts.lock().retain(|a| &a.token != token);
        Ok(())
    }
}

pub struct InMemoryVolumeStore {
    volume: Mutex<u8>,
}

impl InMemoryVolumeStore {
    pub fn new(initial: u8) -> Self {
        InMemoryVolumeStore { volume: Mutex::new(initial) }
    }
}

impl VolumeStore for InMemoryVolumeStore {
    fn load_volume(&self) -> u8 {
        *self.volume.lock()
    }

    fn store_volume(&self, volume: u8) -> Result<(), std::io::Error> {
        *self.volume.lock() = volume;
        Ok(())
    }
}

/// File-backed default: one JSON object per line (JSON-lines), rewritten
/// in full on every mutation. Fine for the handful of alerts a single
/// device carries; not meant for high write volume.
pub struct FileAlertStore {
    path: PathBuf,
}

impl FileAlertStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAlertStore { path: path.into() }
    }

    fn read_all(&self) -> Vec<Alert> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents.lines().filter_map(|line| serde_json::from_str(line).ok()).collect()
    }

    fn write_all(&self, alerts: &[Alert]) -> std::io::Result<()> {
        let mut out = String::new();
        for alert in alerts {
            out.push_str(&serde_json::to_string(alert).expect("Alert always serializes"));
            out.push('\n');
        }
        std::fs::write(&self.path, out)
    }
}

impl AlertStore for FileAlertStore {
    fn size(&self) -> usize {
        self.read_all().len()
    }

    fn load_all(&self) -> Vec<Alert> {
        self.read_all()
    }

    fn store_alert(&self, alert: &Alert) -> Result<(), std::io::Error> {
        let mut alerts = self.read_all();
        alerts.retain(|a| a.token != alert.token);
        alerts.push(*alert);
        self.write_all(&alerts)
    }

    fn delete_alert(&self, token: &[u8; 8]) -> Result<(), std::io::Error> {
        let mut alerts = self.read_all();
        alerts.retain(|a| &a.token != token);
        self.write_all(&alerts)
    }
}

#[derive(Serialize, Deserialize)]
struct VolumeFile {
    volume: u8,
}

pub struct FileVolumeStore {
    path: PathBuf,
    default_volume: u8,
}

impl FileVolumeStore {
    pub fn new(path: impl Into<PathBuf>, default_volume: u8) -> Self {
        FileVolumeStore { path: path.into(), default_volume }
    }
}

impl VolumeStore for FileVolumeStore {
    fn load_volume(&self) -> u8 {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str::<VolumeFile>(&s).ok())
            .map(|v| v.volume)
            .unwrap_or(self.default_volume)
    }

    fn store_volume(&self, volume: u8) -> Result<(), std::io::Error> {
        let serialized = serde_json::to_string(&VolumeFile { volume }).expect("VolumeFile always serializes");
        std::fs::write(&self.path, serialized)
    }
}

fn insert_sorted(alerts: &mut Vec<Alert>, alert: Alert) {
    let idx = alerts.partition_point(|a| a.scheduled_time_s <= alert.scheduled_time_s);
    alerts.insert(idx, alert);
}

struct AlertManagerState {
    alerts: Vec<Alert>,
    offline_alert_volume: u8,
    is_playing_offline_alert: bool,
    stuck_checks: u32,
}

pub struct AlertManager {
    state: Mutex<AlertManagerState>,
    store: Arc<dyn AlertStore>,
    volume_store: Arc<dyn VolumeStore>,
    speaker: Arc<SpeakerManager>,
    ux: Arc<UxManager>,
    supervisor: Arc<dyn ConnectionSupervisor>,
    expiration: Duration,
}

impl AlertManager {
    pub fn new(
        store: Arc<dyn AlertStore>,
        volume_store: Arc<dyn VolumeStore>,
        speaker: Arc<SpeakerManager>,
        ux: Arc<UxManager>,
        supervisor: Arc<dyn ConnectionSupervisor>,
        expiration: Duration,
    ) -> Self {
        let alerts = store.load_all();
        let offline_alert_volume = volume_store.load_volume();
        AlertManager {
            state: Mutex::new(AlertManagerState {
                alerts,
                offline_alert_volume,
                is_playing_offline_alert: false,
                stuck_checks: 0,
            }),
            store,
            volume_store,
            speaker,
            ux,
            supervisor,
            expiration,
        }
    }

    /// `SetAlert{token, scheduledTime, duration, type}`.
    pub fn set_alert(&self, token: [u8; 8], scheduled_time_s: u64, duration_ms: u32, kind: u8) -> Vec<Event> {
        let mut state = self.state.lock();
        let rollback = state.alerts.clone();
        state.alerts.retain(|a| a.token != token);
        let alert = Alert { token, scheduled_time_s, duration_ms, kind };
        insert_sorted(&mut state.alerts, alert);

        match self.store.store_alert(&alert) {
            Ok(()) => vec![Event::SetAlertSucceeded { token: token_to_string(&token) }],
            Err(e) => {
                tracing::warn!(error = %e, "failed to persist alert");
                state.alerts = rollback;
                vec![Event::SetAlertFailed { token: token_to_string(&token) }]
            }
        }
    }

    /// `DeleteAlert{token}`.
    pub fn delete_alert(&self, token: [u8; 8]) -> Vec<Event> {
        match self.store.delete_alert(&token) {
            Ok(()) => {
                self.state.lock().alerts.retain(|a| a.token != token);
                vec![Event::DeleteAlertSucceeded { token: token_to_string(&token) }]
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to delete persisted alert");
                vec![Event::DeleteAlertFailed { token: token_to_string(&token) }]
            }
        }
    }

    /// `SetAlertVolume{volume}`.
    pub fn set_alert_volume(&self, volume: u8) -> Vec<Event> {
        self.state.lock().offline_alert_volume = volume;
        if let Err(e) = self.volume_store.store_volume(volume) {
            tracing::warn!(error = %e, "failed to persist offline alert volume");
        }
        vec![Event::AlertVolumeChanged { volume }]
    }

    /// Drop any alert more than `expiration` in the past relative to
    /// `now_s`.
    pub fn prune_expired(&self, now_s: u64) {
        let cutoff = now_s.saturating_sub(self.expiration.as_secs());
        self.state.lock().alerts.retain(|a| a.scheduled_time_s >= cutoff);
    }

    pub fn alert_count(&self) -> usize {
        self.state.lock().alerts.len()
    }

    fn earliest_unexpired(&self, now_s: u64) -> Option<Alert> {
        self.state.lock().alerts.iter().find(|a| a.scheduled_time_s <= now_s).copied()
    }

    /// One offline-playback decision tick (§4.7), driven by a periodic
    /// timer re-armed by the caller to the next alert's `scheduledTime`.
    pub fn offline_playback_tick(&self, now_s: u64) {
        self.prune_expired(now_s);

        let voice_facing = matches!(self.ux.current(), UxState::Listening | UxState::Speaking | UxState::Thinking);

        if !self.speaker.is_streaming() && !voice_facing {
            match self.earliest_unexpired(now_s) {
                Some(alert) => {
                    let volume = self.state.lock().offline_alert_volume;
                    self.speaker.set_volume(volume, None);
                    if self.speaker.is_streaming() {
                        // Speaker came alive between the check above and now;
                        // defer to it rather than fighting over the output.
                        return;
                    }
                    if !self.state.lock().is_playing_offline_alert {
                        self.speaker.play_offline_alert(alert.kind);
                        self.state.lock().is_playing_offline_alert = true;
                        self.ux.set_attention_state(AttentionState::Alerting, None);
                    }
                }
                None => {
                    if self.state.lock().is_playing_offline_alert {
                        self.speaker.stop_offline_alert();
                        self.state.lock().is_playing_offline_alert = false;
                    }
                }
            }
            self.state.lock().stuck_checks = 0;
            return;
        }

        if self.state.lock().is_playing_offline_alert {
            self.speaker.stop_offline_alert();
            self.state.lock().is_playing_offline_alert = false;
        }

        let stuck = matches!(self.speaker.buffer_state(), BufferState::Underrun) || self.ux.current() == UxState::Alerting;
        let mut state = self.state.lock();
        if stuck {
            state.stuck_checks += 1;
            if state.stuck_checks >= 2 {
                drop(state);
                self.supervisor.request_disconnect("going-offline");
            }
        } else {
            state.stuck_checks = 0;
        }
    }
}

fn token_to_string(token: &[u8; 8]) -> String {
    token.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_buffer::{DataStreamBuffer, ReaderPolicy, WriterPolicy};

    struct NoopPlatform;
    impl crate::speaker::SpeakerPlatform for NoopPlatform {
        fn push_frame(&self, _frame: &[u8]) -> bool {
            true
        }
        fn set_volume(&self, _volume: u8) {}
        fn play_offline_alert(&self, _alert_kind: u8) -> bool {
            true
        }
        fn stop_offline_alert(&self) -> bool {
            true
        }
    }

    struct RecordingPlatform {
        played: Mutex<Vec<u8>>,
        stopped: Mutex<u32>,
    }
    impl RecordingPlatform {
        fn new() -> Arc<Self> {
            Arc::new(RecordingPlatform { played: Mutex::new(Vec::new()), stopped: Mutex::new(0) })
        }
    }
    impl crate::speaker::SpeakerPlatform for RecordingPlatform {
        fn push_frame(&self, _frame: &[u8]) -> bool {
            true
        }
        fn set_volume(&self, _volume: u8) {}
        fn play_offline_alert(&self, alert_kind: u8) -> bool {
            self.played.lock().push(alert_kind);
            true
        }
        fn stop_offline_alert(&self) -> bool {
            *self.stopped.lock() += 1;
            true
        }
    }

    struct NoopObserver;
    impl crate::ux::UxObserver for NoopObserver {
        fn on_ux_state_changed(&self, _state: UxState) {}
    }

    struct RecordingSupervisor {
        disconnects: Mutex<Vec<String>>,
    }
    impl RecordingSupervisor {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSupervisor { disconnects: Mutex::new(Vec::new()) })
        }
    }
    impl ConnectionSupervisor for RecordingSupervisor {
        fn request_disconnect(&self, cause: &str) {
            self.disconnects.lock().push(cause.to_string());
        }
    }

    fn manager() -> (AlertManager, Arc<RecordingSupervisor>) {
        let (manager, supervisor, _platform) = manager_with_platform(Arc::new(NoopPlatform));
        (manager, supervisor)
    }

    fn manager_with_platform(
        platform: Arc<dyn crate::speaker::SpeakerPlatform>,
    ) -> (AlertManager, Arc<RecordingSupervisor>, Arc<SpeakerManager>) {
        let buffer = DataStreamBuffer::create(64, 1, 1);
        let writer = buffer.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buffer.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        let speaker = Arc::new(SpeakerManager::new(writer, reader, platform, 48, 8, 1, Duration::from_millis(10), 50));
        let ux = Arc::new(UxManager::new(Arc::new(NoopObserver)));
        let supervisor = RecordingSupervisor::new();
        let manager = AlertManager::new(
            Arc::new(InMemoryAlertStore::new()),
            Arc::new(InMemoryVolumeStore::new(50)),
            Arc::clone(&speaker),
            ux,
            Arc::clone(&supervisor) as Arc<dyn ConnectionSupervisor>,
            Duration::from_secs(3600),
        );
        (manager, supervisor, speaker)
    }

    #[test]
    fn set_alert_then_delete_round_trips_through_the_store() {
        let (manager, _sup) = manager();
        let token = [1u8; 8];
        let events = manager.set_alert(token, 1_000, 500, 2);
        assert!(matches!(events.as_slice(), [Event::SetAlertSucceeded { .. }]));
        assert_eq!(manager.alert_count(), 1);

        let events = manager.delete_alert(token);
        assert!(matches!(events.as_slice(), [Event::DeleteAlertSucceeded { .. }]));
        assert_eq!(manager.alert_count(), 0);
    }

    #[test]
    fn re_setting_the_same_token_replaces_rather_than_duplicates() {
        let (manager, _sup) = manager();
        let token = [2u8; 8];
        manager.set_alert(token, 1_000, 500, 0);
        manager.set_alert(token, 2_000, 500, 0);
        assert_eq!(manager.alert_count(), 1);
    }

    #[test]
    fn alerts_stay_sorted_by_scheduled_time() {
        let (manager, _sup) = manager();
        manager.set_alert([1; 8], 500, 0, 0);
        manager.set_alert([2; 8], 100, 0, 0);
        manager.set_alert([3; 8], 300, 0, 0);
        let times: Vec<u64> = manager.state.lock().alerts.iter().map(|a| a.scheduled_time_s).collect();
        assert_eq!(times, vec![100, 300, 500]);
    }

    #[test]
    fn expired_alerts_are_pruned_on_inspection() {
        let (manager, _sup) = manager();
        manager.set_alert([9; 8], 10, 0, 0);
        manager.prune_expired(10_000);
        assert_eq!(manager.alert_count(), 0);
    }

    #[test]
    fn set_alert_volume_emits_alert_volume_changed() {
        let (manager, _sup) = manager();
        let events = manager.set_alert_volume(90);
        assert!(matches!(events.as_slice(), [Event::AlertVolumeChanged { volume: 90 }]));
    }

    #[test]
    fn stuck_underrun_for_two_checks_requests_disconnect() {
        let (manager, supervisor) = manager();
        manager.speaker.test_set_streaming(true, BufferState::Underrun);

        manager.offline_playback_tick(0);
        assert!(supervisor.disconnects.lock().is_empty(), "first stuck check must not disconnect yet");
        manager.offline_playback_tick(0);
        assert_eq!(supervisor.disconnects.lock().as_slice(), &["going-offline".to_string()]);
    }

    #[test]
    fn not_stuck_when_buffer_state_recovers_between_checks() {
        let (manager, supervisor) = manager();
        manager.speaker.test_set_streaming(true, BufferState::Underrun);
        manager.offline_playback_tick(0);

        manager.speaker.test_set_streaming(true, BufferState::None);
        manager.offline_playback_tick(0);
        assert!(supervisor.disconnects.lock().is_empty());
    }

    #[test]
    fn idle_system_with_a_due_alert_starts_offline_playback() {
        let (manager, _sup) = manager();
        manager.set_alert([4; 8], 0, 500, 1);
        manager.offline_playback_tick(0);
        assert!(manager.state.lock().is_playing_offline_alert);
        assert_eq!(manager.ux.current(), UxState::Alerting);
    }

    #[test]
    fn due_alert_drives_the_platform_with_its_kind_and_stops_once_gone() {
        let platform = RecordingPlatform::new();
        let (manager, _sup, _speaker) = manager_with_platform(Arc::clone(&platform) as Arc<dyn crate::speaker::SpeakerPlatform>);
        manager.set_alert([7; 8], 0, 500, 3);

        manager.offline_playback_tick(0);
        assert_eq!(platform.played.lock().as_slice(), &[3]);
        assert_eq!(*platform.stopped.lock(), 0);

        // A second tick while still playing the same alert must not re-trigger it.
        manager.offline_playback_tick(0);
        assert_eq!(platform.played.lock().len(), 1);

        manager.delete_alert([7; 8]);
        manager.offline_playback_tick(0);
        assert_eq!(*platform.stopped.lock(), 1);
    }
}
