//! Speaker manager (§4.4): consumes the speaker topic's binary entries,
//! writes compressed audio frames into a data-stream buffer, and drives
//! playback through a platform `push_frame` callback.
//!
//! All mutable fields are owned by a single `parking_lot::Mutex`-guarded
//! `SpeakerManagerState`, the way `persona.rs`'s `PersonaState` guards its
//! `RwLock`: public methods acquire, private `*_locked` helpers assume the
//! guard is held. The buffer reader/writer are deliberately kept outside
//! that mutex — they are already lock-free via `stream_buffer`'s atomics,
//! and the playback tick's only `.await` point (`reader.read`) happens
//! with the state lock released, so the lock itself never needs to be
//! `tokio::sync::Mutex`.

use crate::events::{BufferState, Event};
use crate::framing::{self, BinaryEntry, SpeakerContent};
use crate::offset_action::OffsetActionQueue;
use crate::stream_buffer::{DataStreamReader, DataStreamWriter, ReadError, SeekReference, WriterPolicy};
use crate::topic::Topic;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Platform capability object replacing a C `void*` callback (§9's
/// "capability objects instead of `void*`" design note).
pub trait SpeakerPlatform: Send + Sync {
    fn push_frame(&self, frame: &[u8]) -> bool;
    fn set_volume(&self, volume: u8);
    fn play_offline_alert(&self, alert_kind: u8) -> bool;
    fn stop_offline_alert(&self) -> bool;
}

/// Default `SpeakerPlatform` for deployments with no real audio codec
/// wired in yet; logs instead of driving hardware, matching
/// `error.rs`'s `LoggingCriticalFailureHook` fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSpeakerPlatform;

impl SpeakerPlatform for LoggingSpeakerPlatform {
    fn push_frame(&self, frame: &[u8]) -> bool {
        tracing::trace!(bytes = frame.len(), "push_frame");
        true
    }
    fn set_volume(&self, volume: u8) {
        tracing::debug!(volume, "set_volume");
    }
    fn play_offline_alert(&self, alert_kind: u8) -> bool {
        tracing::info!(alert_kind, "play_offline_alert");
        true
    }
    fn stop_offline_alert(&self) -> bool {
        tracing::info!("stop_offline_alert");
        true
    }
}

#[derive(Debug, Clone)]
enum SpeakerOffsetAction {
    SetVolume(u8),
    Close,
}

struct SpeakerManagerState {
    is_open: bool,
    pending_open: bool,
    pending_open_offset: u64,
    frame_size: Option<usize>,
    buffer_state: BufferState,
    overrun_sequence: Option<u32>,
    current_volume: u8,
    volume_is_initial: bool,
    offset_actions: OffsetActionQueue<SpeakerOffsetAction>,
    /// Markers recorded at the writer's absolute byte offset at receipt
    /// time, fired once the reader passes that offset.
    markers: Vec<(u64, u32)>,
    is_ready_for_data: bool,
    backup_frame: Option<Vec<u8>>,
}

impl SpeakerManagerState {
    fn new(initial_volume: u8) -> Self {
        SpeakerManagerState {
            is_open: false,
            pending_open: false,
            pending_open_offset: 0,
            frame_size: None,
            buffer_state: BufferState::None,
            overrun_sequence: None,
            current_volume: initial_volume,
            volume_is_initial: true,
            offset_actions: OffsetActionQueue::new(),
            markers: Vec::new(),
            is_ready_for_data: true,
            backup_frame: None,
        }
    }
}

pub struct SpeakerManager {
    state: Mutex<SpeakerManagerState>,
    writer: DataStreamWriter,
    reader: DataStreamReader,
    platform: Arc<dyn SpeakerPlatform>,
    overrun_warning_words: u64,
    underrun_warning_words: u64,
    word_size: u64,
    read_timeout: Duration,
}

impl SpeakerManager {
    pub fn new(
        writer: DataStreamWriter,
        reader: DataStreamReader,
        platform: Arc<dyn SpeakerPlatform>,
        overrun_warning_words: u64,
        underrun_warning_words: u64,
        word_size: u64,
        read_timeout: Duration,
        initial_volume: u8,
    ) -> Self {
        let manager = SpeakerManager {
            state: Mutex::new(SpeakerManagerState::new(initial_volume)),
            writer,
            reader,
            platform,
            overrun_warning_words,
            underrun_warning_words,
            word_size,
            read_timeout,
        };
        // Drives the boot volume through the same path a real SetVolume
        // would, so `volume_is_initial` is consumed here rather than
        // swallowing the first directive the service actually sends.
        let _ = manager.apply_volume_now(initial_volume);
        manager
    }

    fn words_buffered(&self) -> u64 {
        self.writer.tell().saturating_sub(self.reader.tell(SeekReference::Absolute))
    }

    fn recompute_buffer_state_locked(&self, state: &mut SpeakerManagerState, is_open: bool) -> Option<Event> {
        if !is_open {
            return None;
        }
        let filled = self.words_buffered();
        let target = if filled >= self.overrun_warning_words {
            BufferState::OverrunWarning
        } else if filled <= self.underrun_warning_words {
            BufferState::UnderrunWarning
        } else {
            BufferState::None
        };
        if target == state.buffer_state {
            return None;
        }
        let is_warning = matches!(target, BufferState::OverrunWarning | BufferState::UnderrunWarning);
        state.buffer_state = target;
        if is_warning {
            Some(Event::BufferStateChanged {
                topic: Topic::Speaker,
                sequence_number: 0,
                state: target,
            })
        } else {
            None
        }
    }

    /// §4.4 per-message handling, called from the speaker sequencer's
    /// handler. Returns the events to publish on the *event* topic.
    pub fn handle_message(&self, sequence: u32, body: &[u8]) -> (Vec<Event>, Option<u32>) {
        let mut events = Vec::new();
        let mut state = self.state.lock();

        if let Some(expected) = state.overrun_sequence {
            if sequence != expected {
                return (events, None);
            }
            state.overrun_sequence = None;
        }

        let entries = match BinaryEntry::parse_all(body, Topic::Speaker) {
            Ok(e) => e,
            Err(e) => {
                events.push(Event::ExceptionEncountered {
                    topic: Topic::Speaker,
                    sequence_number: sequence,
                    index: None,
                    message: e.to_string(),
                });
                return (events, None);
            }
        };

        let mut total_audio = 0usize;
        for entry in &entries {
            if entry.entry_type == framing::ENTRY_SPEAKER_CONTENT {
                if let Ok(content) = SpeakerContent::parse(entry, Topic::Speaker) {
                    total_audio += content.total_audio_bytes();
                }
            }
        }

        if state.is_open {
            let free_words = self.writer.headroom_words_hint();
            let free_bytes = free_words * self.word_size;
            if (total_audio as u64) > free_bytes {
                events.push(Event::BufferStateChanged {
                    topic: Topic::Speaker,
                    sequence_number: sequence,
                    state: BufferState::Overrun,
                });
                state.overrun_sequence = Some(sequence);
                state.buffer_state = BufferState::Overrun;
                return (events, Some(sequence));
            }
        }

        for entry in &entries {
            match entry.entry_type {
                framing::ENTRY_SPEAKER_CONTENT => {
                    let content = match SpeakerContent::parse(entry, Topic::Speaker) {
                        Ok(c) => c,
                        Err(e) => {
                            events.push(Event::ExceptionEncountered {
                                topic: Topic::Speaker,
                                sequence_number: sequence,
                                index: None,
                                message: e.to_string(),
                            });
                            continue;
                        }
                    };
                    if content.offset != self.writer.tell() {
                        events.push(Event::ExceptionEncountered {
                            topic: Topic::Speaker,
                            sequence_number: sequence,
                            index: None,
                            message: "speaker-content offset does not match writer position".to_string(),
                        });
                        continue;
                    }
                    match state.frame_size {
                        None => state.frame_size = Some(content.frame_size),
                        Some(fs) if fs != content.frame_size => {
                            events.push(Event::ExceptionEncountered {
                                topic: Topic::Speaker,
                                sequence_number: sequence,
                                index: None,
                                message: "speaker frame size changed mid-stream".to_string(),
                            });
                            continue;
                        }
                        _ => {}
                    }

                    let policy = if state.is_open {
                        WriterPolicy::AllOrNothing
                    } else {
                        WriterPolicy::Nonblockable
                    };
                    self.writer.set_policy(policy);
                    for frame in &content.frames {
                        let _ = self.writer.write(frame);
                    }

                    let is_open = state.is_open;
                    if let Some(event) = self.recompute_buffer_state_locked(&mut state, is_open) {
                        events.push(event);
                    }
                }
                framing::ENTRY_SPEAKER_MARKER => {
                    if let Ok(markers) = framing::parse_speaker_markers(entry, Topic::Speaker) {
                        let at_offset = self.writer.tell();
                        for marker in markers {
                            state.markers.push((at_offset, marker));
                        }
                    }
                }
                _ => {}
            }
        }

        (events, None)
    }

    pub fn open(&self, offset: u64) {
        let mut state = self.state.lock();
        state.pending_open = true;
        state.pending_open_offset = offset;
    }

    /// `CloseSpeaker{offset?}`: schedules a close action, or closes
    /// immediately at the reader's current position when no offset is
    /// given.
    pub fn schedule_close(&self, offset: Option<u64>) -> Vec<Event> {
        match offset {
            Some(o) => {
                self.state.lock().offset_actions.schedule(o, SpeakerOffsetAction::Close);
                Vec::new()
            }
            None => {
                let at = self.reader.tell(SeekReference::Absolute);
                self.close_now(at)
            }
        }
    }

    fn close_now(&self, at_offset: u64) -> Vec<Event> {
        let mut state = self.state.lock();
        state.is_open = false;
        self.writer.set_policy(WriterPolicy::Nonblockable);
        state.buffer_state = BufferState::None;
        vec![Event::SpeakerClosed { offset: at_offset }]
    }

    /// `SetVolume{volume, offset?}`.
    pub fn set_volume(&self, volume: u8, offset: Option<u64>) -> Vec<Event> {
        match offset {
            Some(o) => {
                self.state.lock().offset_actions.schedule(o, SpeakerOffsetAction::SetVolume(volume));
                Vec::new()
            }
            None => self.apply_volume_now(volume),
        }
    }

    fn apply_volume_now(&self, volume: u8) -> Vec<Event> {
        let mut state = self.state.lock();
        state.current_volume = volume;
        self.platform.set_volume(volume);
        if state.volume_is_initial {
            state.volume_is_initial = false;
            Vec::new()
        } else {
            vec![Event::VolumeChanged { volume, offset: None }]
        }
    }

    /// Barge-in: invalidate every pending offset-action, then close
    /// immediately.
    pub fn stop_playback(&self) -> Vec<Event> {
        let invalidated = self.state.lock().offset_actions.invalidate_all();
        // Invalidated actions fire with valid=false: no-ops for both kinds.
        let _ = invalidated;
        let at = self.reader.tell(SeekReference::Absolute);
        self.close_now(at)
    }

    /// Playback worker tick (§4.4). Drives offset-actions, pending-open
    /// consummation, frame reads and marker delivery.
    pub async fn playback_tick(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let reader_pos = self.reader.tell(SeekReference::Absolute);

        let due = self.state.lock().offset_actions.drain_due(reader_pos);
        for (_handle, action) in due {
            match action {
                SpeakerOffsetAction::SetVolume(vol) => {
                    events.extend(self.apply_volume_now(vol));
                }
                SpeakerOffsetAction::Close => {
                    events.extend(self.close_now(reader_pos));
                }
            }
        }

        let ready = self.state.lock().is_ready_for_data;
        if !ready {
            return events;
        }

        let pending_open = self.state.lock().pending_open;
        if pending_open {
            let offset = self.state.lock().pending_open_offset;
            if self.reader.seek(offset as i64, SeekReference::Absolute).is_err() {
                events.push(Event::ExceptionEncountered {
                    topic: Topic::Speaker,
                    sequence_number: 0,
                    index: None,
                    message: "pending-open offset outside buffer window".to_string(),
                });
                return events;
            }
            self.writer.set_policy(WriterPolicy::AllOrNothing);
            let mut state = self.state.lock();
            state.pending_open = false;
            drop(state);
        }

        let frame_size = match self.state.lock().frame_size {
            Some(fs) => fs,
            None => return events,
        };

        let frame = {
            let existing = self.state.lock().backup_frame.take();
            match existing {
                Some(f) => Some(f),
                None => {
                    let mut buf = vec![0u8; frame_size];
                    match self.reader.read(&mut buf, self.read_timeout).await {
                        Ok(_n) => Some(buf),
                        Err(ReadError::WouldBlock) => {
                            let mut state = self.state.lock();
                            if state.is_open && !matches!(state.buffer_state, BufferState::Underrun) {
                                state.buffer_state = BufferState::Underrun;
                                events.push(Event::BufferStateChanged {
                                    topic: Topic::Speaker,
                                    sequence_number: 0,
                                    state: BufferState::Underrun,
                                });
                            }
                            None
                        }
                        Err(_closed_invalid_or_overrun) => {
                            events.push(Event::ExceptionEncountered {
                                topic: Topic::Speaker,
                                sequence_number: 0,
                                index: None,
                                message: "fatal speaker buffer read error".to_string(),
                            });
                            None
                        }
                    }
                }
            }
        };

        let frame = match frame {
            Some(f) => f,
            None => return events,
        };

        {
            let mut state = self.state.lock();
            if let Some(event) = self.recompute_buffer_state_locked(&mut state, true) {
                events.push(event);
            }
        }

        if self.platform.push_frame(&frame) {
            let mut state = self.state.lock();
            if !state.is_open {
                state.is_open = true;
                let current = self.reader.tell(SeekReference::Absolute);
                events.push(Event::SpeakerOpened {
                    offset: current.saturating_sub(frame_size as u64),
                });
            }
            drop(state);

            let reader_now = self.reader.tell(SeekReference::Absolute);
            let mut state = self.state.lock();
            state.markers.retain(|(at_offset, marker)| {
                if *at_offset <= reader_now {
                    events.push(Event::SpeakerMarkerEncountered { marker: *marker });
                    false
                } else {
                    true
                }
            });
        } else {
            let mut state = self.state.lock();
            state.backup_frame = Some(frame);
            state.is_ready_for_data = false;
        }

        events
    }

    /// Forwards to the platform's offline-alert playback, bypassing the
    /// speaker-topic streaming path entirely. Used by the alert manager
    /// when the connection to the service is down.
    pub fn play_offline_alert(&self, alert_kind: u8) -> bool {
        self.platform.play_offline_alert(alert_kind)
    }

    pub fn stop_offline_alert(&self) -> bool {
        self.platform.stop_offline_alert()
    }

    /// The platform rejected a frame and is now ready again.
    pub fn on_speaker_ready(&self) {
        self.state.lock().is_ready_for_data = true;
    }

    pub fn volume(&self) -> u8 {
        self.state.lock().current_volume
    }

    pub fn pending_offset_action_count(&self) -> usize {
        self.state.lock().offset_actions.len()
    }

    /// `true` while actively streaming playback. Polled by the alert
    /// manager's offline-playback decision loop (§4.7).
    pub fn is_streaming(&self) -> bool {
        self.state.lock().is_open
    }

    /// Current fill-state telemetry, for the same offline-playback loop.
    pub fn buffer_state(&self) -> BufferState {
        self.state.lock().buffer_state
    }

    /// Reader's current absolute offset, used to drain UX manager
    /// offset-gated attention actions in lockstep with playback.
    pub fn reader_offset(&self) -> u64 {
        self.reader.tell(SeekReference::Absolute)
    }

    /// Test-only seam for exercising the alert manager's offline-playback
    /// loop without driving a full open/playback-tick sequence.
    #[cfg(test)]
    pub(crate) fn test_set_streaming(&self, is_open: bool, buffer_state: BufferState) {
        let mut state = self.state.lock();
        state.is_open = is_open;
        state.buffer_state = buffer_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::BinaryEntry;
    use crate::stream_buffer::{DataStreamBuffer, ReaderPolicy};

    struct FakePlatform {
        pushed: Mutex<Vec<Vec<u8>>>,
    }

    impl FakePlatform {
        fn new() -> Arc<Self> {
            Arc::new(FakePlatform { pushed: Mutex::new(Vec::new()) })
        }
    }

    impl SpeakerPlatform for FakePlatform {
        fn push_frame(&self, frame: &[u8]) -> bool {
            self.pushed.lock().push(frame.to_vec());
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

    fn speaker_content_body(offset: u64, frames: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&offset.to_le_bytes());
        for frame in frames {
            data.extend_from_slice(frame);
        }
        let mut body = Vec::new();
        BinaryEntry::encode_into(framing::ENTRY_SPEAKER_CONTENT, (frames.len() - 1) as u8, &data, &mut body);
        body
    }

    fn manager_with(
        data_size_words: u64,
        overrun_warning_words: u64,
        underrun_warning_words: u64,
        reader_policy: ReaderPolicy,
    ) -> (SpeakerManager, Arc<FakePlatform>) {
        let buffer = DataStreamBuffer::create(data_size_words, 1, 1);
        let writer = buffer.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buffer.create_reader(reader_policy, true).unwrap();
        let platform = FakePlatform::new();
        let manager = SpeakerManager::new(
            writer,
            reader,
            Arc::clone(&platform) as Arc<dyn SpeakerPlatform>,
            overrun_warning_words,
            underrun_warning_words,
            1,
            Duration::from_millis(20),
            50,
        );
        (manager, platform)
    }

    #[test]
    fn first_real_set_volume_after_construction_fires_an_event() {
        let (manager, _platform) = manager_with(16, 12, 4, ReaderPolicy::BlockingWithTimeout);
        assert_eq!(manager.volume(), 50, "boot volume must already be applied");

        let events = manager.set_volume(80, None);
        assert!(
            events.iter().any(|e| matches!(e, Event::VolumeChanged { volume: 80, .. })),
            "the boot volume must not swallow the first real SetVolume, got {events:?}"
        );
    }

    #[tokio::test]
    async fn open_completes_and_fires_speaker_opened_on_first_pushed_frame() {
        let (manager, platform) = manager_with(32, 24, 4, ReaderPolicy::BlockingWithTimeout);

        let body = speaker_content_body(0, &[&[1, 2, 3, 4]]);
        let (events, overrun) = manager.handle_message(0, &body);
        assert!(events.is_empty());
        assert!(overrun.is_none());

        manager.open(0);
        let events = manager.playback_tick().await;
        assert!(
            events.iter().any(|e| matches!(e, Event::SpeakerOpened { offset: 0 })),
            "expected SpeakerOpened at offset 0, got {events:?}"
        );
        assert_eq!(platform.pushed.lock().as_slice(), &[vec![1, 2, 3, 4]]);
    }

    #[tokio::test]
    async fn content_exceeding_free_space_while_open_triggers_overrun_and_ignores_until_resync() {
        let (manager, _platform) = manager_with(4, 3, 1, ReaderPolicy::BlockingWithTimeout);
        manager.state.lock().is_open = true;

        let body = speaker_content_body(0, &[&[1, 2, 3, 4], &[5, 6, 7, 8]]);
        let (events, overrun) = manager.handle_message(5, &body);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::BufferStateChanged { state: BufferState::Overrun, .. })),
            "expected an Overrun BufferStateChanged event, got {events:?}"
        );
        assert_eq!(overrun, Some(5));

        // A later, unrelated sequence is ignored while waiting for the resync.
        let (events, _) = manager.handle_message(6, &body);
        assert!(events.is_empty());

        // The expected resync sequence number is accepted normally.
        let small = speaker_content_body(0, &[&[9]]);
        manager.state.lock().is_open = false;
        let (events, overrun) = manager.handle_message(5, &small);
        assert!(overrun.is_none());
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn starved_buffer_while_open_fires_underrun_event() {
        let (manager, _platform) = manager_with(16, 12, 4, ReaderPolicy::Nonblocking);
        {
            let mut state = manager.state.lock();
            state.is_open = true;
            state.frame_size = Some(4);
        }

        let events = manager.playback_tick().await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::BufferStateChanged { state: BufferState::Underrun, .. })),
            "expected an Underrun BufferStateChanged event, got {events:?}"
        );
    }

    #[test]
    fn buffer_state_recovers_from_overrun_straight_to_none() {
        let (manager, _platform) = manager_with(16, 12, 4, ReaderPolicy::BlockingWithTimeout);
        manager.test_set_streaming(true, BufferState::Overrun);

        let body = speaker_content_body(0, &[&[1, 2, 3, 4, 5, 6]]);
        let (events, overrun) = manager.handle_message(0, &body);
        assert!(overrun.is_none());
        assert_eq!(
            manager.buffer_state(),
            BufferState::None,
            "fill back in the healthy band must clear a hard state even without passing through a warning"
        );
        assert!(
            !events.iter().any(|e| matches!(e, Event::BufferStateChanged { .. })),
            "recovering straight to None does not itself fire an event"
        );
    }

    #[test]
    fn buffer_state_recovers_from_underrun_straight_to_none() {
        let (manager, _platform) = manager_with(16, 12, 4, ReaderPolicy::BlockingWithTimeout);
        manager.test_set_streaming(true, BufferState::Underrun);

        let body = speaker_content_body(0, &[&[1, 2, 3, 4, 5, 6]]);
        let (events, overrun) = manager.handle_message(0, &body);
        assert!(overrun.is_none());
        assert_eq!(manager.buffer_state(), BufferState::None);
        assert!(!events.iter().any(|e| matches!(e, Event::BufferStateChanged { .. })));
    }

    #[test]
    fn stop_playback_invalidates_pending_offset_actions_and_closes() {
        let (manager, _platform) = manager_with(16, 12, 4, ReaderPolicy::BlockingWithTimeout);
        manager.state.lock().is_open = true;
        manager.set_volume(80, Some(10));
        assert_eq!(manager.pending_offset_action_count(), 1);

        let events = manager.stop_playback();
        assert!(events.iter().any(|e| matches!(e, Event::SpeakerClosed { .. })));
        assert_eq!(manager.pending_offset_action_count(), 0);
    }
}
