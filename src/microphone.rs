//! Microphone manager (§4.5): reads captured audio out of a data-stream
//! buffer on a fixed cadence and publishes it via the microphone
//! regulator. The periodic capture task is a fixed-interval loop that
//! reads, builds a payload, and `try_send`s into a channel with a drop
//! counter on backpressure.

use crate::events::{Event, Initiator, InitiatorKind};
use crate::framing::{self, BinaryEntry, MicrophoneContent};
use crate::regulator::RegulatorHandle;
use crate::stats::Stats;
use crate::stream_buffer::{DataStreamReader, ReadError, SeekReference};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PendingOpen {
    expires_at: Instant,
    initiator: Option<Initiator>,
}

struct MicrophoneManagerState {
    is_open: bool,
    pending_open: Option<PendingOpen>,
    last_initiator_kind: Option<InitiatorKind>,
    last_profile: Option<String>,
    last_offset_sent: u64,
}

impl MicrophoneManagerState {
    fn new() -> Self {
        MicrophoneManagerState {
            is_open: false,
            pending_open: None,
            last_initiator_kind: None,
            last_profile: None,
            last_offset_sent: 0,
        }
    }
}

pub struct MicrophoneManager {
    state: Mutex<MicrophoneManagerState>,
    reader: DataStreamReader,
    word_size: u64,
    preroll_samples: u64,
}

impl MicrophoneManager {
    pub fn new(reader: DataStreamReader, word_size: u64, preroll_samples: u64) -> Self {
        MicrophoneManager {
            state: Mutex::new(MicrophoneManagerState::new()),
            reader,
            word_size,
            preroll_samples,
        }
    }

    fn open_now_locked(
        &self,
        state: &mut MicrophoneManagerState,
        seek_offset: i64,
        seek_reference: SeekReference,
        initiator: Option<Initiator>,
    ) -> Vec<Event> {
        if self.reader.seek(seek_offset, seek_reference).is_err() {
            return Vec::new();
        }
        state.is_open = true;
        state.pending_open = None;
        state.last_offset_sent = self.reader.tell(SeekReference::Absolute);
        vec![Event::MicrophoneOpened {
            profile: state.last_profile.clone().unwrap_or_default(),
            offset: state.last_offset_sent,
            initiator,
        }]
    }

    /// `OpenMicrophone{timeoutInMilliseconds, initiator?}`. Only acted on
    /// while closed; routes through pending-open when the last local
    /// gesture was a hold.
    pub fn open_microphone(&self, timeout_ms: u64, initiator: Option<Initiator>) -> Vec<Event> {
        let mut state = self.state.lock();
        if state.is_open || state.pending_open.is_some() {
            return Vec::new();
        }
        if state.last_initiator_kind == Some(InitiatorKind::Hold) {
            state.pending_open = Some(PendingOpen {
                expires_at: Instant::now() + Duration::from_millis(timeout_ms),
                initiator,
            });
            Vec::new()
        } else {
            self.open_now_locked(&mut state, 0, SeekReference::BeforeWriter, initiator)
        }
    }

    /// `CloseMicrophone`.
    pub fn close_microphone(&self) -> Vec<Event> {
        let mut state = self.state.lock();
        state.is_open = false;
        state.pending_open = None;
        vec![Event::MicrophoneClosed { offset: state.last_offset_sent }]
    }

    /// A scheduled pending-open expired without a matching `hold_to_talk_start`.
    pub fn expire_pending_open(&self) -> Vec<Event> {
        let mut state = self.state.lock();
        match &state.pending_open {
            Some(p) if Instant::now() >= p.expires_at => {
                state.pending_open = None;
                vec![Event::OpenMicrophoneTimedOut]
            }
            _ => Vec::new(),
        }
    }

    pub fn tap_to_talk_start(&self, index: u64, profile: String) -> Vec<Event> {
        let mut state = self.state.lock();
        state.last_profile = Some(profile);
        state.last_initiator_kind = Some(InitiatorKind::Tap);
        let initiator = Initiator { kind: InitiatorKind::Tap, payload: None };
        self.open_now_locked(&mut state, index as i64, SeekReference::Absolute, Some(initiator))
    }

    pub fn hold_to_talk_start(&self, index: u64) -> Vec<Event> {
        let mut state = self.state.lock();
        state.last_initiator_kind = Some(InitiatorKind::Hold);
        if let Some(pending) = state.pending_open.take() {
            if Instant::now() < pending.expires_at {
                return self.open_now_locked(
                    &mut state,
                    index as i64,
                    SeekReference::Absolute,
                    pending.initiator,
                );
            }
        }
        let initiator = Initiator { kind: InitiatorKind::Hold, payload: None };
        self.open_now_locked(&mut state, index as i64, SeekReference::Absolute, Some(initiator))
    }

    /// `word_word_start(begin, end, profile, word)`: `word` must be
    /// `"alexa"` and `begin` must be at least `preroll_samples` in.
    pub fn wake_word_start(&self, begin: u64, end: u64, profile: String, word: &str) -> Vec<Event> {
        if word != "alexa" || begin < self.preroll_samples || end < begin {
            return Vec::new();
        }
        let mut state = self.state.lock();
        state.last_profile = Some(profile);
        state.last_initiator_kind = Some(InitiatorKind::Wakeword);

        let preroll_bytes = self.preroll_samples * self.word_size;
        let begin_offset = state.last_offset_sent + preroll_bytes;
        let end_offset = begin_offset + (end - begin) * self.word_size;
        let initiator = Initiator {
            kind: InitiatorKind::Wakeword,
            payload: Some(json!({
                "wakeWord": word,
                "wakeWordIndices": { "beginOffset": begin_offset, "endOffset": end_offset },
            })),
        };
        self.open_now_locked(
            &mut state,
            (begin - self.preroll_samples) as i64,
            SeekReference::Absolute,
            Some(initiator),
        )
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    /// One capture tick: reads up to `chunk_size_samples` samples and
    /// returns the wire-ready `microphone-content` entry, or `None` when
    /// closed or nothing was captured.
    pub async fn capture_tick(&self, chunk_size_samples: usize, read_timeout: Duration) -> Option<Vec<u8>> {
        let offset = {
            let state = self.state.lock();
            if !state.is_open {
                return None;
            }
            state.last_offset_sent
        };

        let mut buf = vec![0u8; chunk_size_samples * self.word_size as usize];
        let n = match self.reader.read(&mut buf, read_timeout).await {
            Ok(n) => n,
            Err(ReadError::WouldBlock) => return None,
            Err(_) => {
                self.state.lock().is_open = false;
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        let read_bytes = n * self.word_size as usize;
        buf.truncate(read_bytes);

        self.state.lock().last_offset_sent = offset + read_bytes as u64;

        let data = MicrophoneContent::build(offset, &buf);
        let mut entry = Vec::new();
        BinaryEntry::encode_into(framing::ENTRY_MICROPHONE_CONTENT, 0, &data, &mut entry);
        Some(entry)
    }
}

/// Spawn the periodic capture task: on each tick, read one chunk and
/// `try_send` it into the microphone regulator.
pub fn spawn_capture_task(
    manager: Arc<MicrophoneManager>,
    regulator: RegulatorHandle,
    chunk_size_samples: usize,
    tick: Duration,
    read_timeout: Duration,
    stats: Arc<Stats>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;
            match manager.capture_tick(chunk_size_samples, read_timeout).await {
                Some(entry) => {
                    stats.record_microphone_chunk_sent();
                    regulator.write(entry);
                }
                None => continue,
            }
        }
    })
}
