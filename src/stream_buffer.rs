//! Single-writer/multi-reader ring buffer decoupling network ingestion
//! from the playback/capture clock (§4.3). Absolute indices are 64-bit and
//! monotonic; physical position is `abs_index % data_size`, the
//! `playout_time % buffer_len` idiom from `aes67-rs`'s `buffer.rs`.
//!
//! The reader/writer absolute indices and enable flags are lock-free
//! (`AtomicU64`/`AtomicBool`, per §5's "only lock-free-style shared
//! resource" requirement); the backing byte storage itself is guarded by a
//! short-held `parking_lot::Mutex` rather than `aes67-rs`'s raw-pointer
//! `unsafe` buffer, since synchronizing that without a mutex is only sound
//! given invariants this crate cannot re-verify without running it.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const MAX_READERS: usize = 8;
const NO_SCHEDULED_CLOSE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPolicy {
    /// Always writes all requested words; may overwrite unread data.
    Nonblockable,
    /// Writes nothing if any enabled reader would be overrun; else writes all.
    AllOrNothing,
    /// Writes as many words as fit without overrunning any enabled reader.
    Nonblocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderPolicy {
    BlockingWithTimeout,
    Nonblocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekReference {
    Absolute,
    AfterReader,
    BeforeReader,
    BeforeWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("buffer closed")]
    Closed,
    #[error("invalid argument")]
    Invalid,
    #[error("would block")]
    WouldBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("buffer closed")]
    Closed,
    #[error("invalid argument")]
    Invalid,
    #[error("would block")]
    WouldBlock,
    #[error("reader overrun")]
    Overrun,
}

fn policy_to_u8(p: WriterPolicy) -> u8 {
    match p {
        WriterPolicy::Nonblockable => 0,
        WriterPolicy::AllOrNothing => 1,
        WriterPolicy::Nonblocking => 2,
    }
}

fn policy_from_u8(v: u8) -> WriterPolicy {
    match v {
        0 => WriterPolicy::Nonblockable,
        1 => WriterPolicy::AllOrNothing,
        _ => WriterPolicy::Nonblocking,
    }
}

struct ReaderSlot {
    enabled: AtomicBool,
    index: AtomicU64,
    close_at: AtomicU64,
    closed: AtomicBool,
}

impl ReaderSlot {
    fn vacant() -> Self {
        ReaderSlot {
            enabled: AtomicBool::new(false),
            index: AtomicU64::new(0),
            close_at: AtomicU64::new(NO_SCHEDULED_CLOSE),
            closed: AtomicBool::new(false),
        }
    }
}

struct Inner {
    data: Mutex<Vec<u8>>,
    data_size_words: u64,
    word_size: usize,
    writer_index: AtomicU64,
    writer_policy: AtomicU8,
    writer_claimed: AtomicBool,
    closed: AtomicBool,
    readers: Vec<ReaderSlot>,
    notify: Notify,
}

impl Inner {
    fn oldest_valid_index(&self) -> u64 {
        self.writer_index
            .load(Ordering::Relaxed)
            .saturating_sub(self.data_size_words)
    }

    fn physical_write(&self, start_word: u64, words: &[u8]) {
        let mut data = self.data.lock();
        let ring_bytes = data.len();
        let start_byte = ((start_word % self.data_size_words) as usize) * self.word_size;
        let n = words.len();
        let first = n.min(ring_bytes - start_byte);
        data[start_byte..start_byte + first].copy_from_slice(&words[..first]);
        if first < n {
            data[0..n - first].copy_from_slice(&words[first..]);
        }
    }

    fn physical_read(&self, start_word: u64, out: &mut [u8]) {
        let data = self.data.lock();
        let ring_bytes = data.len();
        let start_byte = ((start_word % self.data_size_words) as usize) * self.word_size;
        let n = out.len();
        let first = n.min(ring_bytes - start_byte);
        out[..first].copy_from_slice(&data[start_byte..start_byte + first]);
        if first < n {
            out[first..].copy_from_slice(&data[0..n - first]);
        }
    }
}

/// Shared handle; `create_writer`/`create_reader` carve out the single
/// writer and up to `max_readers` readers.
#[derive(Clone)]
pub struct DataStreamBuffer {
    inner: Arc<Inner>,
}

impl DataStreamBuffer {
    pub fn create(data_size_words: u64, word_size: usize, max_readers: usize) -> Self {
        let max_readers = max_readers.min(MAX_READERS);
        let mut readers = Vec::with_capacity(max_readers);
        readers.resize_with(max_readers, ReaderSlot::vacant);
        let inner = Inner {
            data: Mutex::new(vec![0u8; (data_size_words as usize) * word_size]),
            data_size_words,
            word_size,
            writer_index: AtomicU64::new(0),
            writer_policy: AtomicU8::new(policy_to_u8(WriterPolicy::Nonblockable)),
            writer_claimed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readers,
            notify: Notify::new(),
        };
        DataStreamBuffer { inner: Arc::new(inner) }
    }

    pub fn create_writer(&self, policy: WriterPolicy, force: bool) -> Result<DataStreamWriter, WriteError> {
        if self.inner.writer_claimed.swap(true, Ordering::AcqRel) && !force {
            return Err(WriteError::Invalid);
        }
        self.inner.writer_policy.store(policy_to_u8(policy), Ordering::Relaxed);
        Ok(DataStreamWriter {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn create_reader(&self, policy: ReaderPolicy, start_at_oldest: bool) -> Result<DataStreamReader, ReadError> {
        let id = self
            .inner
            .readers
            .iter()
            .position(|r| !r.enabled.load(Ordering::Relaxed))
            .ok_or(ReadError::Invalid)?;
        self.create_reader_with_id(id, policy, start_at_oldest, false)
    }

    pub fn create_reader_with_id(
        &self,
        id: usize,
        policy: ReaderPolicy,
        start_at_oldest: bool,
        force: bool,
    ) -> Result<DataStreamReader, ReadError> {
        let slot = self.inner.readers.get(id).ok_or(ReadError::Invalid)?;
        if slot.enabled.load(Ordering::Relaxed) && !force {
            return Err(ReadError::Invalid);
        }
        let start = if start_at_oldest {
            self.inner.oldest_valid_index()
        } else {
            self.inner.writer_index.load(Ordering::Relaxed)
        };
        slot.index.store(start, Ordering::Relaxed);
        slot.close_at.store(NO_SCHEDULED_CLOSE, Ordering::Relaxed);
        slot.closed.store(false, Ordering::Relaxed);
        slot.enabled.store(true, Ordering::Release);
        Ok(DataStreamReader {
            inner: Arc::clone(&self.inner),
            id,
            policy,
        })
    }
}

pub struct DataStreamWriter {
    inner: Arc<Inner>,
}

impl DataStreamWriter {
    pub fn tell(&self) -> u64 {
        self.inner.writer_index.load(Ordering::Relaxed)
    }

    pub fn set_policy(&self, policy: WriterPolicy) {
        self.inner.writer_policy.store(policy_to_u8(policy), Ordering::Relaxed);
    }

    /// Words writable right now before overrunning the slowest enabled
    /// reader. Exposed for callers (the speaker manager's overrun check,
    /// §4.4) that need to know free space before attempting a write.
    pub fn headroom_words_hint(&self) -> u64 {
        self.headroom_words(self.inner.writer_index.load(Ordering::Relaxed))
    }

    fn policy(&self) -> WriterPolicy {
        policy_from_u8(self.inner.writer_policy.load(Ordering::Relaxed))
    }

    /// Number of words writable before overrunning the slowest enabled
    /// reader, given the writer's current position.
    fn headroom_words(&self, writer_index: u64) -> u64 {
        let mut min_headroom = u64::MAX;
        for slot in &self.inner.readers {
            if !slot.enabled.load(Ordering::Relaxed) {
                continue;
            }
            let reader_index = slot.index.load(Ordering::Relaxed);
            let consumed_lag = writer_index.saturating_sub(reader_index);
            let headroom = self.inner.data_size_words.saturating_sub(consumed_lag);
            min_headroom = min_headroom.min(headroom);
        }
        if min_headroom == u64::MAX {
            self.inner.data_size_words
        } else {
            min_headroom
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, WriteError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(WriteError::Closed);
        }
        if self.inner.word_size == 0 || buf.len() % self.inner.word_size != 0 {
            return Err(WriteError::Invalid);
        }
        let n_words = (buf.len() / self.inner.word_size) as u64;
        if n_words == 0 {
            return Ok(0);
        }
        let writer_index = self.inner.writer_index.load(Ordering::Relaxed);

        let words_to_write = match self.policy() {
            WriterPolicy::Nonblockable => n_words,
            WriterPolicy::AllOrNothing => {
                if self.headroom_words(writer_index) < n_words {
                    return Err(WriteError::WouldBlock);
                }
                n_words
            }
            WriterPolicy::Nonblocking => {
                let headroom = self.headroom_words(writer_index);
                if headroom == 0 {
                    return Ok(0);
                }
                n_words.min(headroom)
            }
        };

        let bytes_to_write = (words_to_write as usize) * self.inner.word_size;
        self.inner.physical_write(writer_index, &buf[..bytes_to_write]);
        self.inner
            .writer_index
            .store(writer_index + words_to_write, Ordering::Release);
        self.inner.notify.notify_waiters();
        Ok(words_to_write as usize)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }
}

pub struct DataStreamReader {
    inner: Arc<Inner>,
    id: usize,
    policy: ReaderPolicy,
}

impl DataStreamReader {
    pub fn get_id(&self) -> usize {
        self.id
    }

    pub fn get_word_size(&self) -> usize {
        self.inner.word_size
    }

    fn slot(&self) -> &ReaderSlot {
        &self.inner.readers[self.id]
    }

    pub fn tell(&self, reference: SeekReference) -> u64 {
        let idx = self.slot().index.load(Ordering::Relaxed);
        match reference {
            SeekReference::BeforeWriter => self
                .inner
                .writer_index
                .load(Ordering::Relaxed)
                .saturating_sub(idx),
            _ => idx,
        }
    }

    fn resolve_target(&self, offset: i64, reference: SeekReference) -> Option<u64> {
        let reader_index = self.slot().index.load(Ordering::Relaxed) as i64;
        let writer_index = self.inner.writer_index.load(Ordering::Relaxed) as i64;
        let target = match reference {
            SeekReference::Absolute => offset,
            SeekReference::AfterReader => reader_index.checked_add(offset)?,
            SeekReference::BeforeReader => reader_index.checked_sub(offset)?,
            SeekReference::BeforeWriter => writer_index.checked_sub(1)?.checked_sub(offset)?,
        };
        if target < 0 {
            None
        } else {
            Some(target as u64)
        }
    }

    pub fn seek(&self, offset: i64, reference: SeekReference) -> Result<(), ReadError> {
        let target = self.resolve_target(offset, reference).ok_or(ReadError::Invalid)?;
        let writer_index = self.inner.writer_index.load(Ordering::Relaxed);
        if target > writer_index {
            return Err(ReadError::Invalid);
        }
        if target < self.inner.oldest_valid_index() {
            return Err(ReadError::Overrun);
        }
        self.slot().index.store(target, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&self, offset: i64, reference: SeekReference) -> Result<(), ReadError> {
        if offset == 0 && reference == SeekReference::AfterReader {
            self.slot().closed.store(true, Ordering::Relaxed);
            self.slot().enabled.store(false, Ordering::Relaxed);
            return Ok(());
        }
        let target = self.resolve_target(offset, reference).ok_or(ReadError::Invalid)?;
        self.slot().close_at.store(target, Ordering::Relaxed);
        Ok(())
    }

    fn check_scheduled_close(&self) -> bool {
        let close_at = self.slot().close_at.load(Ordering::Relaxed);
        if close_at == NO_SCHEDULED_CLOSE {
            return false;
        }
        if self.slot().index.load(Ordering::Relaxed) >= close_at {
            self.slot().closed.store(true, Ordering::Relaxed);
            self.slot().enabled.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn try_read_available(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if self.slot().closed.load(Ordering::Relaxed) {
            return Err(ReadError::Closed);
        }
        if self.inner.word_size == 0 || buf.len() % self.inner.word_size != 0 {
            return Err(ReadError::Invalid);
        }
        let n_words = (buf.len() / self.inner.word_size) as u64;

        let reader_index = self.slot().index.load(Ordering::Relaxed);
        if reader_index < self.inner.oldest_valid_index() {
            return Err(ReadError::Overrun);
        }
        let writer_index = self.inner.writer_index.load(Ordering::Acquire);
        let avail = writer_index.saturating_sub(reader_index);
        if avail == 0 {
            if self.inner.closed.load(Ordering::Relaxed) {
                return Err(ReadError::Closed);
            }
            return Err(ReadError::WouldBlock);
        }
        let n_to_read = n_words.min(avail);
        let bytes = (n_to_read as usize) * self.inner.word_size;
        self.inner.physical_read(reader_index, &mut buf[..bytes]);
        self.slot().index.store(reader_index + n_to_read, Ordering::Relaxed);
        self.check_scheduled_close();
        Ok(n_to_read as usize)
    }

    /// Read up to `buf.len()/word_size` words. For `BlockingWithTimeout`
    /// readers, waits up to `timeout` for data to arrive; `Nonblocking`
    /// readers ignore `timeout` and return immediately.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, ReadError> {
        match self.policy {
            ReaderPolicy::Nonblocking => self.try_read_available(buf),
            ReaderPolicy::BlockingWithTimeout => {
                match self.try_read_available(buf) {
                    Err(ReadError::WouldBlock) => {}
                    other => return other,
                }
                let notified = self.inner.notify.notified();
                let waited = tokio::time::timeout(timeout, notified).await;
                if waited.is_err() {
                    return Err(ReadError::WouldBlock);
                }
                self.try_read_available(buf)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_buffer(words: u64) -> DataStreamBuffer {
        DataStreamBuffer::create(words, 1, 2)
    }

    #[test]
    fn nonblockable_write_then_read_round_trips() {
        let buf = small_buffer(8);
        let writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        assert_eq!(writer.write(&[1, 2, 3]).unwrap(), 3);

        let mut out = [0u8; 3];
        let rt = tokio::runtime::Runtime::new().unwrap();
        let n = rt
            .block_on(reader.read(&mut out, Duration::from_millis(0)))
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn reader_sees_would_block_when_caught_up() {
        let buf = small_buffer(8);
        let _writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        let mut out = [0u8; 1];
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(reader.read(&mut out, Duration::from_millis(0)));
        assert_eq!(result, Err(ReadError::WouldBlock));
    }

    #[test]
    fn overrun_reader_does_not_advance() {
        let buf = small_buffer(4);
        let writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        // Fill past the buffer size so the reader's starting position (0)
        // is now behind the oldest valid index.
        writer.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        let mut out = [0u8; 1];
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(reader.read(&mut out, Duration::from_millis(0)));
        assert_eq!(result, Err(ReadError::Overrun));
        assert_eq!(reader.tell(SeekReference::Absolute), 0, "overrun must not advance the reader");
    }

    #[test]
    fn all_or_nothing_rejects_when_reader_would_overrun() {
        let buf = small_buffer(4);
        let writer = buf.create_writer(WriterPolicy::AllOrNothing, false).unwrap();
        let _reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        let result = writer.write(&[1, 2, 3, 4, 5]);
        assert_eq!(result, Err(WriteError::WouldBlock));
        assert_eq!(writer.tell(), 0, "rejected write must not advance");
    }

    #[test]
    fn nonblocking_write_truncates_to_available_headroom() {
        let buf = small_buffer(4);
        let writer = buf.create_writer(WriterPolicy::Nonblocking, false).unwrap();
        let _reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        let n = writer.write(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(n, 4, "headroom is exactly the buffer size with a reader at 0");
    }

    #[test]
    fn seek_before_oldest_valid_index_is_overrun() {
        let buf = small_buffer(4);
        let writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        writer.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let result = reader.seek(0, SeekReference::Absolute);
        assert_eq!(result, Err(ReadError::Overrun));
    }

    #[test]
    fn seek_ahead_of_writer_is_invalid() {
        let buf = small_buffer(4);
        let _writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        let result = reader.seek(10, SeekReference::Absolute);
        assert_eq!(result, Err(ReadError::Invalid));
    }

    #[tokio::test]
    async fn seek_zero_before_writer_lands_on_the_newest_word() {
        let buf = small_buffer(4);
        let writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::Nonblocking, true).unwrap();
        writer.write(&[1, 2, 3]).unwrap();

        reader.seek(0, SeekReference::BeforeWriter).unwrap();
        assert_eq!(reader.tell(SeekReference::Absolute), 2, "must land on the newest written word, not the writer's own unwritten cursor");

        let mut out = [0u8; 1];
        let n = reader.read(&mut out, Duration::from_millis(0)).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, [3]);
    }

    #[tokio::test]
    async fn blocking_with_timeout_reader_wakes_on_write() {
        let buf = small_buffer(8);
        let writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::BlockingWithTimeout, true).unwrap();

        let read_task = tokio::spawn({
            let reader_inner = Arc::clone(&reader.inner);
            let id = reader.id;
            let policy = reader.policy;
            async move {
                let reader = DataStreamReader {
                    inner: reader_inner,
                    id,
                    policy,
                };
                let mut out = [0u8; 2];
                reader.read(&mut out, Duration::from_millis(500)).await.map(|n| (n, out))
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write(&[9, 9]).unwrap();

        let (n, out) = read_task.await.unwrap().unwrap();
        assert_eq!(n, 2);
        assert_eq!(out, [9, 9]);
    }

    #[tokio::test]
    async fn blocking_with_timeout_reader_times_out() {
        let buf = small_buffer(8);
        let _writer = buf.create_writer(WriterPolicy::Nonblockable, false).unwrap();
        let reader = buf.create_reader(ReaderPolicy::BlockingWithTimeout, true).unwrap();
        let mut out = [0u8; 1];
        let result = reader.read(&mut out, Duration::from_millis(20)).await;
        assert_eq!(result, Err(ReadError::WouldBlock));
    }
}
