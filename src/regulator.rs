//! Per-topic outbound queue with a flush cadence (§4.2), a channel-plus-task
//! split. Producers enqueue
//! raw chunks with no knowledge of each other; the regulator is what
//! decides, at flush time, how those chunks compose into one outbound
//! message — it computes each chunk's `remaining_bytes`/`remaining_chunks`
//! from the batch it just drained and hands them to the `Emitter` in
//! order, so the whole tick's worth of queued chunks lands in one publish.

use crate::emitter::Emitter;
use crate::stats::Stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Thread-safe producer handle. Any producer (speaker manager, microphone
/// manager, UX manager, alert manager, capabilities sender, …) clones this
/// and pushes raw chunk bytes into it.
#[derive(Clone)]
pub struct RegulatorHandle {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<Stats>,
}

impl RegulatorHandle {
    /// Non-blocking push via `try_send`, with a drop counter on
    /// backpressure.
    pub fn write(&self, chunk: Vec<u8>) {
        if self.tx.try_send(chunk).is_err() {
            self.stats.record_channel_drop();
        }
    }
}

/// Spawn a regulator task: on each tick, drains every chunk queued since
/// the previous tick and forwards the whole batch to `emitter.emit` as one
/// message, subject to `max_message_bytes` (enforced inside the emitter).
pub fn spawn_regulator(
    tick: Duration,
    mut emitter: Emitter,
    channel_capacity: usize,
    stats: Arc<Stats>,
) -> (RegulatorHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(channel_capacity);
    let handle = RegulatorHandle {
        tx,
        stats: Arc::clone(&stats),
    };

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        loop {
            interval.tick().await;

            let mut batch = Vec::new();
            loop {
                match rx.try_recv() {
                    Ok(chunk) => batch.push(chunk),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        tracing::warn!("regulator channel closed, shutting down");
                        return;
                    }
                }
            }
            if batch.is_empty() {
                continue;
            }

            let total_bytes: usize = batch.iter().map(|c| c.len()).sum();
            let mut remaining_bytes = total_bytes;
            let n = batch.len();
            for (i, chunk) in batch.into_iter().enumerate() {
                remaining_bytes -= chunk.len();
                let remaining_chunks = n - i - 1;
                if let Err(e) = emitter.emit(chunk, remaining_bytes, remaining_chunks).await {
                    tracing::warn!(error = %e, "regulator flush error");
                    break;
                }
            }
        }
    });

    (handle, task)
}
