//! Lock-free runtime counters and the periodic reporter task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Stats {
    pub mqtt_messages_published: AtomicU64,
    pub mqtt_publish_errors: AtomicU64,
    pub mqtt_messages_received: AtomicU64,
    pub channel_drops: AtomicU64,
    pub sequencer_old: AtomicU64,
    pub sequencer_dropped: AtomicU64,
    pub sequencer_timeouts: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub speaker_overruns: AtomicU64,
    pub speaker_underruns: AtomicU64,
    pub microphone_chunks_sent: AtomicU64,
    pub alerts_fired: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mqtt_messages_published: AtomicU64::new(0),
            mqtt_publish_errors: AtomicU64::new(0),
            mqtt_messages_received: AtomicU64::new(0),
            channel_drops: AtomicU64::new(0),
            sequencer_old: AtomicU64::new(0),
            sequencer_dropped: AtomicU64::new(0),
            sequencer_timeouts: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            malformed_messages: AtomicU64::new(0),
            speaker_overruns: AtomicU64::new(0),
            speaker_underruns: AtomicU64::new(0),
            microphone_chunks_sent: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
        })
    }

    #[inline(always)]
    pub fn record_mqtt_publish(&self) {
        self.mqtt_messages_published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_mqtt_publish_error(&self) {
        self.mqtt_publish_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_mqtt_received(&self) {
        self.mqtt_messages_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_channel_drop(&self) {
        self.channel_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_sequencer_old(&self) {
        self.sequencer_old.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_sequencer_dropped(&self) {
        self.sequencer_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_sequencer_timeout(&self) {
        self.sequencer_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_malformed(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_speaker_overrun(&self) {
        self.speaker_overruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_speaker_underrun(&self) {
        self.speaker_underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_microphone_chunk_sent(&self) {
        self.microphone_chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alert_fired(&self) {
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);
        StatsSnapshot {
            mqtt_publish_rate: (self.mqtt_messages_published.swap(0, Ordering::Relaxed) as f64) / secs,
            mqtt_publish_errors: self.mqtt_publish_errors.swap(0, Ordering::Relaxed),
            mqtt_receive_rate: (self.mqtt_messages_received.swap(0, Ordering::Relaxed) as f64) / secs,
            channel_drops: self.channel_drops.swap(0, Ordering::Relaxed),
            sequencer_old: self.sequencer_old.swap(0, Ordering::Relaxed),
            sequencer_dropped: self.sequencer_dropped.swap(0, Ordering::Relaxed),
            sequencer_timeouts: self.sequencer_timeouts.swap(0, Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.swap(0, Ordering::Relaxed),
            malformed_messages: self.malformed_messages.swap(0, Ordering::Relaxed),
            speaker_overruns: self.speaker_overruns.swap(0, Ordering::Relaxed),
            speaker_underruns: self.speaker_underruns.swap(0, Ordering::Relaxed),
            microphone_chunks_sent: self.microphone_chunks_sent.swap(0, Ordering::Relaxed),
            alerts_fired: self.alerts_fired.swap(0, Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub mqtt_publish_rate: f64,
    pub mqtt_publish_errors: u64,
    pub mqtt_receive_rate: f64,
    pub channel_drops: u64,
    pub sequencer_old: u64,
    pub sequencer_dropped: u64,
    pub sequencer_timeouts: u64,
    pub decrypt_failures: u64,
    pub malformed_messages: u64,
    pub speaker_overruns: u64,
    pub speaker_underruns: u64,
    pub microphone_chunks_sent: u64,
    pub alerts_fired: u64,
}

/// Background stats reporter task; disabled (parks forever) when
/// `interval_secs == 0`.
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        tracing::info!(
            mqtt_pub_rate = snap.mqtt_publish_rate,
            mqtt_recv_rate = snap.mqtt_receive_rate,
            drops = snap.channel_drops,
            seq_old = snap.sequencer_old,
            seq_dropped = snap.sequencer_dropped,
            decrypt_failures = snap.decrypt_failures,
            overruns = snap.speaker_overruns,
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record_mqtt_publish();
        stats.record_channel_drop();
        let snap = stats.snapshot_and_reset(Duration::from_secs(1));
        assert_eq!(snap.channel_drops, 1);
        assert_eq!(snap.mqtt_publish_rate, 1.0);
        let snap2 = stats.snapshot_and_reset(Duration::from_secs(1));
        assert_eq!(snap2.channel_drops, 0);
    }
}
