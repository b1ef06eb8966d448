use clap::Parser;

/// Client-side stream protocol engine for a voice-assistant broker transport.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// MQTT broker host.
    #[arg(long, env = "AIA_MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, env = "AIA_MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client id.
    #[arg(long, env = "AIA_MQTT_CLIENT_ID", default_value = "aia-client")]
    pub mqtt_client_id: String,

    /// MQTT keep-alive interval, seconds.
    #[arg(long, default_value_t = 30)]
    pub mqtt_keep_alive_secs: u16,

    /// Topic prefix every wire topic name is appended to, e.g. `device/<id>/`.
    #[arg(long, env = "AIA_DEVICE_TOPIC_ROOT", default_value = "device/default/")]
    pub device_topic_root: String,

    /// REST introspection API bind host.
    #[arg(long, default_value = "0.0.0.0")]
    pub api_host: String,

    /// REST introspection API port (0 disables the server).
    #[arg(long, default_value_t = 8088)]
    pub api_port: u16,

    /// Stats reporter log cadence, seconds (0 disables periodic logging).
    #[arg(long, default_value_t = 60)]
    pub stats_interval_secs: u64,

    /// Number of reorder slots per inbound topic sequencer.
    #[arg(long, default_value_t = 32)]
    pub sequencer_max_slots: usize,

    /// Missing-message timeout, milliseconds (0 disables the timer).
    #[arg(long, default_value_t = 2_000)]
    pub sequencer_timeout_ms: u64,

    /// Regulator flush cadence, milliseconds.
    #[arg(long, default_value_t = 20)]
    pub regulator_tick_ms: u64,

    /// Maximum assembled message size per topic, bytes.
    #[arg(long, default_value_t = 128 * 1024)]
    pub max_message_bytes: usize,

    /// Data-stream buffer size for the speaker path, in words.
    #[arg(long, default_value_t = 1 << 16)]
    pub speaker_buffer_words: u64,

    /// Data-stream buffer size for the microphone path, in words.
    #[arg(long, default_value_t = 1 << 14)]
    pub microphone_buffer_words: u64,

    /// Word size in bytes (both streams use the same PCM sample width).
    #[arg(long, default_value_t = 2)]
    pub word_size_bytes: usize,

    /// Speaker overrun-warning fill threshold, in words.
    #[arg(long, default_value_t = 1 << 15)]
    pub speaker_overrun_warning_words: u64,

    /// Speaker underrun-warning fill threshold, in words.
    #[arg(long, default_value_t = 1 << 12)]
    pub speaker_underrun_warning_words: u64,

    /// Playback worker cadence, milliseconds.
    #[arg(long, default_value_t = 20)]
    pub playback_tick_ms: u64,

    /// Microphone capture/publish cadence, milliseconds.
    #[arg(long, default_value_t = 50)]
    pub microphone_tick_ms: u64,

    /// Microphone chunk size, samples.
    #[arg(long, default_value_t = 800)]
    pub microphone_chunk_samples: usize,

    /// Microphone wake-word preroll, samples.
    #[arg(long, default_value_t = 1600)]
    pub microphone_preroll_samples: u64,

    /// Alert offline-check cadence once armed, milliseconds.
    #[arg(long, default_value_t = 1_000)]
    pub alert_poll_ms: u64,

    /// Alerts older than this many seconds past due are pruned.
    #[arg(long, default_value_t = 3_600)]
    pub alert_expiration_secs: u64,

    /// Directory for the file-backed alert/volume store.
    #[arg(long, default_value = "./aia_state")]
    pub state_dir: String,

    /// 64-character hex master key every topic's AEAD key is derived from.
    /// Real provisioning (a per-device secret from an HSM or fleet
    /// enrollment service) is external to this crate.
    #[arg(long, env = "AIA_MASTER_KEY_HEX")]
    pub master_key_hex: String,
}

impl Config {
    pub fn mqtt_addr(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }
}
