mod alert;
mod api;
mod capabilities;
mod clock;
mod config;
mod directive;
mod dispatcher;
mod emitter;
mod error;
mod events;
mod framing;
mod microphone;
mod offset_action;
mod regulator;
mod secret;
mod sequencer;
mod speaker;
mod stats;
mod stream_buffer;
mod topic;
mod ux;

use alert::{AlertManager, ConnectionSupervisor, FileAlertStore, FileVolumeStore};
use capabilities::{CapabilitiesManager, LoggingCapabilitiesObserver};
use clap::Parser;
use clock::{ClockManager, SystemClock};
use config::Config;
use dispatcher::InboundTopicPump;
use emitter::Emitter;
use events::Event;
use framing::{encode_json_message_chunk, parse_json_array_body, JsonMessage};
use microphone::MicrophoneManager;
use regulator::{spawn_regulator, RegulatorHandle};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Packet, QoS};
use secret::{derive_topic_keys, parse_master_key_hex, ChaChaSecretManager, SecretManager};
use sequencer::SequenceHandler;
use speaker::{LoggingSpeakerPlatform, SpeakerManager};
use stats::Stats;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_buffer::{DataStreamBuffer, ReaderPolicy, WriterPolicy};
use topic::Topic;
use tokio::sync::mpsc;
use tracing::info;
use ux::{LoggingUxObserver, UxManager};

/// Bundles the managers a directive can act on, so the directive-topic
/// handler doesn't have to carry five separate `Arc`s around.
struct Managers {
    speaker: Arc<SpeakerManager>,
    microphone: Arc<MicrophoneManager>,
    ux: Arc<UxManager>,
    alert: Arc<AlertManager>,
}

fn apply_directive(m: &Managers, directive: directive::Directive) -> Vec<Event> {
    use directive::Directive;
    match directive {
        Directive::OpenSpeaker { offset } => {
            m.speaker.open(offset);
            Vec::new()
        }
        Directive::CloseSpeaker { offset } => m.speaker.schedule_close(offset),
        Directive::SetVolume { volume, offset } => m.speaker.set_volume(volume, offset),
        Directive::OpenMicrophone { timeout_ms, initiator } => {
            let events = m.microphone.open_microphone(timeout_ms, initiator);
            m.ux.set_microphone_open(m.microphone.is_open());
            events
        }
        Directive::CloseMicrophone => {
            let events = m.microphone.close_microphone();
            m.ux.set_microphone_open(false);
            events
        }
        Directive::SetAttentionState { state, offset } => {
            m.ux.set_attention_state(state, offset);
            Vec::new()
        }
        Directive::SetAlert {
            token,
            scheduled_time_s,
            duration_ms,
            kind,
        } => m.alert.set_alert(token, scheduled_time_s, duration_ms, kind),
        Directive::DeleteAlert { token } => m.alert.delete_alert(token),
        Directive::SetAlertVolume { volume } => m.alert.set_alert_volume(volume),
    }
}

/// Decodes one directive-topic message body into `Directive`s, applies
/// each to the managers, and buffers the resulting events for the owning
/// task to flush. Sequencer redrive is never needed on this topic, so
/// `on_message` has no pending-reset state to carry.
struct DirectiveHandler {
    managers: Arc<Managers>,
    pending_events: Vec<Event>,
}

impl SequenceHandler for DirectiveHandler {
    type Message = Vec<u8>;

    fn on_message(&mut self, sequence: u32, msg: Vec<u8>) {
        let messages = match parse_json_array_body(&msg, Topic::Directive) {
            Ok(m) => m,
            Err(e) => {
                self.pending_events.push(Event::ExceptionEncountered {
                    topic: Topic::Directive,
                    sequence_number: sequence,
                    index: None,
                    message: e.to_string(),
                });
                return;
            }
        };
        for (i, jm) in messages.into_iter().enumerate() {
            match directive::parse(&jm) {
                Ok(d) => self.pending_events.extend(apply_directive(&self.managers, d)),
                Err(e) => self.pending_events.push(Event::ExceptionEncountered {
                    topic: Topic::Directive,
                    sequence_number: sequence,
                    index: Some(i),
                    message: e.to_string(),
                }),
            }
        }
    }
}

/// Feeds speaker-topic binary entries to `SpeakerManager::handle_message`.
/// A handler can't call back into the `InboundTopicPump` that owns it, so
/// an overrun's redrive target is buffered here for the owning task to
/// apply via `InboundTopicPump::reset_sequence_number` after `handle_raw`
/// returns.
struct SpeakerHandler {
    speaker: Arc<SpeakerManager>,
    pending_events: Vec<Event>,
    pending_reset: Option<u32>,
}

impl SequenceHandler for SpeakerHandler {
    type Message = Vec<u8>;

    fn on_message(&mut self, sequence: u32, msg: Vec<u8>) {
        let (events, reset) = self.speaker.handle_message(sequence, &msg);
        self.pending_events.extend(events);
        if let Some(r) = reset {
            self.pending_reset = Some(r);
        }
    }
}

struct CapabilitiesAckHandler {
    capabilities: Arc<CapabilitiesManager>,
}

impl SequenceHandler for CapabilitiesAckHandler {
    type Message = Vec<u8>;

    fn on_message(&mut self, sequence: u32, msg: Vec<u8>) {
        match parse_json_array_body(&msg, Topic::CapabilitiesAck) {
            Ok(messages) => {
                for jm in messages {
                    self.capabilities.handle_ack(&jm);
                }
            }
            Err(e) => tracing::debug!(sequence, error = %e, "malformed capabilities-ack"),
        }
    }
}

/// `connection-from-service` carries no content defined by this engine
/// beyond its envelope; logged for visibility only.
struct ConnectionFromServiceHandler;

impl SequenceHandler for ConnectionFromServiceHandler {
    type Message = Vec<u8>;

    fn on_message(&mut self, sequence: u32, msg: Vec<u8>) {
        match parse_json_array_body(&msg, Topic::ConnectionFromService) {
            Ok(messages) => {
                for jm in messages {
                    info!(name = %jm.name, sequence, "connection-from-service message");
                }
            }
            Err(e) => tracing::debug!(sequence, error = %e, "malformed connection-from-service message"),
        }
    }
}

struct MqttConnectionSupervisor {
    regulator: RegulatorHandle,
}

impl ConnectionSupervisor for MqttConnectionSupervisor {
    fn request_disconnect(&self, cause: &str) {
        let msg = JsonMessage {
            name: "Disconnect".to_string(),
            message_id: None,
            payload: serde_json::json!({ "cause": cause }),
        };
        self.regulator.write(encode_json_message_chunk(&msg));
    }
}

/// Drives one topic's sequencer loop to completion: receive raw bytes,
/// decode/dispatch through the pump, and re-arm the missing-message timer
/// per `should_arm_timer`/`timeout_duration`.
async fn run_inbound_pump<H, F>(mut pump: InboundTopicPump<H>, mut rx: mpsc::Receiver<Vec<u8>>, mut after_raw: F)
where
    H: SequenceHandler<Message = Vec<u8>> + Send + 'static,
    F: FnMut(&mut H) -> Option<u32> + Send + 'static,
{
    loop {
        if pump.should_arm_timer() {
            match tokio::time::timeout(pump.timeout_duration(), rx.recv()).await {
                Ok(Some(bytes)) => {
                    pump.handle_raw(&bytes);
                    if let Some(new_expected) = after_raw(pump.handler_mut()) {
                        pump.reset_sequence_number(new_expected);
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => pump.on_timer_expired(),
            }
        } else {
            match rx.recv().await {
                Some(bytes) => {
                    pump.handle_raw(&bytes);
                    if let Some(new_expected) = after_raw(pump.handler_mut()) {
                        pump.reset_sequence_number(new_expected);
                    }
                }
                None => break,
            }
        }
    }
}

struct InboundSenders {
    directive: mpsc::Sender<Vec<u8>>,
    speaker: mpsc::Sender<Vec<u8>>,
    capabilities_ack: mpsc::Sender<Vec<u8>>,
    connection_from_service: mpsc::Sender<Vec<u8>>,
}

/// Drives the rumqttc event loop and routes `Packet::Publish` payloads to
/// the per-topic inbound channels by matching the wire topic string.
async fn mqtt_eventloop_task(
    mut eventloop: EventLoop,
    topic_lookup: HashMap<String, Topic>,
    senders: InboundSenders,
    stats: Arc<Stats>,
) {
    loop {
        match eventloop.poll().await {
            Ok(rumqttc::Event::Incoming(Packet::Publish(p))) => {
                let payload = p.payload.to_vec();
                match topic_lookup.get(p.topic.as_str()) {
                    Some(Topic::Directive) => send_or_drop(&senders.directive, payload, &stats),
                    Some(Topic::Speaker) => send_or_drop(&senders.speaker, payload, &stats),
                    Some(Topic::CapabilitiesAck) => send_or_drop(&senders.capabilities_ack, payload, &stats),
                    Some(Topic::ConnectionFromService) => {
                        send_or_drop(&senders.connection_from_service, payload, &stats)
                    }
                    _ => tracing::debug!(topic = %p.topic, "unrecognized inbound topic"),
                }
            }
            Ok(event) => tracing::trace!(?event, "mqtt event"),
            Err(e) => {
                tracing::error!(error = %e, "mqtt connection error, reconnecting in 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn send_or_drop(tx: &mpsc::Sender<Vec<u8>>, payload: Vec<u8>, stats: &Stats) {
    if tx.try_send(payload).is_err() {
        stats.record_channel_drop();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();

    let config = Config::parse();

    info!(
        mqtt_addr = config.mqtt_addr(),
        device_topic_root = config.device_topic_root,
        api_port = config.api_port,
        "aia-client-engine starting"
    );

    let stats = Stats::new();

    let master_key = parse_master_key_hex(&config.master_key_hex)
        .map_err(|e| anyhow::anyhow!("invalid master_key_hex: {e}"))?;
    let topic_keys = derive_topic_keys(&master_key);
    let secret: Arc<dyn SecretManager> = Arc::new(ChaChaSecretManager::new(topic_keys));

    std::fs::create_dir_all(&config.state_dir)?;

    let mut handles = Vec::new();

    // Stats reporter.
    {
        let stats = stats.clone();
        let interval = config.stats_interval_secs;
        handles.push(tokio::spawn(async move {
            stats::stats_reporter(stats, interval).await;
        }));
    }

    // REST introspection server.
    {
        let api_handle = api::start_api_server(&config.api_host, config.api_port, stats.clone()).await?;
        handles.push(api_handle);
    }

    // MQTT client.
    let mut mqtt_opts = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs as u64));
    mqtt_opts.set_inflight(u16::MAX);
    mqtt_opts.set_clean_session(true);
    let (client, eventloop) = AsyncClient::new(mqtt_opts, 65536);

    for t in Topic::ALL.iter().filter(|t| t.is_inbound()) {
        client
            .subscribe(t.wire_topic(&config.device_topic_root), QoS::AtMostOnce)
            .await?;
    }

    // Outbound regulators, one per outbound topic.
    let regulator_tick = Duration::from_millis(config.regulator_tick_ms);
    let (event_regulator, event_task) = spawn_regulator(
        regulator_tick,
        Emitter::new(
            Topic::Event,
            config.device_topic_root.clone(),
            client.clone(),
            Arc::clone(&secret),
            stats.clone(),
            config.max_message_bytes,
        ),
        256,
        stats.clone(),
    );
    handles.push(event_task);

    let (microphone_regulator, microphone_regulator_task) = spawn_regulator(
        regulator_tick,
        Emitter::new(
            Topic::Microphone,
            config.device_topic_root.clone(),
            client.clone(),
            Arc::clone(&secret),
            stats.clone(),
            config.max_message_bytes,
        ),
        256,
        stats.clone(),
    );
    handles.push(microphone_regulator_task);

    let (capabilities_regulator, capabilities_task) = spawn_regulator(
        regulator_tick,
        Emitter::new(
            Topic::Capabilities,
            config.device_topic_root.clone(),
            client.clone(),
            Arc::clone(&secret),
            stats.clone(),
            config.max_message_bytes,
        ),
        16,
        stats.clone(),
    );
    handles.push(capabilities_task);

    let (connection_regulator, connection_task) = spawn_regulator(
        regulator_tick,
        Emitter::new(
            Topic::ConnectionFromClient,
            config.device_topic_root.clone(),
            client.clone(),
            Arc::clone(&secret),
            stats.clone(),
            config.max_message_bytes,
        ),
        16,
        stats.clone(),
    );
    handles.push(connection_task);

    // Speaker path: ring buffer, manager, playback-tick loop.
    let speaker_buffer = DataStreamBuffer::create(config.speaker_buffer_words, config.word_size_bytes, 1);
    let speaker_writer = speaker_buffer.create_writer(WriterPolicy::Nonblockable, false)?;
    let speaker_reader = speaker_buffer.create_reader(ReaderPolicy::BlockingWithTimeout, true)?;
    let speaker = Arc::new(SpeakerManager::new(
        speaker_writer,
        speaker_reader,
        Arc::new(LoggingSpeakerPlatform),
        config.speaker_overrun_warning_words,
        config.speaker_underrun_warning_words,
        config.word_size_bytes as u64,
        Duration::from_millis(config.playback_tick_ms * 4),
        50,
    ));

    {
        let speaker = Arc::clone(&speaker);
        let event_regulator = event_regulator.clone();
        let tick = Duration::from_millis(config.playback_tick_ms);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let events = speaker.playback_tick().await;
                for e in events {
                    event_regulator.write(encode_json_message_chunk(&e.to_json_message(None)));
                }
            }
        }));
    }

    // Microphone path: ring buffer, manager, capture task, pending-open expiry loop.
    let microphone_buffer = DataStreamBuffer::create(config.microphone_buffer_words, config.word_size_bytes, 1);
    // A real platform's capture ISR would own this writer; kept alive here
    // so the buffer isn't torn down with no producer at all.
    let _microphone_writer = microphone_buffer.create_writer(WriterPolicy::Nonblockable, false)?;
    let microphone_reader = microphone_buffer.create_reader(ReaderPolicy::Nonblocking, true)?;
    let microphone = Arc::new(MicrophoneManager::new(
        microphone_reader,
        config.word_size_bytes as u64,
        config.microphone_preroll_samples,
    ));

    handles.push(microphone::spawn_capture_task(
        Arc::clone(&microphone),
        microphone_regulator.clone(),
        config.microphone_chunk_samples,
        Duration::from_millis(config.microphone_tick_ms),
        Duration::from_millis(config.microphone_tick_ms),
        stats.clone(),
    ));

    {
        let microphone = Arc::clone(&microphone);
        let event_regulator = event_regulator.clone();
        let tick = Duration::from_millis(config.microphone_tick_ms);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                for e in microphone.expire_pending_open() {
                    event_regulator.write(encode_json_message_chunk(&e.to_json_message(None)));
                }
            }
        }));
    }

    // UX manager: drains offset-gated attention actions in lockstep with
    // the speaker reader cursor.
    let ux = Arc::new(UxManager::new(Arc::new(LoggingUxObserver)));
    {
        let ux = Arc::clone(&ux);
        let speaker = Arc::clone(&speaker);
        let tick = Duration::from_millis(config.playback_tick_ms);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                ux.drain_due_attention_actions(speaker.reader_offset());
            }
        }));
    }

    // Alert manager: file-backed stores, offline-playback decision loop.
    let alert_store = Arc::new(FileAlertStore::new(format!("{}/alerts.jsonl", config.state_dir)));
    let volume_store = Arc::new(FileVolumeStore::new(format!("{}/volume.json", config.state_dir), 50));
    let supervisor: Arc<dyn ConnectionSupervisor> = Arc::new(MqttConnectionSupervisor {
        regulator: connection_regulator.clone(),
    });
    let alert = Arc::new(AlertManager::new(
        alert_store,
        volume_store,
        Arc::clone(&speaker),
        Arc::clone(&ux),
        supervisor,
        Duration::from_secs(config.alert_expiration_secs),
    ));

    {
        let alert = Arc::clone(&alert);
        let clock = Arc::new(ClockManager::new(Arc::new(SystemClock::default())));
        let tick = Duration::from_millis(config.alert_poll_ms);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                alert.offline_playback_tick(clock.time_since_ntp_epoch_s());
            }
        }));
    }

    // Capabilities announcement, sent once at startup.
    let capabilities = Arc::new(CapabilitiesManager::new(
        serde_json::json!({ "speaker": true, "microphone": true, "alerts": true }),
        Arc::new(LoggingCapabilitiesObserver),
    ));
    capabilities_regulator.write(encode_json_message_chunk(&capabilities.announce()));

    let managers = Arc::new(Managers {
        speaker: Arc::clone(&speaker),
        microphone: Arc::clone(&microphone),
        ux: Arc::clone(&ux),
        alert: Arc::clone(&alert),
    });

    // Inbound dispatch: one sequencer pump per inbound topic, each fed by
    // its own channel from the MQTT event-loop task.
    let (directive_tx, directive_rx) = mpsc::channel(256);
    let (speaker_tx, speaker_rx) = mpsc::channel(256);
    let (capabilities_ack_tx, capabilities_ack_rx) = mpsc::channel(16);
    let (connection_tx, connection_rx) = mpsc::channel(16);

    let sequence_timeout = Duration::from_millis(config.sequencer_timeout_ms);

    {
        let handler = DirectiveHandler {
            managers: Arc::clone(&managers),
            pending_events: Vec::new(),
        };
        let pump = InboundTopicPump::new(
            Topic::Directive,
            0,
            config.sequencer_max_slots,
            sequence_timeout,
            handler,
            Arc::clone(&secret),
            stats.clone(),
        );
        let event_regulator = event_regulator.clone();
        handles.push(tokio::spawn(run_inbound_pump(pump, directive_rx, move |h: &mut DirectiveHandler| {
            for e in h.pending_events.drain(..) {
                event_regulator.write(encode_json_message_chunk(&e.to_json_message(None)));
            }
            None
        })));
    }

    {
        let handler = SpeakerHandler {
            speaker: Arc::clone(&speaker),
            pending_events: Vec::new(),
            pending_reset: None,
        };
        let pump = InboundTopicPump::new(
            Topic::Speaker,
            0,
            config.sequencer_max_slots,
            sequence_timeout,
            handler,
            Arc::clone(&secret),
            stats.clone(),
        );
        let event_regulator = event_regulator.clone();
        handles.push(tokio::spawn(run_inbound_pump(pump, speaker_rx, move |h: &mut SpeakerHandler| {
            for e in h.pending_events.drain(..) {
                event_regulator.write(encode_json_message_chunk(&e.to_json_message(None)));
            }
            h.pending_reset.take()
        })));
    }

    {
        let handler = CapabilitiesAckHandler {
            capabilities: Arc::clone(&capabilities),
        };
        let pump = InboundTopicPump::new(
            Topic::CapabilitiesAck,
            0,
            config.sequencer_max_slots,
            sequence_timeout,
            handler,
            Arc::clone(&secret),
            stats.clone(),
        );
        handles.push(tokio::spawn(run_inbound_pump(pump, capabilities_ack_rx, |_: &mut CapabilitiesAckHandler| None)));
    }

    {
        let pump = InboundTopicPump::new(
            Topic::ConnectionFromService,
            0,
            config.sequencer_max_slots,
            sequence_timeout,
            ConnectionFromServiceHandler,
            Arc::clone(&secret),
            stats.clone(),
        );
        handles.push(tokio::spawn(run_inbound_pump(
            pump,
            connection_rx,
            |_: &mut ConnectionFromServiceHandler| None,
        )));
    }

    let mut topic_lookup = HashMap::new();
    for t in Topic::ALL.iter().filter(|t| t.is_inbound()) {
        topic_lookup.insert(t.wire_topic(&config.device_topic_root), *t);
    }
    let senders = InboundSenders {
        directive: directive_tx,
        speaker: speaker_tx,
        capabilities_ack: capabilities_ack_tx,
        connection_from_service: connection_tx,
    };
    handles.push(tokio::spawn(mqtt_eventloop_task(eventloop, topic_lookup, senders, stats.clone())));

    info!("all systems go, dispatching on {} topics", Topic::ALL.len());

    for h in handles {
        h.await?;
    }

    Ok(())
}
