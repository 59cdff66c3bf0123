//! Media engine orchestrator.
//!
//! Owns the full session pipeline: mic frames in → Opus → AEAD → datagrams
//! out, and datagrams in → decrypt → jitter buffer / video decode → playback
//! and render surfaces. Commands and events cross bounded typed channels;
//! nothing in here blocks on a slow consumer. One cooperative select loop
//! drives capture input, transport I/O, control handling, the 20 ms playout
//! cadence, and render ticks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chorus_protocol::config::MediaConfig;
use chorus_protocol::control::ControlMessage;
use chorus_protocol::packet::{self, HEADER_SIZE, MediaHeader, TrackType};

use crate::audio::{self, AudioDecoder, AudioEncoder, TICKS_PER_FRAME};
use crate::crypto::{KEY_LEN, SenderKeyStore, rotation_due};
use crate::decode::{DecoderSession, RenderTarget, Renderer, VideoDecoderFactory};
use crate::jitter::{JitterBuffer, JitterStats};
use crate::simulcast::{LayerCodecFactory, SimulcastEncoder, VideoFrame};
use crate::transport::TransportHandle;

/// Header audio levels below this count as speaking (0 is loudest).
const SPEAKING_LEVEL: u8 = 80;

/// Screen share encodes a single layer at the captured size.
const SCREEN_FRAME_RATE: u32 = 30;
const SCREEN_BITRATE_KBPS: u32 = 2500;

/// Render surfaces are refreshed at roughly 30 Hz.
const RENDER_TICK_MS: u64 = 33;

/// Stats snapshots for the UI.
const STATS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Disconnected,
    Connecting,
    Joined,
    Disconnecting,
}

pub enum EngineCommand {
    SetMuted(bool),
    SetDeafened(bool),
    StartVideo { width: u32, height: u32 },
    StopVideo,
    StartScreenShare { width: u32, height: u32 },
    StopScreenShare,
    /// Bind a UI surface to a remote user's video.
    Subscribe { user_id: String, target: Box<dyn RenderTarget> },
    Unsubscribe { user_id: String },
    /// Ask a remote sender for a fresh keyframe.
    RequestKeyframe { target_ssrc: u32 },
    Disconnect,
}

#[derive(Debug)]
pub enum EngineEvent {
    Joined { ssrc: u32 },
    Disconnected { reason: String },
    ParticipantJoined { ssrc: u32, user_id: String },
    ParticipantLeft { ssrc: u32, user_id: String },
    Speaking { user_id: String, speaking: bool },
    VideoError { message: String },
    FatalError { message: String },
    Stats(EngineStats),
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub send_drops: u64,
    pub participants: Vec<ParticipantStats>,
}

#[derive(Debug, Clone)]
pub struct ParticipantStats {
    pub ssrc: u32,
    pub user_id: String,
    pub audio_level: u8,
    pub speaking: bool,
    pub jitter: JitterStats,
}

/// Codec constructors the embedder installs (real VP9 behind the `vpx`
/// feature; stubs in tests). Video stays disabled without them.
#[derive(Default)]
pub struct VideoCodecs {
    pub encoder_factory: Option<LayerCodecFactory>,
    pub decoder_factory: Option<VideoDecoderFactory>,
}

/// Channel bundle wiring the engine to its collaborators.
pub struct EngineIo {
    pub transport: TransportHandle,
    pub commands: mpsc::Receiver<EngineCommand>,
    pub events: mpsc::Sender<EngineEvent>,
    /// 20 ms mono PCM frames from the capture session.
    pub mic_frames: mpsc::Receiver<Vec<i16>>,
    pub camera_frames: mpsc::Receiver<VideoFrame>,
    pub screen_frames: mpsc::Receiver<VideoFrame>,
    /// Decoded PCM toward the playback session.
    pub playback: mpsc::UnboundedSender<Vec<i16>>,
}

struct EngineOutputs {
    datagram_tx: mpsc::Sender<Bytes>,
    control_tx: mpsc::Sender<ControlMessage>,
    events: mpsc::Sender<EngineEvent>,
    playback: mpsc::UnboundedSender<Vec<i16>>,
}

struct Participant {
    user_id: String,
    decoder: AudioDecoder,
    jitter: JitterBuffer,
    audio_level: u8,
    speaking: bool,
}

struct VideoSubscription {
    ssrc: Option<u32>,
    session: Option<DecoderSession>,
    renderer: Renderer,
}

pub struct MediaEngine {
    config: MediaConfig,
    phase: EnginePhase,
    start: Instant,
    local_ssrc: u32,
    screen_ssrc: u32,
    keys: SenderKeyStore,
    muted: bool,
    deafened: bool,
    audio_encoder: AudioEncoder,
    audio_seq: u16,
    audio_timestamp: u32,
    camera: Option<SimulcastEncoder>,
    camera_seq: Vec<u16>,
    screen: Option<SimulcastEncoder>,
    screen_seq: u16,
    participants: HashMap<u32, Participant>,
    ssrc_users: HashMap<u32, String>,
    subscriptions: HashMap<String, VideoSubscription>,
    codecs: VideoCodecs,
    packets_sent: u64,
    packets_received: u64,
    send_drops: u64,
}

impl MediaEngine {
    /// Run a media session over an already-connected transport until the
    /// token is cancelled, a `Disconnect` command arrives, or the transport
    /// dies. All owned resources are released before returning.
    pub async fn run(
        config: MediaConfig,
        codecs: VideoCodecs,
        io: EngineIo,
        cancel: CancellationToken,
    ) {
        let EngineIo {
            transport,
            mut commands,
            events,
            mut mic_frames,
            mut camera_frames,
            mut screen_frames,
            playback,
        } = io;
        let TransportHandle {
            datagram_tx,
            mut datagram_rx,
            control_tx,
            mut control_rx,
        } = transport;
        let out = EngineOutputs { datagram_tx, control_tx, events, playback };

        let audio_encoder = match AudioEncoder::new(config.audio_bitrate) {
            Ok(encoder) => encoder,
            Err(e) => {
                emit(&out, EngineEvent::FatalError { message: format!("opus encoder: {e}") });
                return;
            }
        };

        let mut engine = MediaEngine {
            phase: EnginePhase::Connecting,
            start: Instant::now(),
            local_ssrc: rand::random(),
            screen_ssrc: rand::random(),
            keys: SenderKeyStore::new(),
            muted: false,
            deafened: false,
            audio_encoder,
            audio_seq: 0,
            audio_timestamp: 0,
            camera: None,
            camera_seq: Vec::new(),
            screen: None,
            screen_seq: 0,
            participants: HashMap::new(),
            ssrc_users: HashMap::new(),
            subscriptions: HashMap::new(),
            codecs,
            packets_sent: 0,
            packets_received: 0,
            send_drops: 0,
            config,
        };

        // Joined requires: transport up (our caller connected it), an SSRC,
        // a local sender key, and the join announcement on the wire.
        engine.keys.generate_local();
        let (epoch, key) = engine.keys.export_local().expect("key generated above");
        engine.send_control(
            &out,
            ControlMessage::Join {
                ssrc: engine.local_ssrc,
                sender_key: key.to_vec(),
                epoch,
            },
        );
        engine.phase = EnginePhase::Joined;
        info!(ssrc = engine.local_ssrc, "Media session joined");
        emit(&out, EngineEvent::Joined { ssrc: engine.local_ssrc });

        let mut playout = tokio::time::interval(Duration::from_millis(audio::FRAME_MS));
        playout.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut render = tokio::time::interval(Duration::from_millis(RENDER_TICK_MS));
        render.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut mic_open = true;
        let mut camera_open = true;
        let mut screen_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    engine.shutdown("cancelled", &out);
                    break;
                }
                cmd = commands.recv() => {
                    match cmd {
                        None | Some(EngineCommand::Disconnect) => {
                            engine.shutdown("disconnect requested", &out);
                            break;
                        }
                        Some(cmd) => engine.handle_command(cmd, &out),
                    }
                }
                pcm = mic_frames.recv(), if mic_open => {
                    match pcm {
                        Some(pcm) => engine.send_audio(&pcm, &out),
                        None => mic_open = false,
                    }
                }
                frame = camera_frames.recv(), if camera_open => {
                    match frame {
                        Some(frame) => engine.send_camera_frame(&frame, &out),
                        None => camera_open = false,
                    }
                }
                frame = screen_frames.recv(), if screen_open => {
                    match frame {
                        Some(frame) => engine.send_screen_frame(&frame, &out),
                        None => screen_open = false,
                    }
                }
                datagram = datagram_rx.recv() => {
                    match datagram {
                        Some(datagram) => engine.handle_packet(&datagram, &out),
                        None => {
                            engine.shutdown("transport closed", &out);
                            break;
                        }
                    }
                }
                message = control_rx.recv() => {
                    match message {
                        Some(message) => engine.handle_control(message, &out),
                        None => {
                            engine.shutdown("transport closed", &out);
                            break;
                        }
                    }
                }
                _ = playout.tick() => engine.playout_tick(&out),
                _ = render.tick() => engine.render_tick(),
                _ = stats.tick() => emit(&out, EngineEvent::Stats(engine.stats())),
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn send_control(&self, out: &EngineOutputs, message: ControlMessage) {
        // Fire-and-forget; the transport task owns queueing and retries.
        if out.control_tx.try_send(message).is_err() {
            warn!("Control channel backed up, message dropped");
        }
    }

    fn send_packet(&mut self, out: &EngineOutputs, header_bytes: [u8; HEADER_SIZE], ciphertext: Vec<u8>) {
        let mut packet = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        packet.extend_from_slice(&header_bytes);
        packet.extend_from_slice(&ciphertext);
        match out.datagram_tx.try_send(Bytes::from(packet)) {
            Ok(()) => self.packets_sent += 1,
            Err(_) => {
                self.send_drops += 1;
                if self.send_drops == 1 || self.send_drops % 500 == 0 {
                    debug!(drops = self.send_drops, "Dropping outbound packet, transport behind");
                }
            }
        }
    }

    /// Rotate the local sender key and advertise the new epoch.
    fn rotate_local_key(&mut self, out: &EngineOutputs) {
        let epoch = self.keys.generate_local();
        let (_, key) = self.keys.export_local().expect("key generated above");
        info!(epoch, "Rotated local sender key");
        self.send_control(
            out,
            ControlMessage::SenderKeyUpdate {
                ssrc: self.local_ssrc,
                sender_key: key.to_vec(),
                epoch,
            },
        );
        if self.screen.is_some() {
            self.send_control(
                out,
                ControlMessage::SenderKeyUpdate {
                    ssrc: self.screen_ssrc,
                    sender_key: key.to_vec(),
                    epoch,
                },
            );
        }
    }

    fn send_audio(&mut self, pcm: &[i16], out: &EngineOutputs) {
        if self.phase != EnginePhase::Joined || self.muted {
            // Muted keeps the capture path warm but emits nothing.
            return;
        }
        let level = audio::audio_level(pcm);
        let data = match self.audio_encoder.encode(pcm) {
            Ok(data) => data,
            Err(e) => {
                warn!("Opus encode failed: {e}");
                return;
            }
        };
        if rotation_due(self.audio_seq) {
            self.rotate_local_key(out);
        }
        let Some(epoch) = self.keys.local_epoch() else { return };
        let mut header =
            MediaHeader::audio(self.local_ssrc, self.audio_seq, self.audio_timestamp, level, epoch);
        header.payload_length = (data.len() + crate::crypto::TAG_LEN) as u16;
        let aad = header.to_bytes();
        let ciphertext = match self.keys.encrypt(
            &aad,
            &data,
            self.local_ssrc,
            self.audio_seq,
            TrackType::Audio,
            0,
        ) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!("Audio encrypt failed: {e}");
                return;
            }
        };
        self.send_packet(out, aad, ciphertext);
        self.audio_seq = self.audio_seq.wrapping_add(1);
        self.audio_timestamp = self.audio_timestamp.wrapping_add(TICKS_PER_FRAME);
    }

    fn send_camera_frame(&mut self, frame: &VideoFrame, out: &EngineOutputs) {
        if self.phase != EnginePhase::Joined {
            return;
        }
        let now = self.now_ms();
        let Some(camera) = self.camera.as_mut() else { return };
        let chunks = camera.encode(frame, now);
        for chunk in chunks {
            let layer = chunk.layer as usize;
            let seq = self.camera_seq[layer];
            if rotation_due(seq) {
                self.rotate_local_key(out);
            }
            self.send_video_chunk(out, self.local_ssrc, chunk.layer, seq, &chunk);
            self.camera_seq[layer] = seq.wrapping_add(1);
        }
    }

    fn send_screen_frame(&mut self, frame: &VideoFrame, out: &EngineOutputs) {
        if self.phase != EnginePhase::Joined {
            return;
        }
        let now = self.now_ms();
        let Some(screen) = self.screen.as_mut() else { return };
        let chunks = screen.encode(frame, now);
        for chunk in chunks {
            let seq = self.screen_seq;
            if rotation_due(seq) {
                self.rotate_local_key(out);
            }
            self.send_video_chunk(out, self.screen_ssrc, 0, seq, &chunk);
            self.screen_seq = seq.wrapping_add(1);
        }
    }

    fn send_video_chunk(
        &mut self,
        out: &EngineOutputs,
        ssrc: u32,
        layer: u8,
        seq: u16,
        chunk: &crate::simulcast::EncodedChunk,
    ) {
        let Some(epoch) = self.keys.local_epoch() else { return };
        let mut header =
            MediaHeader::video(ssrc, layer, seq, chunk.timestamp_ms as u32, epoch);
        header.payload_length = (chunk.data.len() + crate::crypto::TAG_LEN) as u16;
        let aad = header.to_bytes();
        let ciphertext = match self.keys.encrypt(
            &aad,
            &chunk.data,
            ssrc,
            seq,
            TrackType::Video,
            layer,
        ) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                warn!("Video encrypt failed: {e}");
                return;
            }
        };
        self.send_packet(out, aad, ciphertext);
    }

    fn handle_packet(&mut self, datagram: &Bytes, out: &EngineOutputs) {
        let (header, payload) = match packet::parse_packet(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Dropping malformed packet: {e}");
                return;
            }
        };
        // Echo suppression, before any decrypt attempt.
        if header.ssrc == self.local_ssrc || header.ssrc == self.screen_ssrc {
            return;
        }
        self.packets_received += 1;
        let aad = &datagram[..HEADER_SIZE];

        match header.track_type {
            TrackType::Audio => {
                // Data may race the participant_join announcement; early
                // datagrams from unknown senders are dropped silently.
                if !self.participants.contains_key(&header.ssrc) {
                    return;
                }
                let plaintext = match self.keys.decrypt(
                    aad,
                    payload,
                    header.ssrc,
                    header.key_epoch,
                    header.sequence,
                    TrackType::Audio,
                    0,
                ) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        debug!(ssrc = header.ssrc, "Audio decrypt failed: {e}");
                        return;
                    }
                };
                let now = self.now_ms();
                let participant = self
                    .participants
                    .get_mut(&header.ssrc)
                    .expect("checked above");
                participant.audio_level = header.audio_level;
                let speaking = header.audio_level < SPEAKING_LEVEL;
                if speaking != participant.speaking {
                    participant.speaking = speaking;
                    let user_id = participant.user_id.clone();
                    emit(out, EngineEvent::Speaking { user_id, speaking });
                }
                participant
                    .jitter
                    .push(header.sequence, header.timestamp, plaintext, now);
            }
            TrackType::Video => {
                let Some(user_id) = self.ssrc_users.get(&header.ssrc).cloned() else {
                    return;
                };
                let Some(subscription) = self.subscriptions.get_mut(&user_id) else {
                    return;
                };
                // Re-bind after a participant re-join without tearing the
                // renderer down.
                subscription.ssrc = Some(header.ssrc);
                let plaintext = match self.keys.decrypt(
                    aad,
                    payload,
                    header.ssrc,
                    header.key_epoch,
                    header.sequence,
                    TrackType::Video,
                    header.simulcast_layer,
                ) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        debug!(ssrc = header.ssrc, "Video decrypt failed: {e}");
                        return;
                    }
                };
                let subscription = self
                    .subscriptions
                    .get_mut(&user_id)
                    .expect("looked up above");
                if let Some(session) = subscription.session.as_mut()
                    && let Some(frame) = session.submit(&plaintext, None)
                {
                    subscription.renderer.submit(frame);
                }
            }
        }
    }

    fn handle_control(&mut self, message: ControlMessage, out: &EngineOutputs) {
        match message {
            ControlMessage::ParticipantJoin { ssrc, user_id, sender_key, epoch } => {
                if let (Some(key), Some(epoch)) = (sender_key, epoch) {
                    self.import_key(ssrc, epoch, &key);
                }
                let decoder = match AudioDecoder::new() {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        warn!(ssrc, "Opus decoder for participant failed: {e}");
                        return;
                    }
                };
                self.participants.insert(
                    ssrc,
                    Participant {
                        user_id: user_id.clone(),
                        decoder,
                        jitter: JitterBuffer::new(&self.config.jitter),
                        audio_level: 127,
                        speaking: false,
                    },
                );
                self.ssrc_users.insert(ssrc, user_id.clone());
                if let Some(subscription) = self.subscriptions.get_mut(&user_id) {
                    subscription.ssrc = Some(ssrc);
                    if let Some(session) = subscription.session.as_mut() {
                        session.reset();
                    }
                }
                info!(ssrc, user_id, "Participant joined");
                emit(out, EngineEvent::ParticipantJoined { ssrc, user_id });
            }
            ControlMessage::ParticipantLeave { ssrc } => {
                let Some(participant) = self.participants.remove(&ssrc) else {
                    return;
                };
                self.ssrc_users.remove(&ssrc);
                self.keys.remove_peer(ssrc);
                if let Some(subscription) = self.subscriptions.get_mut(&participant.user_id) {
                    subscription.ssrc = None;
                    if let Some(session) = subscription.session.as_mut() {
                        session.reset();
                    }
                    subscription.renderer.clear();
                }
                info!(ssrc, user_id = participant.user_id, "Participant left");
                emit(
                    out,
                    EngineEvent::ParticipantLeft { ssrc, user_id: participant.user_id },
                );
            }
            ControlMessage::SenderKeyUpdate { ssrc, sender_key, epoch } => {
                self.import_key(ssrc, epoch, &sender_key);
            }
            ControlMessage::RequestKeyframe { .. } => {
                // Addressed to us: refresh both outbound video tracks.
                if let Some(camera) = self.camera.as_mut() {
                    camera.request_keyframe(None);
                }
                if let Some(screen) = self.screen.as_mut() {
                    screen.request_keyframe(None);
                }
            }
            other => {
                debug!(message = ?std::mem::discriminant(&other), "Ignoring unexpected control message");
            }
        }
    }

    fn import_key(&mut self, ssrc: u32, epoch: u32, key: &[u8]) {
        let Ok(key) = <[u8; KEY_LEN]>::try_from(key) else {
            warn!(ssrc, epoch, len = key.len(), "Sender key has wrong length");
            return;
        };
        self.keys.import_peer(ssrc, epoch, key);
        debug!(ssrc, epoch, "Imported peer sender key");
    }

    fn handle_command(&mut self, command: EngineCommand, out: &EngineOutputs) {
        match command {
            EngineCommand::SetMuted(muted) => {
                self.muted = muted;
                info!(muted, "Mute changed");
            }
            EngineCommand::SetDeafened(deafened) => {
                self.deafened = deafened;
                info!(deafened, "Deafen changed");
            }
            EngineCommand::StartVideo { width, height } => {
                if self.camera.is_some() {
                    return;
                }
                let Some(factory) = self.codecs.encoder_factory.as_ref() else {
                    emit(out, EngineEvent::VideoError {
                        message: "no video encoder available".into(),
                    });
                    return;
                };
                let encoder = SimulcastEncoder::new(
                    width,
                    height,
                    self.config.source_frame_rate,
                    self.config.keyframe_interval_secs * 1000,
                    factory,
                );
                let layers = encoder.layer_count() as u8;
                self.camera_seq = vec![0; layers as usize];
                self.camera = Some(encoder);
                self.send_control(
                    out,
                    ControlMessage::VideoStart { ssrc: self.local_ssrc, width, height, layers },
                );
            }
            EngineCommand::StopVideo => {
                if let Some(mut camera) = self.camera.take() {
                    camera.close();
                    self.send_control(out, ControlMessage::VideoStop { ssrc: self.local_ssrc });
                }
            }
            EngineCommand::StartScreenShare { width, height } => {
                if self.screen.is_some() {
                    return;
                }
                let Some(factory) = self.codecs.encoder_factory.as_ref() else {
                    emit(out, EngineEvent::VideoError {
                        message: "no video encoder available".into(),
                    });
                    return;
                };
                self.screen = Some(SimulcastEncoder::single_layer(
                    width,
                    height,
                    SCREEN_FRAME_RATE,
                    SCREEN_BITRATE_KBPS,
                    self.config.keyframe_interval_secs * 1000,
                    factory,
                ));
                self.screen_seq = 0;
                self.send_control(
                    out,
                    ControlMessage::ScreenShareStart { ssrc: self.screen_ssrc, width, height },
                );
                // Peers key the screen track by its own SSRC.
                if let Ok((epoch, key)) = self.keys.export_local() {
                    self.send_control(
                        out,
                        ControlMessage::SenderKeyUpdate {
                            ssrc: self.screen_ssrc,
                            sender_key: key.to_vec(),
                            epoch,
                        },
                    );
                }
            }
            EngineCommand::StopScreenShare => {
                if let Some(mut screen) = self.screen.take() {
                    screen.close();
                    self.send_control(
                        out,
                        ControlMessage::ScreenShareStop { ssrc: self.screen_ssrc },
                    );
                }
            }
            EngineCommand::Subscribe { user_id, target } => {
                let session = match self.codecs.decoder_factory.as_ref() {
                    Some(factory) => match factory() {
                        Ok(decoder) => Some(DecoderSession::new(decoder)),
                        Err(e) => {
                            emit(out, EngineEvent::VideoError {
                                message: format!("video decoder: {e}"),
                            });
                            None
                        }
                    },
                    None => {
                        debug!(user_id, "No video decoder installed, subscription is render-only");
                        None
                    }
                };
                let ssrc = self
                    .ssrc_users
                    .iter()
                    .find(|(_, uid)| **uid == user_id)
                    .map(|(ssrc, _)| *ssrc);
                self.subscriptions.insert(
                    user_id,
                    VideoSubscription { ssrc, session, renderer: Renderer::new(target) },
                );
            }
            EngineCommand::Unsubscribe { user_id } => {
                self.subscriptions.remove(&user_id);
            }
            EngineCommand::RequestKeyframe { target_ssrc } => {
                self.send_control(out, ControlMessage::RequestKeyframe { target_ssrc });
            }
            EngineCommand::Disconnect => unreachable!("handled by the run loop"),
        }
    }

    fn playout_tick(&mut self, out: &EngineOutputs) {
        if self.deafened {
            return;
        }
        let now = self.now_ms();
        for participant in self.participants.values_mut() {
            let pcm = match participant.jitter.pull(now) {
                Some(data) => match participant.decoder.decode(&data) {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        debug!("Opus decode failed, concealing: {e}");
                        participant.decoder.conceal().unwrap_or_default()
                    }
                },
                None => {
                    // A hole or warm-up gap mid-stream gets concealment;
                    // plain silence (empty buffer) does not.
                    if participant.jitter.stats().buffered > 0 {
                        participant.decoder.conceal().unwrap_or_default()
                    } else {
                        continue;
                    }
                }
            };
            if !pcm.is_empty() {
                let _ = out.playback.send(pcm);
            }
        }
    }

    fn render_tick(&mut self) {
        for subscription in self.subscriptions.values_mut() {
            subscription.renderer.tick();
        }
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            send_drops: self.send_drops,
            participants: self
                .participants
                .iter()
                .map(|(ssrc, p)| ParticipantStats {
                    ssrc: *ssrc,
                    user_id: p.user_id.clone(),
                    audio_level: p.audio_level,
                    speaking: p.speaking,
                    jitter: p.jitter.stats(),
                })
                .collect(),
        }
    }

    /// Safe from any state: closes encoders, clears every table, announces
    /// the leave, and reports the terminal phase.
    fn shutdown(&mut self, reason: &str, out: &EngineOutputs) {
        self.phase = EnginePhase::Disconnecting;
        if let Some(mut camera) = self.camera.take() {
            camera.close();
        }
        if let Some(mut screen) = self.screen.take() {
            screen.close();
        }
        self.send_control(out, ControlMessage::Leave { ssrc: self.local_ssrc });
        self.participants.clear();
        self.ssrc_users.clear();
        self.subscriptions.clear();
        self.phase = EnginePhase::Disconnected;
        info!(reason, "Media session disconnected");
        emit(out, EngineEvent::Disconnected { reason: reason.to_string() });
    }
}

/// Events must never stall the engine; a full channel drops the event.
fn emit(out: &EngineOutputs, event: EngineEvent) {
    if out.events.try_send(event).is_err() {
        debug!("Event channel full, dropping engine event");
    }
}
