//! Wires the media engine to real devices and the QUIC relay transport.

use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use chorus_media::capture::{self, CaptureSession, PlaybackSession};
use chorus_media::engine::{EngineCommand, EngineEvent, EngineIo, MediaEngine, VideoCodecs};
use chorus_media::simulcast::VideoFrame;
use chorus_media::transport;
use chorus_protocol::config::MediaConfig;

/// A live voice connection: engine task plus exclusively-owned devices.
pub struct VoiceSession {
    pub commands: mpsc::Sender<EngineCommand>,
    /// Camera and screen frames from the embedding shell (headless runs
    /// leave these idle).
    #[allow(dead_code)]
    pub camera_frames: mpsc::Sender<VideoFrame>,
    #[allow(dead_code)]
    pub screen_frames: mpsc::Sender<VideoFrame>,
    cancel: CancellationToken,
    engine_task: tokio::task::JoinHandle<()>,
    capture: CaptureSession,
    playback: PlaybackSession,
}

fn video_codecs() -> VideoCodecs {
    #[cfg(feature = "vpx")]
    {
        VideoCodecs {
            encoder_factory: Some(chorus_media::vpx::vp9_factory()),
            decoder_factory: None,
        }
    }
    #[cfg(not(feature = "vpx"))]
    {
        VideoCodecs::default()
    }
}

/// Connect the relay, open the microphone and speaker, and start the engine.
/// Returns the session handle and the engine's event stream.
pub async fn connect_voice(
    config: &MediaConfig,
    relay_url: &str,
) -> anyhow::Result<(VoiceSession, mpsc::Receiver<EngineEvent>)> {
    let cancel = CancellationToken::new();
    let transport = transport::connect_quic(
        relay_url,
        Duration::from_secs(config.connect_timeout_secs),
        cancel.clone(),
    )
    .await
    .context("relay transport")?;

    let (capture, mic_frames) = capture::start_capture().context("microphone capture")?;
    let (playback, playback_sink) = capture::start_playback().context("audio playback")?;

    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (camera_tx, camera_rx) = mpsc::channel(8);
    let (screen_tx, screen_rx) = mpsc::channel(8);

    let io = EngineIo {
        transport,
        commands: command_rx,
        events: event_tx,
        mic_frames,
        camera_frames: camera_rx,
        screen_frames: screen_rx,
        playback: playback_sink,
    };
    let engine_task = tokio::spawn(MediaEngine::run(
        config.clone(),
        video_codecs(),
        io,
        cancel.clone(),
    ));
    info!(relay = relay_url, "Voice session started");

    Ok((
        VoiceSession {
            commands: command_tx,
            camera_frames: camera_tx,
            screen_frames: screen_tx,
            cancel,
            engine_task,
            capture,
            playback,
        },
        event_rx,
    ))
}

impl VoiceSession {
    /// Orderly teardown: engine first (sends its leave), then devices.
    pub async fn disconnect(self) {
        let _ = self.commands.send(EngineCommand::Disconnect).await;
        self.cancel.cancel();
        let _ = self.engine_task.await;
        self.capture.stop();
        self.playback.stop();
        info!("Voice session closed");
    }
}
