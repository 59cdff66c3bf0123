//! Microphone capture and speaker playback via cpal.
//!
//! cpal streams are not `Send`, so each stream lives on a dedicated thread
//! that owns it for its whole life; the engine talks to it through channels.
//! A session handle bundles the channel ends with the stop signal so that
//! teardown cannot leave an orphaned device open.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audio::{FRAME_SAMPLES, SAMPLE_RATE};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no default {0} device")]
    NoDevice(&'static str),
    #[error("failed to build audio stream: {0}")]
    Build(String),
    #[error("failed to start audio stream: {0}")]
    Play(String),
    #[error("audio thread died during setup")]
    ThreadDied,
}

/// Owning handle for a running microphone capture.
///
/// Dropping the handle (or calling [`CaptureSession::stop`]) signals the
/// capture thread, which closes the device before exiting.
pub struct CaptureSession {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureSession {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take()
            && let Err(e) = handle.join()
        {
            warn!("Capture thread panicked: {e:?}");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start capturing the default input device. 20 ms mono i16 frames arrive
/// on the returned receiver.
pub fn start_capture() -> Result<(CaptureSession, mpsc::Receiver<Vec<i16>>), CaptureError> {
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>(16);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("mic-capture".into())
        .spawn(move || {
            let stream = match build_input_stream(frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while !stop_for_thread.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            info!("Microphone capture stopped");
        })
        .map_err(|e| CaptureError::Build(e.to_string()))?;

    ready_rx.recv().map_err(|_| CaptureError::ThreadDied)??;
    info!(sample_rate = SAMPLE_RATE, frame_samples = FRAME_SAMPLES, "Microphone capture started");
    Ok((CaptureSession { stop, thread: Some(thread) }, frame_rx))
}

fn build_input_stream(frame_tx: mpsc::Sender<Vec<i16>>) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoDevice("input"))?;

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push((sample.clamp(-1.0, 1.0) * 32_767.0) as i16);
                    if pending.len() >= FRAME_SAMPLES {
                        let frame = pending.drain(..FRAME_SAMPLES).collect();
                        // Frames are dropped rather than queued when the
                        // engine falls behind.
                        let _ = frame_tx.try_send(frame);
                    }
                }
            },
            |err| {
                error!("Audio capture error: {err}");
            },
            None,
        )
        .map_err(|e| CaptureError::Build(e.to_string()))?;
    stream.play().map_err(|e| CaptureError::Play(e.to_string()))?;
    Ok(stream)
}

/// Owning handle for a running speaker playback stream.
pub struct PlaybackSession {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take()
            && let Err(e) = handle.join()
        {
            warn!("Playback thread panicked: {e:?}");
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start playback on the default output device. PCM frames pushed into the
/// returned sender are drained by the device callback.
pub fn start_playback() -> Result<(PlaybackSession, mpsc::UnboundedSender<Vec<i16>>), CaptureError> {
    let (pcm_tx, pcm_rx) = mpsc::unbounded_channel::<Vec<i16>>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("audio-playback".into())
        .spawn(move || {
            let stream = match build_output_stream(pcm_rx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            while !stop_for_thread.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            info!("Audio playback stopped");
        })
        .map_err(|e| CaptureError::Build(e.to_string()))?;

    ready_rx.recv().map_err(|_| CaptureError::ThreadDied)??;
    info!("Audio playback started");
    Ok((PlaybackSession { stop, thread: Some(thread) }, pcm_tx))
}

fn build_output_stream(
    mut pcm_rx: mpsc::UnboundedReceiver<Vec<i16>>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(CaptureError::NoDevice("output"))?;

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    // Cap device-side buffering at 2 s to bound latency after a stall.
    const MAX_BUFFERED: usize = SAMPLE_RATE as usize * 2;
    let mut buffered: std::collections::VecDeque<i16> = std::collections::VecDeque::new();

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(frame) = pcm_rx.try_recv() {
                    buffered.extend(frame);
                }
                if buffered.len() > MAX_BUFFERED {
                    let excess = buffered.len() - MAX_BUFFERED;
                    buffered.drain(..excess);
                    warn!(dropped = excess, "Playback buffer overflow");
                }
                for sample in data.iter_mut() {
                    *sample = match buffered.pop_front() {
                        Some(s) => s as f32 / 32_767.0,
                        None => 0.0,
                    };
                }
            },
            |err| {
                error!("Audio playback error: {err}");
            },
            None,
        )
        .map_err(|e| CaptureError::Build(e.to_string()))?;
    stream.play().map_err(|e| CaptureError::Play(e.to_string()))?;
    Ok(stream)
}
