//! Simulcast video encoder pipeline.
//!
//! One underlying codec instance per active layer, each fed from a shared
//! I420 capture frame through a per-layer downscale surface. Layers decimate
//! the source frame rate independently, schedule their own keyframes, and
//! shed frames when their codec falls behind. A failing layer goes dead on
//! its own; the others keep encoding.

use chorus_protocol::config::{SimulcastLayer, active_layers};
use tracing::{debug, error, info, warn};

/// Frames queued inside a codec beyond which the layer sheds input.
pub const MAX_ENCODER_QUEUE: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum VideoCodecError {
    #[error("codec init failed: {0}")]
    Init(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// A raw captured frame in planar I420.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

impl VideoFrame {
    pub fn plane_len(width: u32, height: u32) -> usize {
        (width as usize * height as usize * 3) / 2
    }
}

/// One compressed packet out of a layer codec.
#[derive(Debug, Clone)]
pub struct CodecPacket {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// An encoded chunk leaving the pipeline, tagged with its layer.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub layer: u8,
    pub keyframe: bool,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

/// One codec instance, fixed at a layer's resolution and bitrate.
pub trait LayerCodec: Send {
    /// Encode one I420 frame at the layer's resolution.
    fn encode_i420(
        &mut self,
        data: &[u8],
        timestamp_ms: u64,
        force_keyframe: bool,
    ) -> Result<Vec<CodecPacket>, VideoCodecError>;

    /// Frames buffered inside the codec awaiting output.
    fn queue_depth(&self) -> usize {
        0
    }
}

/// Builds a codec for a layer. Installed by the embedder (real VP9 behind
/// the `vpx` feature, stubs in tests).
pub type LayerCodecFactory =
    Box<dyn Fn(&SimulcastLayer) -> Result<Box<dyn LayerCodec>, VideoCodecError> + Send>;

/// Reusable downscale surface: nearest-neighbor I420 resample into a buffer
/// sized for the layer, skipping the copy when the source already matches.
struct Downscaler {
    width: u32,
    height: u32,
    buf: Vec<u8>,
}

impl Downscaler {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buf: vec![0u8; VideoFrame::plane_len(width, height)],
        }
    }

    fn scale<'a>(&'a mut self, frame: &'a VideoFrame) -> &'a [u8] {
        if frame.width == self.width && frame.height == self.height {
            return &frame.data;
        }
        scale_plane(
            &frame.data,
            frame.width as usize,
            frame.height as usize,
            &mut self.buf,
            self.width as usize,
            self.height as usize,
        );
        let (sw, sh) = (frame.width as usize, frame.height as usize);
        let (dw, dh) = (self.width as usize, self.height as usize);
        let src_u = &frame.data[sw * sh..];
        let dst_y_len = dw * dh;
        scale_plane(src_u, sw / 2, sh / 2, &mut self.buf[dst_y_len..], dw / 2, dh / 2);
        let src_v = &frame.data[sw * sh + (sw / 2) * (sh / 2)..];
        scale_plane(
            src_v,
            sw / 2,
            sh / 2,
            &mut self.buf[dst_y_len + (dw / 2) * (dh / 2)..],
            dw / 2,
            dh / 2,
        );
        &self.buf
    }
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, dst: &mut [u8], dw: usize, dh: usize) {
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            dst[y * dw + x] = src[sy * sw + sx];
        }
    }
}

struct LayerState {
    config: SimulcastLayer,
    /// None once the layer has died on a codec error.
    codec: Option<Box<dyn LayerCodec>>,
    surface: Downscaler,
    frame_divisor: u64,
    frame_counter: u64,
    keyframe_requested: bool,
    last_keyframe_ms: Option<u64>,
    first_frame: bool,
    shed_count: u64,
}

pub struct SimulcastEncoder {
    layers: Vec<LayerState>,
    keyframe_interval_ms: u64,
}

impl SimulcastEncoder {
    /// Build encoders for every layer active at the source resolution.
    pub fn new(
        source_width: u32,
        source_height: u32,
        source_frame_rate: u32,
        keyframe_interval_ms: u64,
        factory: &LayerCodecFactory,
    ) -> Self {
        let layers = active_layers(source_width, source_height)
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let codec = match factory(layer) {
                    Ok(codec) => Some(codec),
                    Err(e) => {
                        error!(layer = index, "Layer encoder init failed: {e}");
                        None
                    }
                };
                let divisor =
                    ((source_frame_rate as f64 / layer.frame_rate as f64).round() as u64).max(1);
                LayerState {
                    config: *layer,
                    codec,
                    surface: Downscaler::new(layer.width, layer.height),
                    frame_divisor: divisor,
                    frame_counter: 0,
                    keyframe_requested: false,
                    last_keyframe_ms: None,
                    first_frame: true,
                    shed_count: 0,
                }
            })
            .collect::<Vec<_>>();
        info!(
            layers = layers.len(),
            source_width, source_height, "Simulcast encoder ready"
        );
        Self {
            layers,
            keyframe_interval_ms,
        }
    }

    /// Build a single-layer encoder at the source size (screen share).
    pub fn single_layer(
        width: u32,
        height: u32,
        frame_rate: u32,
        bitrate_kbps: u32,
        keyframe_interval_ms: u64,
        factory: &LayerCodecFactory,
    ) -> Self {
        let layer = SimulcastLayer { width, height, frame_rate, bitrate_kbps };
        let codec = match factory(&layer) {
            Ok(codec) => Some(codec),
            Err(e) => {
                error!("Screen encoder init failed: {e}");
                None
            }
        };
        Self {
            layers: vec![LayerState {
                config: layer,
                codec,
                surface: Downscaler::new(width, height),
                frame_divisor: 1,
                frame_counter: 0,
                keyframe_requested: false,
                last_keyframe_ms: None,
                first_frame: true,
                shed_count: 0,
            }],
            keyframe_interval_ms,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_config(&self, index: usize) -> Option<&SimulcastLayer> {
        self.layers.get(index).map(|l| &l.config)
    }

    /// Flag one layer (or all) to force a keyframe on its next encoded frame.
    pub fn request_keyframe(&mut self, layer: Option<usize>) {
        match layer {
            Some(index) => {
                if let Some(state) = self.layers.get_mut(index) {
                    state.keyframe_requested = true;
                }
            }
            None => {
                for state in &mut self.layers {
                    state.keyframe_requested = true;
                }
            }
        }
    }

    /// Feed one captured frame through every live layer.
    pub fn encode(&mut self, frame: &VideoFrame, now_ms: u64) -> Vec<EncodedChunk> {
        let mut chunks = Vec::new();
        for (index, state) in self.layers.iter_mut().enumerate() {
            state.frame_counter += 1;
            if state.frame_counter % state.frame_divisor != 0 {
                continue;
            }
            let Some(codec) = state.codec.as_mut() else {
                continue;
            };
            if codec.queue_depth() > MAX_ENCODER_QUEUE {
                state.shed_count += 1;
                if state.shed_count == 1 || state.shed_count % 100 == 0 {
                    debug!(layer = index, shed = state.shed_count, "Shedding frame, encoder behind");
                }
                continue;
            }

            let cadence_due = state
                .last_keyframe_ms
                .is_none_or(|last| now_ms.saturating_sub(last) >= self.keyframe_interval_ms);
            let force_key = state.keyframe_requested || state.first_frame || cadence_due;

            let scaled = state.surface.scale(frame);
            match codec.encode_i420(scaled, frame.timestamp_ms, force_key) {
                Ok(packets) => {
                    if force_key {
                        state.last_keyframe_ms = Some(now_ms);
                        state.keyframe_requested = false;
                    }
                    state.first_frame = false;
                    for packet in packets {
                        chunks.push(EncodedChunk {
                            layer: index as u8,
                            keyframe: packet.keyframe,
                            timestamp_ms: frame.timestamp_ms,
                            data: packet.data,
                        });
                    }
                }
                Err(e) => {
                    warn!(layer = index, "Layer encoder failed, marking dead: {e}");
                    state.codec = None;
                }
            }
        }
        chunks
    }

    /// Tear down every layer codec and surface.
    pub fn close(&mut self) {
        for state in &mut self.layers {
            state.codec = None;
        }
        self.layers.clear();
    }
}
