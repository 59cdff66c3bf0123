//! VP9 layer codec backed by libvpx (`vpx` feature).

use chorus_protocol::config::SimulcastLayer;
use tracing::debug;
use vpx_encode::{Config, Encoder, VideoCodecId};

use crate::simulcast::{CodecPacket, LayerCodec, LayerCodecFactory, VideoCodecError};

/// One libvpx VP9 encoder fixed at a layer's resolution.
///
/// libvpx schedules keyframes itself and the wrapper exposes no force flag,
/// so an on-demand keyframe is produced by rebuilding the encoder: the first
/// frame out of a fresh context is always intra.
pub struct Vp9LayerEncoder {
    encoder: Option<Encoder>,
    width: u32,
    height: u32,
    bitrate_kbps: u32,
    encoded_any: bool,
}

impl Vp9LayerEncoder {
    pub fn new(layer: &SimulcastLayer) -> Result<Self, VideoCodecError> {
        let encoder = build_encoder(layer.width, layer.height, layer.bitrate_kbps)?;
        Ok(Self {
            encoder: Some(encoder),
            width: layer.width,
            height: layer.height,
            bitrate_kbps: layer.bitrate_kbps,
            encoded_any: false,
        })
    }
}

fn build_encoder(width: u32, height: u32, bitrate_kbps: u32) -> Result<Encoder, VideoCodecError> {
    Encoder::new(Config {
        width,
        height,
        timebase: [1, 1000],
        bitrate: bitrate_kbps,
        codec: VideoCodecId::VP9,
    })
    .map_err(|e| VideoCodecError::Init(format!("{e:?}")))
}

impl LayerCodec for Vp9LayerEncoder {
    fn encode_i420(
        &mut self,
        data: &[u8],
        timestamp_ms: u64,
        force_keyframe: bool,
    ) -> Result<Vec<CodecPacket>, VideoCodecError> {
        if force_keyframe && self.encoded_any {
            debug!(width = self.width, height = self.height, "Rebuilding VP9 encoder for keyframe");
            self.encoder = Some(build_encoder(self.width, self.height, self.bitrate_kbps)?);
            self.encoded_any = false;
        }
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| VideoCodecError::Encode("encoder gone".into()))?;
        let packets = encoder
            .encode(timestamp_ms as i64, data)
            .map_err(|e| VideoCodecError::Encode(format!("{e:?}")))?;
        self.encoded_any = true;
        Ok(packets
            .into_iter()
            .map(|frame| CodecPacket { data: frame.data.to_vec(), keyframe: frame.key })
            .collect())
    }
}

/// Factory handed to the engine when the `vpx` feature is enabled.
pub fn vp9_factory() -> LayerCodecFactory {
    Box::new(|layer| Ok(Box::new(Vp9LayerEncoder::new(layer)?) as Box<dyn LayerCodec>))
}
