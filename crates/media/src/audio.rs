//! Opus encode/decode and capture-side level metering.

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};

pub const SAMPLE_RATE: u32 = 48_000;
/// 20 ms at 48 kHz mono.
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_MS: u64 = 20;
/// Header timestamps advance in 48 kHz ticks, one frame per packet.
pub const TICKS_PER_FRAME: u32 = FRAME_SAMPLES as u32;

/// Max encoded Opus frame size.
const MAX_PACKET: usize = 4000;

#[derive(Debug, thiserror::Error)]
pub enum AudioCodecError {
    #[error("opus: {0}")]
    Opus(#[from] audiopus::Error),
}

/// Opus encoder fixed at 48 kHz mono, low-delay voice settings.
pub struct AudioEncoder {
    inner: OpusEncoder,
    packet_buf: Vec<u8>,
}

impl AudioEncoder {
    pub fn new(bitrate: i32) -> Result<Self, AudioCodecError> {
        let mut inner = OpusEncoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)?;
        inner.set_bitrate(Bitrate::BitsPerSecond(bitrate))?;
        Ok(Self {
            inner,
            packet_buf: vec![0u8; MAX_PACKET],
        })
    }

    /// Encode one 20 ms PCM frame.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioCodecError> {
        let len = self.inner.encode(pcm, &mut self.packet_buf)?;
        Ok(self.packet_buf[..len].to_vec())
    }
}

/// Opus decoder fixed at 48 kHz mono.
pub struct AudioDecoder {
    inner: OpusDecoder,
}

impl AudioDecoder {
    pub fn new() -> Result<Self, AudioCodecError> {
        Ok(Self {
            inner: OpusDecoder::new(SampleRate::Hz48000, Channels::Mono)?,
        })
    }

    /// Decode one packet to PCM.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, AudioCodecError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let len = self.inner.decode(Some(packet), &mut pcm, false)?;
        pcm.truncate(len);
        Ok(pcm)
    }

    /// Conceal one lost frame (the jitter buffer reported a hole).
    pub fn conceal(&mut self) -> Result<Vec<i16>, AudioCodecError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let packet: Option<&[u8]> = None;
        let len = self.inner.decode(packet, &mut pcm, false)?;
        pcm.truncate(len);
        Ok(pcm)
    }
}

/// Map a PCM frame to the wire audio-level scale: 0 loudest, 127 silent
/// (dBov-style, from RMS).
pub fn audio_level(pcm: &[i16]) -> u8 {
    if pcm.is_empty() {
        return 127;
    }
    let rms = (pcm
        .iter()
        .map(|&s| {
            let x = s as f64 / 32_768.0;
            x * x
        })
        .sum::<f64>()
        / pcm.len() as f64)
        .sqrt();
    if rms <= 1e-9 {
        return 127;
    }
    let db = 20.0 * rms.log10();
    (-db).clamp(0.0, 127.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_127() {
        assert_eq!(audio_level(&[0i16; FRAME_SAMPLES]), 127);
        assert_eq!(audio_level(&[]), 127);
    }

    #[test]
    fn full_scale_is_loudest() {
        let pcm: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN })
            .collect();
        assert_eq!(audio_level(&pcm), 0);
    }

    #[test]
    fn level_is_monotonic_in_amplitude() {
        let tone = |amp: f64| -> Vec<i16> {
            (0..FRAME_SAMPLES)
                .map(|i| {
                    let t = i as f64 / SAMPLE_RATE as f64;
                    (amp * (2.0 * std::f64::consts::PI * 440.0 * t).sin() * 32_000.0) as i16
                })
                .collect()
        };
        let loud = audio_level(&tone(1.0));
        let mid = audio_level(&tone(0.1));
        let quiet = audio_level(&tone(0.001));
        assert!(loud < mid, "{loud} !< {mid}");
        assert!(mid < quiet, "{mid} !< {quiet}");
    }

    #[test]
    fn opus_roundtrip_preserves_frame_length() {
        let mut encoder = AudioEncoder::new(96_000).unwrap();
        let mut decoder = AudioDecoder::new().unwrap();
        let pcm: Vec<i16> = (0..FRAME_SAMPLES)
            .map(|i| {
                let t = i as f64 / SAMPLE_RATE as f64;
                ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 8_000.0) as i16
            })
            .collect();
        let packet = encoder.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < 400, "voice frame unexpectedly large");
        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), FRAME_SAMPLES);
    }

    #[test]
    fn concealment_produces_a_full_frame() {
        let mut decoder = AudioDecoder::new().unwrap();
        let pcm = decoder.conceal().unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }
}
