//! Binary media packet header for the datagram transport.
//!
//! 20 bytes, big-endian:
//! ```text
//! [0]      version: 1
//! [1]      track type: 0 = audio, 1 = video
//! [2]      simulcast layer: 0..2 for video, 0 for audio
//! [3..5]   sequence (u16) — per (ssrc, track, layer), wraps at 2^16
//! [5..9]   timestamp (u32) — sender millisecond clock
//! [9..13]  ssrc (u32) — sender-local random identifier
//! [13]     audio level: 0 = loudest, 127 = silent (127 for video)
//! [14..18] key epoch (u32) — epoch of the AEAD key for the payload
//! [18..20] payload length (u16)
//! [20..]   AEAD ciphertext (`payload_length` bytes)
//! ```
//!
//! The first 20 bytes of every packet double as the AAD for the payload
//! cipher, so re-serializing a parsed header must be byte-identical to the
//! bytes it was parsed from.

pub const HEADER_SIZE: usize = 20;
pub const PROTOCOL_VERSION: u8 = 1;

/// Audio level value carried on video packets (and silent audio).
pub const AUDIO_LEVEL_SILENT: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrackType {
    Audio = 0,
    Video = 1,
}

impl TrackType {
    pub fn from_byte(b: u8) -> Result<Self, PacketError> {
        match b {
            0 => Ok(TrackType::Audio),
            1 => Ok(TrackType::Video),
            other => Err(PacketError::BadTrackType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaHeader {
    pub track_type: TrackType,
    pub simulcast_layer: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub audio_level: u8,
    pub key_epoch: u32,
    pub payload_length: u16,
}

impl MediaHeader {
    /// Header for an audio packet.
    pub fn audio(ssrc: u32, sequence: u16, timestamp: u32, audio_level: u8, key_epoch: u32) -> Self {
        Self {
            track_type: TrackType::Audio,
            simulcast_layer: 0,
            sequence,
            timestamp,
            ssrc,
            audio_level,
            key_epoch,
            payload_length: 0,
        }
    }

    /// Header for a video packet on the given simulcast layer.
    pub fn video(ssrc: u32, layer: u8, sequence: u16, timestamp: u32, key_epoch: u32) -> Self {
        Self {
            track_type: TrackType::Video,
            simulcast_layer: layer,
            sequence,
            timestamp,
            ssrc,
            audio_level: AUDIO_LEVEL_SILENT,
            key_epoch,
            payload_length: 0,
        }
    }

    /// Serialize into a 20-byte big-endian buffer.
    pub fn serialize(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.track_type as u8;
        buf[2] = self.simulcast_layer;
        buf[3..5].copy_from_slice(&self.sequence.to_be_bytes());
        buf[5..9].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[9..13].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[13] = self.audio_level;
        buf[14..18].copy_from_slice(&self.key_epoch.to_be_bytes());
        buf[18..20].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.serialize(&mut buf);
        buf
    }

    /// Deserialize a header from the first 20 bytes of a packet.
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::TooShort(buf.len()));
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(PacketError::BadVersion(buf[0]));
        }
        Ok(Self {
            track_type: TrackType::from_byte(buf[1])?,
            simulcast_layer: buf[2],
            sequence: u16::from_be_bytes([buf[3], buf[4]]),
            timestamp: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
            ssrc: u32::from_be_bytes([buf[9], buf[10], buf[11], buf[12]]),
            audio_level: buf[13],
            key_epoch: u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
            payload_length: u16::from_be_bytes([buf[18], buf[19]]),
        })
    }
}

/// Serialize header + payload into one datagram, stamping `payload_length`.
pub fn encode_packet(header: &MediaHeader, payload: &[u8]) -> Vec<u8> {
    let mut header = *header;
    header.payload_length = payload.len() as u16;
    let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
    let mut header_buf = [0u8; HEADER_SIZE];
    header.serialize(&mut header_buf);
    buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    buf[HEADER_SIZE..].copy_from_slice(payload);
    buf
}

/// Parse a datagram into (header, payload).
///
/// The payload slice is exactly `payload_length` bytes; a declared length
/// larger than the bytes present is a malformed packet.
pub fn parse_packet(buf: &[u8]) -> Result<(MediaHeader, &[u8]), PacketError> {
    let header = MediaHeader::parse(buf)?;
    let available = buf.len() - HEADER_SIZE;
    let declared = header.payload_length as usize;
    if declared > available {
        return Err(PacketError::PayloadLength { declared, available });
    }
    Ok((header, &buf[HEADER_SIZE..HEADER_SIZE + declared]))
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes (need at least {HEADER_SIZE})")]
    TooShort(usize),
    #[error("unsupported protocol version: {0} (expected {PROTOCOL_VERSION})")]
    BadVersion(u8),
    #[error("unknown track type: {0}")]
    BadTrackType(u8),
    #[error("declared payload length {declared} exceeds {available} available bytes")]
    PayloadLength { declared: usize, available: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> MediaHeader {
        MediaHeader {
            track_type: TrackType::Video,
            simulcast_layer: 2,
            sequence: 0xBEEF,
            timestamp: 123_456_789,
            ssrc: 0xDEAD_CAFE,
            audio_level: AUDIO_LEVEL_SILENT,
            key_epoch: 7,
            payload_length: 1200,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let buf = header.to_bytes();
        let parsed = MediaHeader::parse(&buf).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn reserialized_header_is_byte_identical() {
        // The parsed header re-serialized must match the original bytes,
        // since those bytes are the AAD for the payload cipher.
        let buf = sample_header().to_bytes();
        let parsed = MediaHeader::parse(&buf).unwrap();
        assert_eq!(parsed.to_bytes(), buf);
    }

    #[test]
    fn packet_roundtrip() {
        let payload = vec![0xAB; 57];
        let header = MediaHeader::audio(42, 9, 180, 30, 1);
        let packet = encode_packet(&header, &payload);
        assert_eq!(packet.len(), HEADER_SIZE + 57);

        let (parsed, parsed_payload) = parse_packet(&packet).unwrap();
        assert_eq!(parsed.payload_length, 57);
        assert_eq!(parsed.ssrc, 42);
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.audio_level, 30);
        assert_eq!(parsed_payload, &payload[..]);
    }

    #[test]
    fn encode_stamps_payload_length() {
        // Whatever the caller left in payload_length is overwritten.
        let mut header = sample_header();
        header.payload_length = 9999;
        let packet = encode_packet(&header, &[1, 2, 3]);
        let (parsed, payload) = parse_packet(&packet).unwrap();
        assert_eq!(parsed.payload_length, 3);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn parse_too_short() {
        let buf = [0u8; HEADER_SIZE - 1];
        match MediaHeader::parse(&buf) {
            Err(PacketError::TooShort(n)) => assert_eq!(n, HEADER_SIZE - 1),
            other => panic!("expected TooShort, got {other:?}"),
        }
    }

    #[test]
    fn parse_bad_version() {
        let mut buf = sample_header().to_bytes();
        buf[0] = 2;
        match MediaHeader::parse(&buf) {
            Err(PacketError::BadVersion(2)) => {}
            other => panic!("expected BadVersion(2), got {other:?}"),
        }
    }

    #[test]
    fn parse_bad_track_type() {
        let mut buf = sample_header().to_bytes();
        buf[1] = 9;
        match MediaHeader::parse(&buf) {
            Err(PacketError::BadTrackType(9)) => {}
            other => panic!("expected BadTrackType(9), got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let header = MediaHeader::audio(1, 0, 0, 0, 1);
        let mut packet = encode_packet(&header, &[0u8; 100]);
        packet.truncate(HEADER_SIZE + 40);
        match parse_packet(&packet) {
            Err(PacketError::PayloadLength {
                declared: 100,
                available: 40,
            }) => {}
            other => panic!("expected PayloadLength, got {other:?}"),
        }
    }

    #[test]
    fn video_header_carries_silent_level() {
        let header = MediaHeader::video(1, 1, 0, 0, 1);
        assert_eq!(header.audio_level, AUDIO_LEVEL_SILENT);
    }

    #[test]
    fn sequence_wrap_values_survive() {
        for seq in [0u16, 1, u16::MAX - 1, u16::MAX] {
            let header = MediaHeader::audio(5, seq, 0, 127, 1);
            let parsed = MediaHeader::parse(&header.to_bytes()).unwrap();
            assert_eq!(parsed.sequence, seq);
        }
    }

    #[test]
    fn header_size_is_20() {
        assert_eq!(HEADER_SIZE, 20);
    }
}
