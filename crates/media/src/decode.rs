//! Per-sender video decode with keyframe-gated resynchronization, and the
//! latest-frame renderer.

use tracing::{debug, warn};

use crate::simulcast::VideoCodecError;

/// Chunks queued inside a decoder beyond which input is dropped.
pub const MAX_DECODER_QUEUE: usize = 10;

/// A decoded frame ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// One underlying codec decoder instance.
pub trait VideoDecoder: Send {
    fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedFrame>, VideoCodecError>;
    /// Discard internal reference state.
    fn reset(&mut self);
    fn queue_depth(&self) -> usize {
        0
    }
}

/// Builds a decoder per remote subscription.
pub type VideoDecoderFactory =
    Box<dyn Fn() -> Result<Box<dyn VideoDecoder>, VideoCodecError> + Send>;

/// Probe the VP9 uncompressed header: bit 0x04 of byte 0 clear means an
/// intra (key) frame. A transport-side keyframe flag, when available, takes
/// priority over this probe.
pub fn is_vp9_keyframe(data: &[u8]) -> bool {
    !data.is_empty() && data[0] & 0x04 == 0
}

/// Decode gate for one remote sender.
///
/// Starts out discarding everything until a keyframe arrives; any decoder
/// error returns it to that state so the stream resynchronizes on the next
/// keyframe rather than rendering garbage from a broken reference chain.
pub struct DecoderSession {
    decoder: Box<dyn VideoDecoder>,
    awaiting_key: bool,
    discarded: u64,
    dropped_overflow: u64,
}

impl DecoderSession {
    pub fn new(decoder: Box<dyn VideoDecoder>) -> Self {
        Self {
            decoder,
            awaiting_key: true,
            discarded: 0,
            dropped_overflow: 0,
        }
    }

    pub fn awaiting_key(&self) -> bool {
        self.awaiting_key
    }

    /// Back to the awaiting-key state (sender re-joined, layer switched).
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.awaiting_key = true;
    }

    /// Submit one chunk. `key_hint` is the transport-level keyframe flag if
    /// the caller has one; otherwise the bitstream probe decides.
    pub fn submit(&mut self, data: &[u8], key_hint: Option<bool>) -> Option<DecodedFrame> {
        if self.decoder.queue_depth() > MAX_DECODER_QUEUE {
            self.dropped_overflow += 1;
            return None;
        }
        let is_key = key_hint.unwrap_or_else(|| is_vp9_keyframe(data));
        if self.awaiting_key {
            if !is_key {
                self.discarded += 1;
                if self.discarded == 1 || self.discarded % 100 == 0 {
                    debug!(discarded = self.discarded, "Discarding delta frame while awaiting keyframe");
                }
                return None;
            }
            self.awaiting_key = false;
        }
        match self.decoder.decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Video decode error, resynchronizing on next keyframe: {e}");
                self.decoder.reset();
                self.awaiting_key = true;
                None
            }
        }
    }
}

/// Where decoded frames land. The UI owns the surface; the engine only
/// writes to it.
pub trait RenderTarget: Send {
    fn resize(&mut self, width: u32, height: u32);
    fn draw(&mut self, frame: &DecodedFrame);
}

/// Latest-frame renderer: holds at most one pending frame, superseding (and
/// freeing) the previous one, and draws on an explicit tick.
pub struct Renderer {
    target: Box<dyn RenderTarget>,
    pending: Option<DecodedFrame>,
    canvas_width: u32,
    canvas_height: u32,
    superseded: u64,
}

impl Renderer {
    pub fn new(target: Box<dyn RenderTarget>) -> Self {
        Self {
            target,
            pending: None,
            canvas_width: 0,
            canvas_height: 0,
            superseded: 0,
        }
    }

    /// Queue a frame for the next tick, superseding any pending one.
    pub fn submit(&mut self, frame: DecodedFrame) {
        if self.pending.replace(frame).is_some() {
            self.superseded += 1;
        }
    }

    /// Draw the pending frame, resizing the canvas on a dimension change
    /// (simulcast layer switch). The frame is released after the draw.
    pub fn tick(&mut self) {
        let Some(frame) = self.pending.take() else {
            return;
        };
        if frame.width != self.canvas_width || frame.height != self.canvas_height {
            self.target.resize(frame.width, frame.height);
            self.canvas_width = frame.width;
            self.canvas_height = frame.height;
        }
        self.target.draw(&frame);
    }

    /// Drop any pending frame (sender left).
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockDecoderState {
        decoded: Vec<Vec<u8>>,
        resets: usize,
        queue_depth: usize,
        fail_next: bool,
    }

    struct MockDecoder {
        state: Arc<Mutex<MockDecoderState>>,
    }

    impl VideoDecoder for MockDecoder {
        fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedFrame>, VideoCodecError> {
            let mut state = self.state.lock().unwrap();
            if state.fail_next {
                state.fail_next = false;
                return Err(VideoCodecError::Decode("mock".into()));
            }
            state.decoded.push(data.to_vec());
            Ok(Some(DecodedFrame {
                width: 320,
                height: 180,
                rgba: vec![0u8; 4],
            }))
        }

        fn reset(&mut self) {
            self.state.lock().unwrap().resets += 1;
        }

        fn queue_depth(&self) -> usize {
            self.state.lock().unwrap().queue_depth
        }
    }

    fn session() -> (DecoderSession, Arc<Mutex<MockDecoderState>>) {
        let state = Arc::new(Mutex::new(MockDecoderState::default()));
        let session = DecoderSession::new(Box::new(MockDecoder { state: Arc::clone(&state) }));
        (session, state)
    }

    const KEY: &[u8] = &[0x00, 1, 2];
    const DELTA: &[u8] = &[0x04, 1, 2];

    #[test]
    fn vp9_probe_reads_bit_two() {
        assert!(is_vp9_keyframe(&[0x00]));
        assert!(is_vp9_keyframe(&[0xFB]));
        assert!(!is_vp9_keyframe(&[0x04]));
        assert!(!is_vp9_keyframe(&[]));
    }

    #[test]
    fn deltas_discarded_until_keyframe() {
        let (mut session, state) = session();
        assert!(session.submit(DELTA, None).is_none());
        assert!(session.submit(DELTA, None).is_none());
        assert!(session.submit(KEY, None).is_some());
        assert!(session.submit(DELTA, None).is_some());
        // Exactly two chunks reached the decoder: the key and the following
        // delta.
        assert_eq!(state.lock().unwrap().decoded.len(), 2);
        assert!(!session.awaiting_key());
    }

    #[test]
    fn key_hint_overrides_bitstream_probe() {
        let (mut session, _) = session();
        // Payload looks like a delta, but the transport flag says keyframe.
        assert!(session.submit(DELTA, Some(true)).is_some());
    }

    #[test]
    fn decode_error_returns_to_awaiting_key() {
        let (mut session, state) = session();
        assert!(session.submit(KEY, None).is_some());
        state.lock().unwrap().fail_next = true;
        assert!(session.submit(DELTA, None).is_none());
        assert!(session.awaiting_key());
        assert_eq!(state.lock().unwrap().resets, 1);
        // Deltas are gated again until the next keyframe.
        assert!(session.submit(DELTA, None).is_none());
        assert!(session.submit(KEY, None).is_some());
    }

    #[test]
    fn explicit_reset_gates_deltas() {
        let (mut session, state) = session();
        session.submit(KEY, None);
        session.reset();
        assert!(session.awaiting_key());
        assert_eq!(state.lock().unwrap().resets, 1);
        assert!(session.submit(DELTA, None).is_none());
    }

    #[test]
    fn overflow_drops_instead_of_blocking() {
        let (mut session, state) = session();
        session.submit(KEY, None);
        state.lock().unwrap().queue_depth = MAX_DECODER_QUEUE + 1;
        assert!(session.submit(KEY, None).is_none());
        assert_eq!(state.lock().unwrap().decoded.len(), 1);
    }

    #[derive(Default)]
    struct MockTargetState {
        resizes: Vec<(u32, u32)>,
        draws: Vec<(u32, u32)>,
    }

    struct MockTarget {
        state: Arc<Mutex<MockTargetState>>,
    }

    impl RenderTarget for MockTarget {
        fn resize(&mut self, width: u32, height: u32) {
            self.state.lock().unwrap().resizes.push((width, height));
        }
        fn draw(&mut self, frame: &DecodedFrame) {
            self.state.lock().unwrap().draws.push((frame.width, frame.height));
        }
    }

    fn renderer() -> (Renderer, Arc<Mutex<MockTargetState>>) {
        let state = Arc::new(Mutex::new(MockTargetState::default()));
        let renderer = Renderer::new(Box::new(MockTarget { state: Arc::clone(&state) }));
        (renderer, state)
    }

    fn frame(w: u32, h: u32) -> DecodedFrame {
        DecodedFrame { width: w, height: h, rgba: vec![0; (w * h * 4) as usize] }
    }

    #[test]
    fn newest_frame_supersedes_pending() {
        let (mut renderer, state) = renderer();
        renderer.submit(frame(320, 180));
        renderer.submit(frame(640, 360));
        renderer.tick();
        let state = state.lock().unwrap();
        assert_eq!(state.draws, vec![(640, 360)]);
        assert_eq!(renderer.superseded, 1);
    }

    #[test]
    fn tick_without_pending_draws_nothing() {
        let (mut renderer, state) = renderer();
        renderer.tick();
        renderer.submit(frame(320, 180));
        renderer.tick();
        renderer.tick(); // released after the first draw
        assert_eq!(state.lock().unwrap().draws.len(), 1);
    }

    #[test]
    fn canvas_resizes_only_on_dimension_change() {
        let (mut renderer, state) = renderer();
        renderer.submit(frame(320, 180));
        renderer.tick();
        renderer.submit(frame(320, 180));
        renderer.tick();
        renderer.submit(frame(640, 360));
        renderer.tick();
        let state = state.lock().unwrap();
        assert_eq!(state.resizes, vec![(320, 180), (640, 360)]);
        assert_eq!(state.draws.len(), 3);
    }

    #[test]
    fn clear_drops_pending_frame() {
        let (mut renderer, state) = renderer();
        renderer.submit(frame(320, 180));
        renderer.clear();
        renderer.tick();
        assert!(state.lock().unwrap().draws.is_empty());
    }
}
