//! Sender-key encryption for media payloads.
//!
//! Every participant encrypts its outbound payloads with its own symmetric
//! key, identified by a monotonically increasing epoch. Peers learn keys via
//! the control channel and keep the two most recent epochs per SSRC so that
//! packets straddling a rotation still decrypt. The serialized packet header
//! is authenticated as AAD; the nonce is derived deterministically from the
//! stream coordinates, so no nonce state crosses the wire.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use chorus_protocol::packet::TrackType;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Rotate the local key once a track's sequence counter reaches a multiple
/// of this, keeping nonces safely clear of the 2^16 sequence wrap.
pub const ROTATION_INTERVAL: u16 = 1 << 15;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no key held for ssrc {ssrc} epoch {epoch}")]
    UnknownKey { ssrc: u32, epoch: u32 },
    #[error("payload authentication failed")]
    AuthFailed,
    #[error("no local sender key generated")]
    NoLocalKey,
    #[error("encryption failed")]
    EncryptFailed,
}

struct KeyEntry {
    epoch: u32,
    bytes: [u8; KEY_LEN],
    cipher: Aes256Gcm,
}

impl KeyEntry {
    fn new(epoch: u32, bytes: [u8; KEY_LEN]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(&bytes).expect("32-byte AES-256 key");
        Self { epoch, bytes, cipher }
    }
}

/// How many epochs to retain per peer SSRC.
const PEER_EPOCHS_KEPT: usize = 2;

/// Single-writer store for the local sender key and all imported peer keys.
pub struct SenderKeyStore {
    local: Option<KeyEntry>,
    next_epoch: u32,
    peers: HashMap<u32, Vec<KeyEntry>>,
}

impl SenderKeyStore {
    pub fn new() -> Self {
        Self {
            local: None,
            next_epoch: 1,
            peers: HashMap::new(),
        }
    }

    /// Generate a fresh local key at a new epoch, overwriting any prior one.
    /// Returns the new epoch.
    pub fn generate_local(&mut self) -> u32 {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.local = Some(KeyEntry::new(epoch, bytes));
        epoch
    }

    pub fn local_epoch(&self) -> Option<u32> {
        self.local.as_ref().map(|k| k.epoch)
    }

    /// Export the current local key for the control channel.
    pub fn export_local(&self) -> Result<(u32, [u8; KEY_LEN]), CryptoError> {
        let local = self.local.as_ref().ok_or(CryptoError::NoLocalKey)?;
        Ok((local.epoch, local.bytes))
    }

    /// Import a peer's key, replacing any prior entry for the same epoch.
    /// Only the two most recent epochs per SSRC are retained.
    pub fn import_peer(&mut self, ssrc: u32, epoch: u32, key: [u8; KEY_LEN]) {
        let entries = self.peers.entry(ssrc).or_default();
        entries.retain(|e| e.epoch != epoch);
        entries.push(KeyEntry::new(epoch, key));
        entries.sort_by_key(|e| e.epoch);
        while entries.len() > PEER_EPOCHS_KEPT {
            entries.remove(0);
        }
    }

    /// Drop all keys held for a departed peer.
    pub fn remove_peer(&mut self, ssrc: u32) {
        self.peers.remove(&ssrc);
    }

    /// Encrypt a payload with the current local key.
    ///
    /// `aad` must be the serialized packet header that will precede the
    /// ciphertext on the wire.
    pub fn encrypt(
        &self,
        aad: &[u8],
        plaintext: &[u8],
        ssrc: u32,
        sequence: u16,
        track: TrackType,
        layer: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let local = self.local.as_ref().ok_or(CryptoError::NoLocalKey)?;
        let nonce = derive_nonce(&local.bytes, ssrc, sequence, local.epoch, track, layer);
        local
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptFailed)
    }

    /// Decrypt a peer payload. The (ssrc, epoch) pair selects the key; a
    /// failed tag check is `AuthFailed`.
    pub fn decrypt(
        &self,
        aad: &[u8],
        ciphertext: &[u8],
        ssrc: u32,
        epoch: u32,
        sequence: u16,
        track: TrackType,
        layer: u8,
    ) -> Result<Vec<u8>, CryptoError> {
        let entry = self
            .peers
            .get(&ssrc)
            .and_then(|entries| entries.iter().find(|e| e.epoch == epoch))
            .ok_or(CryptoError::UnknownKey { ssrc, epoch })?;
        let nonce = derive_nonce(&entry.bytes, ssrc, sequence, epoch, track, layer);
        entry
            .cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::AuthFailed)
    }
}

impl Default for SenderKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the 96-bit AEAD nonce from the stream coordinates.
///
/// HKDF-SHA256 keyed on the sender key over
/// `"nonce" || ssrc || sequence || epoch || track || layer`, truncated to
/// 12 bytes. Track and layer are included because audio and the simulcast
/// layers keep independent sequence counters on a shared SSRC; without them
/// two tracks at the same (sequence, epoch) would collide.
fn derive_nonce(
    key: &[u8; KEY_LEN],
    ssrc: u32,
    sequence: u16,
    epoch: u32,
    track: TrackType,
    layer: u8,
) -> [u8; NONCE_LEN] {
    let mut info = [0u8; 17];
    info[..5].copy_from_slice(b"nonce");
    info[5..9].copy_from_slice(&ssrc.to_be_bytes());
    info[9..11].copy_from_slice(&sequence.to_be_bytes());
    info[11..15].copy_from_slice(&epoch.to_be_bytes());
    info[15] = track as u8;
    info[16] = layer;

    let hk = Hkdf::<Sha256>::new(None, key);
    let mut nonce = [0u8; NONCE_LEN];
    hk.expand(&info, &mut nonce)
        .expect("12 bytes is within HKDF-SHA256 output limit");
    nonce
}

/// Whether a track's sequence counter has just crossed a rotation boundary.
pub fn rotation_due(sequence: u16) -> bool {
    sequence != 0 && sequence % ROTATION_INTERVAL == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_store() -> (SenderKeyStore, u32) {
        // A store that has imported its own local key under a test SSRC,
        // standing in for the remote side.
        let mut store = SenderKeyStore::new();
        let epoch = store.generate_local();
        let (_, key) = store.export_local().unwrap();
        store.import_peer(77, epoch, key);
        (store, epoch)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (store, epoch) = loopback_store();
        let aad = [0xAAu8; 20];
        let ct = store
            .encrypt(&aad, b"twenty ms of opus", 77, 3, TrackType::Audio, 0)
            .unwrap();
        assert_ne!(&ct[..], b"twenty ms of opus");
        let pt = store
            .decrypt(&aad, &ct, 77, epoch, 3, TrackType::Audio, 0)
            .unwrap();
        assert_eq!(pt, b"twenty ms of opus");
    }

    #[test]
    fn tampered_aad_fails_auth() {
        let (store, epoch) = loopback_store();
        let aad = [0x01u8; 20];
        let ct = store
            .encrypt(&aad, b"payload", 77, 0, TrackType::Audio, 0)
            .unwrap();
        for i in 0..aad.len() {
            let mut bad = aad;
            bad[i] ^= 0x80;
            match store.decrypt(&bad, &ct, 77, epoch, 0, TrackType::Audio, 0) {
                Err(CryptoError::AuthFailed) => {}
                other => panic!("byte {i}: expected AuthFailed, got {other:?}"),
            }
        }
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let (store, epoch) = loopback_store();
        let aad = [0u8; 20];
        let mut ct = store
            .encrypt(&aad, b"payload", 77, 0, TrackType::Audio, 0)
            .unwrap();
        ct[0] ^= 1;
        assert!(matches!(
            store.decrypt(&aad, &ct, 77, epoch, 0, TrackType::Audio, 0),
            Err(CryptoError::AuthFailed)
        ));
    }

    #[test]
    fn mismatched_sequence_fails_auth() {
        let (store, epoch) = loopback_store();
        let aad = [0u8; 20];
        let ct = store
            .encrypt(&aad, b"payload", 77, 5, TrackType::Audio, 0)
            .unwrap();
        assert!(matches!(
            store.decrypt(&aad, &ct, 77, epoch, 6, TrackType::Audio, 0),
            Err(CryptoError::AuthFailed)
        ));
    }

    #[test]
    fn unknown_ssrc_and_epoch() {
        let (store, epoch) = loopback_store();
        let aad = [0u8; 20];
        let ct = store
            .encrypt(&aad, b"payload", 77, 0, TrackType::Audio, 0)
            .unwrap();
        assert!(matches!(
            store.decrypt(&aad, &ct, 78, epoch, 0, TrackType::Audio, 0),
            Err(CryptoError::UnknownKey { ssrc: 78, .. })
        ));
        assert!(matches!(
            store.decrypt(&aad, &ct, 77, epoch + 1, 0, TrackType::Audio, 0),
            Err(CryptoError::UnknownKey { .. })
        ));
    }

    #[test]
    fn epochs_are_monotonic_from_one() {
        let mut store = SenderKeyStore::new();
        assert_eq!(store.generate_local(), 1);
        assert_eq!(store.generate_local(), 2);
        assert_eq!(store.generate_local(), 3);
        assert_eq!(store.local_epoch(), Some(3));
    }

    #[test]
    fn rotation_overwrites_local_key() {
        let mut store = SenderKeyStore::new();
        store.generate_local();
        let (e1, k1) = store.export_local().unwrap();
        store.generate_local();
        let (e2, k2) = store.export_local().unwrap();
        assert_eq!(e2, e1 + 1);
        assert_ne!(k1, k2);
    }

    #[test]
    fn peer_table_keeps_two_most_recent_epochs() {
        let mut store = SenderKeyStore::new();
        store.generate_local();
        let aad = [0u8; 20];

        let mut sender = SenderKeyStore::new();
        for _ in 0..3 {
            let epoch = sender.generate_local();
            let (_, key) = sender.export_local().unwrap();
            store.import_peer(9, epoch, key);
        }
        // Epoch 1 was evicted on the third import; 2 and 3 remain.
        assert!(matches!(
            store.decrypt(&aad, b"x", 9, 1, 0, TrackType::Audio, 0),
            Err(CryptoError::UnknownKey { .. })
        ));
        for epoch in [2u32, 3] {
            assert!(matches!(
                store.decrypt(&aad, b"x", 9, epoch, 0, TrackType::Audio, 0),
                Err(CryptoError::AuthFailed)
            ));
        }
    }

    #[test]
    fn reimport_same_epoch_replaces_entry() {
        let (mut store, epoch) = loopback_store();
        let aad = [0u8; 20];
        let ct = store
            .encrypt(&aad, b"payload", 77, 0, TrackType::Audio, 0)
            .unwrap();
        // Overwrite epoch with a different key: the old ciphertext no longer
        // authenticates, but the entry count stays at one per epoch.
        store.import_peer(77, epoch, [9u8; KEY_LEN]);
        assert!(matches!(
            store.decrypt(&aad, &ct, 77, epoch, 0, TrackType::Audio, 0),
            Err(CryptoError::AuthFailed)
        ));
    }

    #[test]
    fn nonces_unique_across_streams() {
        let key = [7u8; KEY_LEN];
        let mut seen = std::collections::HashSet::new();
        for seq in 0..200u16 {
            for epoch in 1..3u32 {
                for (track, layer) in [
                    (TrackType::Audio, 0u8),
                    (TrackType::Video, 0),
                    (TrackType::Video, 1),
                    (TrackType::Video, 2),
                ] {
                    let nonce = derive_nonce(&key, 42, seq, epoch, track, layer);
                    assert!(seen.insert(nonce), "nonce reuse at seq {seq} epoch {epoch}");
                }
            }
        }
    }

    #[test]
    fn nonce_is_deterministic() {
        let key = [1u8; KEY_LEN];
        assert_eq!(
            derive_nonce(&key, 1, 2, 3, TrackType::Video, 1),
            derive_nonce(&key, 1, 2, 3, TrackType::Video, 1)
        );
    }

    #[test]
    fn rotation_boundaries() {
        assert!(!rotation_due(0));
        assert!(!rotation_due(1));
        assert!(!rotation_due(32_767));
        assert!(rotation_due(32_768));
        assert!(!rotation_due(32_769));
        // 65_536 wraps to 0 in u16, which never triggers on its own; the
        // counter hits 32_768 again before wrapping.
        assert!(!rotation_due(65_535));
    }

    #[test]
    fn encrypt_without_local_key_is_an_error() {
        let store = SenderKeyStore::new();
        assert!(matches!(
            store.encrypt(&[0u8; 20], b"x", 1, 0, TrackType::Audio, 0),
            Err(CryptoError::NoLocalKey)
        ));
        assert!(store.export_local().is_err());
    }

    #[test]
    fn removed_peer_no_longer_decrypts() {
        let (mut store, epoch) = loopback_store();
        store.remove_peer(77);
        assert!(matches!(
            store.decrypt(&[0u8; 20], b"x", 77, epoch, 0, TrackType::Audio, 0),
            Err(CryptoError::UnknownKey { .. })
        ));
    }
}
