//! Per-direction AEAD channels.
//!
//! Each established session holds two channels with distinct keys and
//! sequence spaces: one the TX pump seals with, one the RX pump opens
//! with. The 96-bit nonce is `direction_salt (4) || sequence (8, BE)`;
//! the frame header travels as associated data. Nothing is shared between
//! the directions, so neither pump ever contends with the other.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::core::constants::{
    AEAD_KEY_SIZE, AEAD_NONCE_SIZE, AEAD_TAG_SIZE, DIRECTION_SALT_SIZE,
};
use crate::core::CryptoError;
use crate::crypto::replay::ReplayWindow;

/// A 256-bit AEAD session key, zeroized on drop.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; AEAD_KEY_SIZE],
}

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; AEAD_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.key
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Build the 96-bit nonce for a direction and sequence number.
fn build_nonce(salt: &[u8; DIRECTION_SALT_SIZE], sequence: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[..DIRECTION_SALT_SIZE].copy_from_slice(salt);
    nonce[DIRECTION_SALT_SIZE..].copy_from_slice(&sequence.to_be_bytes());
    nonce
}

/// Outbound half of a session: owned by exactly one TX pump.
pub struct TxChannel {
    cipher: ChaCha20Poly1305,
    salt: [u8; DIRECTION_SALT_SIZE],
    sequence: AtomicU64,
}

impl TxChannel {
    /// Create the sealing channel for one direction.
    pub fn new(key: &SessionKey, salt: [u8; DIRECTION_SALT_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            salt,
            sequence: AtomicU64::new(0),
        }
    }

    /// Reserve the next sequence number.
    ///
    /// Sequence numbers strictly increase and never wrap; exhausting the
    /// space forces a rekey.
    pub fn next_sequence(&self) -> Result<u64, CryptoError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        if sequence == u64::MAX {
            self.sequence.store(u64::MAX, Ordering::Relaxed);
            return Err(CryptoError::CounterExhausted);
        }
        Ok(sequence)
    }

    /// Encrypt `buf` in place under the given sequence and associated
    /// data, returning the detached tag to append.
    pub fn seal_detached(
        &self,
        sequence: u64,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<[u8; AEAD_TAG_SIZE], CryptoError> {
        let nonce = build_nonce(&self.salt, sequence);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, buf)
            .map_err(|_| CryptoError::EncryptFail)?;
        Ok(tag.into())
    }

    /// Allocating seal for control-sized payloads and tests.
    pub fn seal(&self, sequence: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(&self.salt, sequence);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFail)
    }
}

/// Inbound half of a session: owned by the RX pumps, replay-guarded.
pub struct RxChannel {
    cipher: ChaCha20Poly1305,
    salt: [u8; DIRECTION_SALT_SIZE],
    window: Mutex<ReplayWindow>,
}

impl RxChannel {
    /// Create the opening channel for one direction.
    pub fn new(key: &SessionKey, salt: [u8; DIRECTION_SALT_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
            salt,
            window: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Decrypt `buf` in place.
    ///
    /// The replay window is consulted before the (comparatively expensive)
    /// tag check and committed only after the tag verified, so forged
    /// frames mutate no state.
    pub fn open_detached(
        &self,
        sequence: u64,
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if tag.len() != AEAD_TAG_SIZE {
            return Err(CryptoError::AuthFail);
        }
        self.window.lock().check(sequence)?;

        let nonce = build_nonce(&self.salt, sequence);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                aad,
                buf,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::AuthFail)?;

        self.window.lock().commit(sequence)
    }

    /// Allocating open: `ciphertext` carries the trailing tag.
    pub fn open(
        &self,
        sequence: u64,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(CryptoError::AuthFail);
        }
        let split = ciphertext.len() - AEAD_TAG_SIZE;
        let mut buf = ciphertext[..split].to_vec();
        self.open_detached(sequence, aad, &mut buf, &ciphertext[split..])?;
        Ok(buf)
    }

    /// Highest sequence accepted so far, if any.
    pub fn highest_accepted(&self) -> Option<u64> {
        self.window.lock().highest()
    }
}

/// Build both halves for one direction from derived key material.
pub fn channel_pair(
    send_key: &SessionKey,
    send_salt: [u8; DIRECTION_SALT_SIZE],
    recv_key: &SessionKey,
    recv_salt: [u8; DIRECTION_SALT_SIZE],
) -> (TxChannel, RxChannel) {
    (
        TxChannel::new(send_key, send_salt),
        RxChannel::new(recv_key, recv_salt),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (TxChannel, RxChannel) {
        let key = SessionKey::from_bytes([0x42; AEAD_KEY_SIZE]);
        let salt = [0x01, 0x02, 0x03, 0x04];
        (TxChannel::new(&key, salt), RxChannel::new(&key, salt))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (tx, rx) = pair();
        let aad = b"frame header bytes";

        for payload in [&b""[..], &[0x00][..], &[0xAB; 64][..], &[0x77; 1500][..]] {
            let sequence = tx.next_sequence().unwrap();
            let ciphertext = tx.seal(sequence, aad, payload).unwrap();
            assert_eq!(ciphertext.len(), payload.len() + AEAD_TAG_SIZE);
            let plaintext = rx.open(sequence, aad, &ciphertext).unwrap();
            assert_eq!(plaintext, payload);
        }
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let (tx, _) = pair();
        let a = tx.next_sequence().unwrap();
        let b = tx.next_sequence().unwrap();
        let c = tx.next_sequence().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_nonces_differ_per_sequence() {
        let salt = [0xAA; DIRECTION_SALT_SIZE];
        assert_ne!(build_nonce(&salt, 1), build_nonce(&salt, 2));
        assert_ne!(
            build_nonce(&[0x01; 4], 7),
            build_nonce(&[0x02; 4], 7)
        );
    }

    #[test]
    fn test_replay_rejected_without_state_change() {
        let (tx, rx) = pair();
        let aad = b"hdr";
        let sequence = tx.next_sequence().unwrap();
        let ciphertext = tx.seal(sequence, aad, b"payload").unwrap();

        assert!(rx.open(sequence, aad, &ciphertext).is_ok());
        assert_eq!(
            rx.open(sequence, aad, &ciphertext),
            Err(CryptoError::Replay)
        );
        assert_eq!(rx.highest_accepted(), Some(sequence));
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let (tx, rx) = pair();
        let aad = b"hdr";
        let sequence = tx.next_sequence().unwrap();
        let ciphertext = tx.seal(sequence, aad, b"payload").unwrap();

        for bit in 0..8 {
            let mut tampered = ciphertext.clone();
            tampered[0] ^= 1 << bit;
            assert_eq!(
                rx.open(sequence, aad, &tampered),
                Err(CryptoError::AuthFail)
            );
        }
        // Tampered tag too.
        let mut tampered = ciphertext.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x80;
        assert_eq!(rx.open(sequence, aad, &tampered), Err(CryptoError::AuthFail));

        // A forged frame must not advance the window.
        assert_eq!(rx.highest_accepted(), None);
        assert!(rx.open(sequence, aad, &ciphertext).is_ok());
    }

    #[test]
    fn test_tampered_aad_fails_auth() {
        let (tx, rx) = pair();
        let sequence = tx.next_sequence().unwrap();
        let ciphertext = tx.seal(sequence, b"header-a", b"payload").unwrap();
        assert_eq!(
            rx.open(sequence, b"header-b", &ciphertext),
            Err(CryptoError::AuthFail)
        );
    }

    #[test]
    fn test_wrong_direction_key_fails() {
        let key_a = SessionKey::from_bytes([0x01; AEAD_KEY_SIZE]);
        let key_b = SessionKey::from_bytes([0x02; AEAD_KEY_SIZE]);
        let salt = [0x00; DIRECTION_SALT_SIZE];
        let tx = TxChannel::new(&key_a, salt);
        let rx = RxChannel::new(&key_b, salt);

        let ciphertext = tx.seal(0, b"", b"payload").unwrap();
        assert_eq!(rx.open(0, b"", &ciphertext), Err(CryptoError::AuthFail));
    }

    #[test]
    fn test_detached_roundtrip_in_place() {
        let (tx, rx) = pair();
        let aad = [0x10; 27];
        let mut buf = vec![0xCD; 300];
        let original = buf.clone();

        let sequence = tx.next_sequence().unwrap();
        let tag = tx.seal_detached(sequence, &aad, &mut buf).unwrap();
        assert_ne!(buf, original);

        rx.open_detached(sequence, &aad, &mut buf, &tag).unwrap();
        assert_eq!(buf, original);
    }

}
