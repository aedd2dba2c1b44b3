//! Session key schedule.
//!
//! The hybrid shared secret is fed through HKDF-SHA256 with the handshake
//! transcript hash as salt, yielding two AEAD keys, two direction salts,
//! and a resumption secret:
//!
//! ```text
//! okm = HKDF-SHA256(
//!     salt = transcript_hash,
//!     ikm  = kyber_ss || x25519_ss [|| previous_resumption_secret],
//!     info = "pqmesh v1 session",
//! )
//! initiator_key (32) || responder_key (32) ||
//! initiator_salt (4) || responder_salt (4) || resumption_secret (32)
//! ```
//!
//! On rekey the previous resumption secret is appended to the input key
//! material, binding the new epoch to the old one.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::constants::{
    AEAD_KEY_SIZE, DIRECTION_SALT_SIZE, RESUMPTION_SECRET_SIZE, TRANSCRIPT_HASH_SIZE,
};
use crate::core::CryptoError;
use crate::crypto::aead::SessionKey;
use crate::crypto::kem::HybridSecret;

/// HKDF info label for the session key schedule.
const SESSION_INFO: &[u8] = b"pqmesh v1 session";

/// Total expanded key material size.
const OKM_SIZE: usize = 2 * AEAD_KEY_SIZE + 2 * DIRECTION_SALT_SIZE + RESUMPTION_SECRET_SIZE;

/// Handshake role. Decides which derived key and salt each side sends
/// with; the two peers' assignments are mirror images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The side that sent HELLO.
    Initiator,
    /// The side that answered with CHALLENGE.
    Responder,
}

impl Role {
    /// The opposite role.
    pub fn other(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Key material derived from one handshake.
pub struct SessionKeys {
    initiator_key: SessionKey,
    responder_key: SessionKey,
    initiator_salt: [u8; DIRECTION_SALT_SIZE],
    responder_salt: [u8; DIRECTION_SALT_SIZE],
    /// Mixed into the next rekey derivation.
    pub resumption_secret: [u8; RESUMPTION_SECRET_SIZE],
}

impl SessionKeys {
    /// Run the key schedule.
    ///
    /// `previous_resumption` is `None` on the initial handshake and the
    /// prior epoch's resumption secret on a rekey.
    pub fn derive(
        secret: &HybridSecret,
        transcript_hash: &[u8; TRANSCRIPT_HASH_SIZE],
        previous_resumption: Option<&[u8; RESUMPTION_SECRET_SIZE]>,
    ) -> Result<Self, CryptoError> {
        let mut ikm = Vec::with_capacity(64 + RESUMPTION_SECRET_SIZE);
        ikm.extend_from_slice(secret.as_bytes());
        if let Some(resumption) = previous_resumption {
            ikm.extend_from_slice(resumption);
        }

        let hk = Hkdf::<Sha256>::new(Some(transcript_hash), &ikm);
        let mut okm = [0u8; OKM_SIZE];
        hk.expand(SESSION_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;
        ikm.zeroize();

        let mut initiator_key = [0u8; AEAD_KEY_SIZE];
        let mut responder_key = [0u8; AEAD_KEY_SIZE];
        initiator_key.copy_from_slice(&okm[..32]);
        responder_key.copy_from_slice(&okm[32..64]);

        let mut initiator_salt = [0u8; DIRECTION_SALT_SIZE];
        let mut responder_salt = [0u8; DIRECTION_SALT_SIZE];
        initiator_salt.copy_from_slice(&okm[64..68]);
        responder_salt.copy_from_slice(&okm[68..72]);

        let mut resumption_secret = [0u8; RESUMPTION_SECRET_SIZE];
        resumption_secret.copy_from_slice(&okm[72..]);
        okm.zeroize();

        Ok(Self {
            initiator_key: SessionKey::from_bytes(initiator_key),
            responder_key: SessionKey::from_bytes(responder_key),
            initiator_salt,
            responder_salt,
            resumption_secret,
        })
    }

    /// The key this role encrypts with.
    pub fn send_key(&self, role: Role) -> &SessionKey {
        match role {
            Role::Initiator => &self.initiator_key,
            Role::Responder => &self.responder_key,
        }
    }

    /// The key this role decrypts with.
    pub fn recv_key(&self, role: Role) -> &SessionKey {
        self.send_key(role.other())
    }

    /// The nonce salt this role encrypts with.
    pub fn send_salt(&self, role: Role) -> [u8; DIRECTION_SALT_SIZE] {
        match role {
            Role::Initiator => self.initiator_salt,
            Role::Responder => self.responder_salt,
        }
    }

    /// The nonce salt this role decrypts with.
    pub fn recv_salt(&self, role: Role) -> [u8; DIRECTION_SALT_SIZE] {
        self.send_salt(role.other())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kem::{encapsulate, HybridKemKeypair};

    fn shared_secret() -> (HybridSecret, HybridSecret) {
        let keypair = HybridKemKeypair::generate();
        let (ciphertext, responder) = encapsulate(&keypair.public());
        (keypair.decapsulate(&ciphertext), responder)
    }

    #[test]
    fn test_both_sides_derive_identical_material() {
        let (initiator_secret, responder_secret) = shared_secret();
        let transcript = [0x42u8; TRANSCRIPT_HASH_SIZE];

        let a = SessionKeys::derive(&initiator_secret, &transcript, None).unwrap();
        let b = SessionKeys::derive(&responder_secret, &transcript, None).unwrap();

        assert_eq!(
            a.send_key(Role::Initiator).as_bytes(),
            b.recv_key(Role::Responder).as_bytes()
        );
        assert_eq!(
            a.recv_key(Role::Initiator).as_bytes(),
            b.send_key(Role::Responder).as_bytes()
        );
        assert_eq!(a.send_salt(Role::Initiator), b.recv_salt(Role::Responder));
        assert_eq!(a.resumption_secret, b.resumption_secret);
    }

    #[test]
    fn test_directions_use_distinct_keys_and_salts() {
        let (secret, _) = shared_secret();
        let transcript = [0x42u8; TRANSCRIPT_HASH_SIZE];
        let keys = SessionKeys::derive(&secret, &transcript, None).unwrap();

        assert_ne!(
            keys.send_key(Role::Initiator).as_bytes(),
            keys.send_key(Role::Responder).as_bytes()
        );
        assert_ne!(
            keys.send_salt(Role::Initiator),
            keys.send_salt(Role::Responder)
        );
    }

    #[test]
    fn test_transcript_salt_changes_output() {
        let (secret, _) = shared_secret();
        let a = SessionKeys::derive(&secret, &[0x01; 32], None).unwrap();
        let b = SessionKeys::derive(&secret, &[0x02; 32], None).unwrap();
        assert_ne!(
            a.send_key(Role::Initiator).as_bytes(),
            b.send_key(Role::Initiator).as_bytes()
        );
    }

    #[test]
    fn test_resumption_secret_changes_rekey_output() {
        let (secret, _) = shared_secret();
        let transcript = [0x42u8; TRANSCRIPT_HASH_SIZE];
        let initial = SessionKeys::derive(&secret, &transcript, None).unwrap();
        let rekeyed =
            SessionKeys::derive(&secret, &transcript, Some(&initial.resumption_secret)).unwrap();
        assert_ne!(
            initial.send_key(Role::Initiator).as_bytes(),
            rekeyed.send_key(Role::Initiator).as_bytes()
        );
    }
}
