//! Ephemeral hybrid key encapsulation.
//!
//! One Kyber768 + X25519 keypair is generated per handshake and discarded
//! after key derivation. The initiator sends both public halves in HELLO;
//! the responder encapsulates against the Kyber key and contributes a
//! fresh X25519 public in CHALLENGE. The resulting shared secret is the
//! concatenation lattice || classical, so an attacker must break both.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::HandshakeError;

/// Combined shared secret: Kyber768 output followed by the X25519 output.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HybridSecret([u8; 64]);

impl HybridSecret {
    /// Raw secret bytes, lattice half first.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

/// The public half of an ephemeral hybrid KEM keypair.
#[derive(Clone)]
pub struct HybridKemPublic {
    kyber: kyber768::PublicKey,
    x25519: [u8; 32],
}

impl HybridKemPublic {
    /// Serialize: `kyber_len (u16 BE) || kyber_pk || x25519_pk (32)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let kyber = self.kyber.as_bytes();
        let mut out = Vec::with_capacity(2 + kyber.len() + 32);
        out.extend_from_slice(&(kyber.len() as u16).to_be_bytes());
        out.extend_from_slice(kyber);
        out.extend_from_slice(&self.x25519);
        out
    }

    /// Parse from the wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < 2 {
            return Err(HandshakeError::KeyMaterial);
        }
        let kyber_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() != 2 + kyber_len + 32 {
            return Err(HandshakeError::KeyMaterial);
        }
        let kyber = kyber768::PublicKey::from_bytes(&data[2..2 + kyber_len])
            .map_err(|_| HandshakeError::KeyMaterial)?;
        let x25519: [u8; 32] = data[2 + kyber_len..]
            .try_into()
            .map_err(|_| HandshakeError::KeyMaterial)?;
        Ok(Self { kyber, x25519 })
    }
}

/// Responder-side encapsulation output sent in CHALLENGE.
#[derive(Clone)]
pub struct HybridCiphertext {
    kyber: kyber768::Ciphertext,
    x25519: [u8; 32],
}

impl HybridCiphertext {
    /// Serialize: `kyber_len (u16 BE) || kyber_ct || x25519_pk (32)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let kyber = self.kyber.as_bytes();
        let mut out = Vec::with_capacity(2 + kyber.len() + 32);
        out.extend_from_slice(&(kyber.len() as u16).to_be_bytes());
        out.extend_from_slice(kyber);
        out.extend_from_slice(&self.x25519);
        out
    }

    /// Parse from the wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < 2 {
            return Err(HandshakeError::KeyMaterial);
        }
        let kyber_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() != 2 + kyber_len + 32 {
            return Err(HandshakeError::KeyMaterial);
        }
        let kyber = kyber768::Ciphertext::from_bytes(&data[2..2 + kyber_len])
            .map_err(|_| HandshakeError::KeyMaterial)?;
        let x25519: [u8; 32] = data[2 + kyber_len..]
            .try_into()
            .map_err(|_| HandshakeError::KeyMaterial)?;
        Ok(Self { kyber, x25519 })
    }
}

/// An ephemeral hybrid KEM keypair, held by the initiator for one
/// handshake and dropped after decapsulation.
pub struct HybridKemKeypair {
    kyber_public: kyber768::PublicKey,
    kyber_secret: kyber768::SecretKey,
    x25519_secret: StaticSecret,
    x25519_public: X25519Public,
}

impl HybridKemKeypair {
    /// Generate a fresh keypair from the OS entropy source.
    pub fn generate() -> Self {
        let (kyber_public, kyber_secret) = kyber768::keypair();
        let x25519_secret = StaticSecret::random_from_rng(OsRng);
        let x25519_public = X25519Public::from(&x25519_secret);
        Self {
            kyber_public,
            kyber_secret,
            x25519_secret,
            x25519_public,
        }
    }

    /// The public half, sent in HELLO.
    pub fn public(&self) -> HybridKemPublic {
        HybridKemPublic {
            kyber: self.kyber_public.clone(),
            x25519: *self.x25519_public.as_bytes(),
        }
    }

    /// Initiator side: combine the Kyber decapsulation with the X25519
    /// exchange against the responder's contribution.
    pub fn decapsulate(&self, ciphertext: &HybridCiphertext) -> HybridSecret {
        let kyber_ss = kyber768::decapsulate(&ciphertext.kyber, &self.kyber_secret);
        let dh = self
            .x25519_secret
            .diffie_hellman(&X25519Public::from(ciphertext.x25519));

        let mut secret = [0u8; 64];
        secret[..32].copy_from_slice(kyber_ss.as_bytes());
        secret[32..].copy_from_slice(dh.as_bytes());
        HybridSecret(secret)
    }
}

/// Responder side: encapsulate against the initiator's hybrid public key.
///
/// Generates the responder's own ephemeral X25519 contribution, completes
/// both exchanges, and returns the ciphertext for CHALLENGE together with
/// the shared secret.
pub fn encapsulate(public: &HybridKemPublic) -> (HybridCiphertext, HybridSecret) {
    let (kyber_ss, kyber_ct) = kyber768::encapsulate(&public.kyber);

    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_public = X25519Public::from(&eph_secret);
    let dh = eph_secret.diffie_hellman(&X25519Public::from(public.x25519));

    let mut secret = [0u8; 64];
    secret[..32].copy_from_slice(kyber_ss.as_bytes());
    secret[32..].copy_from_slice(dh.as_bytes());

    (
        HybridCiphertext {
            kyber: kyber_ct,
            x25519: *eph_public.as_bytes(),
        },
        HybridSecret(secret),
    )
}
