//! Long-term hybrid signing identity.
//!
//! Every node holds a Dilithium3 keypair (lattice half) and an Ed25519
//! keypair (classical half). The peer id is the SHA-256 digest over the
//! concatenated public keys, so an identity cannot present keys it does
//! not own without changing its id. A hybrid signature is valid only when
//! BOTH halves verify; breaking one primitive is not enough to forge.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as _, SecretKey as _,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::constants::{ED25519_SIGNATURE_SIZE, PEER_ID_SIZE};
use crate::core::HandshakeError;

/// Fixed-length digest identifying a peer on the overlay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Construct from raw digest bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Digest the given public-key material into a peer id.
    pub fn digest(dilithium_pk: &[u8], ed25519_pk: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(dilithium_pk);
        hasher.update(ed25519_pk);
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// A peer's public identity half: both long-term verification keys.
#[derive(Clone)]
pub struct IdentityPublic {
    dilithium: dilithium3::PublicKey,
    ed25519: VerifyingKey,
}

impl IdentityPublic {
    /// The peer id bound to these keys.
    pub fn peer_id(&self) -> PeerId {
        PeerId::digest(self.dilithium.as_bytes(), self.ed25519.as_bytes())
    }

    /// Serialize for the handshake wire format:
    /// `dilithium_len (u16 BE) || dilithium_pk || ed25519_pk (32)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let dil = self.dilithium.as_bytes();
        let mut out = Vec::with_capacity(2 + dil.len() + 32);
        out.extend_from_slice(&(dil.len() as u16).to_be_bytes());
        out.extend_from_slice(dil);
        out.extend_from_slice(self.ed25519.as_bytes());
        out
    }

    /// Parse from the handshake wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < 2 {
            return Err(HandshakeError::KeyMaterial);
        }
        let dil_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() != 2 + dil_len + 32 {
            return Err(HandshakeError::KeyMaterial);
        }
        let dilithium = dilithium3::PublicKey::from_bytes(&data[2..2 + dil_len])
            .map_err(|_| HandshakeError::KeyMaterial)?;
        let ed25519_bytes: [u8; 32] = data[2 + dil_len..]
            .try_into()
            .map_err(|_| HandshakeError::KeyMaterial)?;
        let ed25519 =
            VerifyingKey::from_bytes(&ed25519_bytes).map_err(|_| HandshakeError::KeyMaterial)?;
        Ok(Self { dilithium, ed25519 })
    }

    /// Verify a hybrid signature. Both halves must verify.
    ///
    /// Total function: every failure comes back as `SignatureInvalid`.
    pub fn verify(&self, message: &[u8], signature: &HybridSignature) -> Result<(), HandshakeError> {
        let dil_sig = dilithium3::DetachedSignature::from_bytes(&signature.dilithium)
            .map_err(|_| HandshakeError::SignatureInvalid)?;
        dilithium3::verify_detached_signature(&dil_sig, message, &self.dilithium)
            .map_err(|_| HandshakeError::SignatureInvalid)?;

        let ed_sig = Signature::from_bytes(&signature.ed25519);
        self.ed25519
            .verify(message, &ed_sig)
            .map_err(|_| HandshakeError::SignatureInvalid)
    }
}

/// A hybrid signature: lattice and classical halves, both mandatory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HybridSignature {
    /// Dilithium3 detached signature bytes.
    pub dilithium: Vec<u8>,
    /// Ed25519 signature bytes.
    pub ed25519: [u8; ED25519_SIGNATURE_SIZE],
}

impl HybridSignature {
    /// Serialize: `dilithium_len (u16 BE) || dilithium || ed25519 (64)`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.dilithium.len() + ED25519_SIGNATURE_SIZE);
        out.extend_from_slice(&(self.dilithium.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.dilithium);
        out.extend_from_slice(&self.ed25519);
        out
    }

    /// Parse from the wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self, HandshakeError> {
        if data.len() < 2 {
            return Err(HandshakeError::SignatureInvalid);
        }
        let dil_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if data.len() != 2 + dil_len + ED25519_SIGNATURE_SIZE {
            return Err(HandshakeError::SignatureInvalid);
        }
        let dilithium = data[2..2 + dil_len].to_vec();
        let ed25519: [u8; ED25519_SIGNATURE_SIZE] = data[2 + dil_len..]
            .try_into()
            .map_err(|_| HandshakeError::SignatureInvalid)?;
        Ok(Self { dilithium, ed25519 })
    }
}

/// The node's long-term identity: both signing keypairs.
///
/// Loading key material from disk is the embedder's concern; the core
/// consumes an already-constructed identity.
pub struct NodeIdentity {
    dilithium_public: dilithium3::PublicKey,
    dilithium_secret: dilithium3::SecretKey,
    ed25519: SigningKey,
}

impl NodeIdentity {
    /// Generate a fresh identity from the OS entropy source.
    pub fn generate() -> Self {
        let (dilithium_public, dilithium_secret) = dilithium3::keypair();
        let ed25519 = SigningKey::generate(&mut OsRng);
        Self {
            dilithium_public,
            dilithium_secret,
            ed25519,
        }
    }

    /// Reconstruct an identity from stored key material.
    pub fn from_key_material(
        dilithium_public: &[u8],
        dilithium_secret: &[u8],
        ed25519_secret: &[u8; 32],
    ) -> Result<Self, HandshakeError> {
        Ok(Self {
            dilithium_public: dilithium3::PublicKey::from_bytes(dilithium_public)
                .map_err(|_| HandshakeError::KeyMaterial)?,
            dilithium_secret: dilithium3::SecretKey::from_bytes(dilithium_secret)
                .map_err(|_| HandshakeError::KeyMaterial)?,
            ed25519: SigningKey::from_bytes(ed25519_secret),
        })
    }

    /// The public half of this identity.
    pub fn public(&self) -> IdentityPublic {
        IdentityPublic {
            dilithium: self.dilithium_public.clone(),
            ed25519: self.ed25519.verifying_key(),
        }
    }

    /// This node's peer id.
    pub fn peer_id(&self) -> PeerId {
        self.public().peer_id()
    }

    /// Produce a hybrid signature over `message`.
    pub fn sign(&self, message: &[u8]) -> HybridSignature {
        let dil_sig = dilithium3::detached_sign(message, &self.dilithium_secret);
        let ed_sig = self.ed25519.sign(message);
        HybridSignature {
            dilithium: dil_sig.as_bytes().to_vec(),
            ed25519: ed_sig.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_binds_to_keys() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
        assert_eq!(a.peer_id(), a.public().peer_id());
    }

    #[test]
    fn test_identity_public_roundtrip() {
        let identity = NodeIdentity::generate();
        let public = identity.public();
        let parsed = IdentityPublic::from_bytes(&public.to_bytes()).unwrap();
        assert_eq!(parsed.peer_id(), identity.peer_id());
    }

    #[test]
    fn test_identity_public_rejects_truncation() {
        let public = NodeIdentity::generate().public();
        let bytes = public.to_bytes();
        assert!(IdentityPublic::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(IdentityPublic::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_hybrid_sign_verify() {
        let identity = NodeIdentity::generate();
        let message = b"the quick brown fox";
        let signature = identity.sign(message);

        identity.public().verify(message, &signature).unwrap();
        assert_eq!(
            identity.public().verify(b"another message", &signature),
            Err(HandshakeError::SignatureInvalid)
        );
    }

    #[test]
    fn test_verify_requires_both_halves() {
        let identity = NodeIdentity::generate();
        let message = b"hybrid or nothing";
        let signature = identity.sign(message);

        // Corrupt only the classical half.
        let mut broken = signature.clone();
        broken.ed25519[0] ^= 0x01;
        assert_eq!(
            identity.public().verify(message, &broken),
            Err(HandshakeError::SignatureInvalid)
        );

        // Corrupt only the lattice half.
        let mut broken = signature;
        broken.dilithium[0] ^= 0x01;
        assert_eq!(
            identity.public().verify(message, &broken),
            Err(HandshakeError::SignatureInvalid)
        );
    }

    #[test]
    fn test_signature_roundtrip() {
        let identity = NodeIdentity::generate();
        let signature = identity.sign(b"wire trip");
        let parsed = HybridSignature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(parsed, signature);
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        let small = PeerId::from_bytes([0x00; PEER_ID_SIZE]);
        let big = PeerId::from_bytes([0xFF; PEER_ID_SIZE]);
        assert!(small < big);
    }
}
