//! Cryptographic layer: hybrid identity, key exchange, the session key
//! schedule, and the per-direction AEAD channels.

pub mod aead;
pub mod handshake;
pub mod identity;
pub mod kdf;
pub mod kem;
pub mod replay;

pub use aead::{channel_pair, RxChannel, SessionKey, TxChannel};
pub use handshake::{
    AwaitingEstablished, AwaitingResponse, HandshakeOutcome, InitiatorHandshake, ResponderConfig,
    ResponderHandshake, SessionParams,
};
pub use identity::{HybridSignature, IdentityPublic, NodeIdentity, PeerId};
pub use kdf::{Role, SessionKeys};
pub use kem::{HybridCiphertext, HybridKemKeypair, HybridKemPublic, HybridSecret};
pub use replay::ReplayWindow;
