//! Hybrid post-quantum handshake engine.
//!
//! Four messages establish a mutually authenticated session:
//!
//! ```text
//! initiator                                   responder
//!    | -- HELLO (keys, kem pub, nonce, sig) --->  |
//!    | <-- CHALLENGE (keys, kem ct, sig) -------  |
//!    | -- RESPONSE (transcript hash, sig) ----->  |
//!    | <-- ESTABLISHED (session params, sig) ---  |
//! ```
//!
//! Both sides accumulate a transcript of the full encoded messages.
//! `th1` (through CHALLENGE) salts the key schedule and is confirmed in
//! RESPONSE; `th2` (through RESPONSE) is confirmed in ESTABLISHED. Every
//! message carries a hybrid signature; a replayed HELLO can never complete
//! because RESPONSE must sign a transcript containing the responder's
//! fresh CHALLENGE.
//!
//! All verification paths return typed [`HandshakeError`] values; nothing
//! here panics on attacker-controlled input.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::core::constants::{
    HANDSHAKE_MAX_SKEW, REPLAY_NONCE_SIZE, SESSION_ID_SIZE, SESSION_NONCE_SIZE,
    TRANSCRIPT_HASH_SIZE,
};
use crate::core::HandshakeError;
use crate::crypto::identity::{HybridSignature, IdentityPublic, NodeIdentity, PeerId};
use crate::crypto::kdf::{Role, SessionKeys};
use crate::crypto::kem::{encapsulate, HybridCiphertext, HybridKemKeypair, HybridKemPublic};
use crate::wire::control::{
    ChallengeBody, ControlMessage, EstablishedBody, HelloBody, ResponseBody,
};

/// Session parameters agreed during the handshake.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Responder-assigned session identifier.
    pub session_id: [u8; SESSION_ID_SIZE],
    /// Effective tunnel MTU (minimum of both interfaces).
    pub mtu: u16,
    /// Heartbeat interval.
    pub heartbeat: Duration,
    /// Rekey interval.
    pub rekey: Duration,
    /// Our own address as the peer observed it, when the peer told us.
    pub reflexive_addr: Option<SocketAddr>,
    /// Whether the peer accepts a direct data path.
    pub peer_supports_direct: bool,
}

/// Everything a completed handshake yields.
pub struct HandshakeOutcome {
    /// Derived key material for both directions.
    pub keys: SessionKeys,
    /// Which side of the handshake we were.
    pub role: Role,
    /// The peer's authenticated public identity.
    pub peer: IdentityPublic,
    /// The peer's id (digest of `peer`).
    pub peer_id: PeerId,
    /// Agreed session parameters.
    pub params: SessionParams,
    /// Final transcript hash (`th2`).
    pub transcript_hash: [u8; TRANSCRIPT_HASH_SIZE],
}

/// Local knobs the responder folds into ESTABLISHED.
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    /// Interface MTU we tunnel with.
    pub mtu: u16,
    /// Heartbeat interval to announce.
    pub heartbeat: Duration,
    /// Rekey interval to announce.
    pub rekey: Duration,
    /// The dialer's address as the control transport observed it.
    pub observed_peer_addr: SocketAddr,
    /// Whether we accept a direct data path.
    pub supports_direct: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn check_timestamp(timestamp_ms: u64) -> Result<(), HandshakeError> {
    let now = now_ms();
    let skew = now.abs_diff(timestamp_ms);
    if skew > HANDSHAKE_MAX_SKEW.as_millis() as u64 {
        return Err(HandshakeError::Timestamp);
    }
    Ok(())
}

fn random_nonce<const N: usize>() -> [u8; N] {
    let mut nonce = [0u8; N];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn transcript_checkpoint(transcript: &Sha256) -> [u8; TRANSCRIPT_HASH_SIZE] {
    transcript.clone().finalize().into()
}

fn parse_signature(bytes: &[u8]) -> Result<HybridSignature, HandshakeError> {
    HybridSignature::from_bytes(bytes)
}

/// CHALLENGE signatures additionally bind the HELLO the responder saw.
fn challenge_sig_input(body: &ChallengeBody, hello_digest: &[u8; 32]) -> Vec<u8> {
    let mut input = body.signing_bytes();
    input.extend_from_slice(hello_digest);
    input
}

// =============================================================================
// Initiator
// =============================================================================

/// Initiator-side handshake, waiting for CHALLENGE.
pub struct InitiatorHandshake {
    identity: Arc<NodeIdentity>,
    expected_peer: PeerId,
    kem: HybridKemKeypair,
    session_nonce: [u8; SESSION_NONCE_SIZE],
    hello_digest: [u8; 32],
    transcript: Sha256,
    resumption: Option<[u8; 32]>,
}

impl InitiatorHandshake {
    /// Build the HELLO message and the state awaiting CHALLENGE.
    ///
    /// `resumption` carries the previous epoch's resumption secret on a
    /// rekey run, `None` on a first handshake.
    pub fn start(
        identity: Arc<NodeIdentity>,
        expected_peer: PeerId,
        resumption: Option<[u8; 32]>,
    ) -> (Self, ControlMessage) {
        let kem = HybridKemKeypair::generate();
        let session_nonce = random_nonce::<SESSION_NONCE_SIZE>();

        let mut body = HelloBody {
            session_nonce,
            replay_nonce: random_nonce::<REPLAY_NONCE_SIZE>(),
            timestamp_ms: now_ms(),
            identity: identity.public().to_bytes(),
            kem_public: kem.public().to_bytes(),
            signature: Vec::new(),
        };
        body.signature = identity.sign(&body.signing_bytes()).to_bytes();

        let message = ControlMessage::Hello(body);
        let encoded = message.encode();
        let hello_digest: [u8; 32] = Sha256::digest(&encoded).into();
        let mut transcript = Sha256::new();
        transcript.update(&encoded);

        (
            Self {
                identity,
                expected_peer,
                kem,
                session_nonce,
                hello_digest,
                transcript,
                resumption,
            },
            message,
        )
    }

    /// Process CHALLENGE: authenticate the responder, complete the key
    /// exchange, and emit RESPONSE.
    pub fn challenge(
        mut self,
        body: &ChallengeBody,
    ) -> Result<(ControlMessage, AwaitingEstablished), HandshakeError> {
        if body.session_nonce != self.session_nonce {
            return Err(HandshakeError::ProtocolViolation("session nonce mismatch"));
        }
        check_timestamp(body.timestamp_ms)?;

        let peer = IdentityPublic::from_bytes(&body.identity)?;
        if peer.peer_id() != self.expected_peer {
            return Err(HandshakeError::PeerIdMismatch);
        }

        let signature = parse_signature(&body.signature)?;
        peer.verify(&challenge_sig_input(body, &self.hello_digest), &signature)?;

        let ciphertext = HybridCiphertext::from_bytes(&body.kem_ciphertext)?;
        let secret = self.kem.decapsulate(&ciphertext);

        self.transcript
            .update(ControlMessage::Challenge(body.clone()).encode());
        let th1 = transcript_checkpoint(&self.transcript);

        let keys = SessionKeys::derive(&secret, &th1, self.resumption.as_ref())?;

        let mut response = ResponseBody {
            session_nonce: self.session_nonce,
            replay_nonce: random_nonce::<REPLAY_NONCE_SIZE>(),
            timestamp_ms: now_ms(),
            transcript_hash: th1,
            signature: Vec::new(),
        };
        response.signature = self.identity.sign(&response.signing_bytes()).to_bytes();

        let message = ControlMessage::Response(response);
        self.transcript.update(message.encode());
        let th2 = transcript_checkpoint(&self.transcript);

        Ok((
            message,
            AwaitingEstablished {
                session_nonce: self.session_nonce,
                peer,
                keys: Some(keys),
                th2,
            },
        ))
    }
}

/// Initiator-side handshake, waiting for ESTABLISHED.
pub struct AwaitingEstablished {
    session_nonce: [u8; SESSION_NONCE_SIZE],
    peer: IdentityPublic,
    keys: Option<SessionKeys>,
    th2: [u8; TRANSCRIPT_HASH_SIZE],
}

impl AwaitingEstablished {
    /// Process ESTABLISHED and finish the handshake.
    pub fn established(
        mut self,
        body: &EstablishedBody,
        local_mtu: u16,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        if body.session_nonce != self.session_nonce {
            return Err(HandshakeError::ProtocolViolation("session nonce mismatch"));
        }
        check_timestamp(body.timestamp_ms)?;
        if body.transcript_hash != self.th2 {
            return Err(HandshakeError::ProtocolViolation("transcript mismatch"));
        }

        let signature = parse_signature(&body.signature)?;
        self.peer.verify(&body.signing_bytes(), &signature)?;

        let keys = self.keys.take().expect("keys present until consumed");
        let peer_id = self.peer.peer_id();
        Ok(HandshakeOutcome {
            keys,
            role: Role::Initiator,
            peer_id,
            peer: self.peer,
            params: SessionParams {
                session_id: body.session_id,
                mtu: body.mtu.min(local_mtu),
                heartbeat: Duration::from_secs(body.heartbeat_secs as u64),
                rekey: Duration::from_secs(body.rekey_secs as u64),
                reflexive_addr: Some(body.observed_addr),
                peer_supports_direct: body.supports_direct,
            },
            transcript_hash: self.th2,
        })
    }
}

// =============================================================================
// Responder
// =============================================================================

/// Responder-side handshake, waiting for HELLO.
pub struct ResponderHandshake {
    identity: Arc<NodeIdentity>,
    config: ResponderConfig,
    /// Restrict HELLO to this peer (simultaneous-open arbitration).
    expected_peer: Option<PeerId>,
    resumption: Option<[u8; 32]>,
}

impl ResponderHandshake {
    /// New responder for one inbound handshake.
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: ResponderConfig,
        expected_peer: Option<PeerId>,
        resumption: Option<[u8; 32]>,
    ) -> Self {
        Self {
            identity,
            config,
            expected_peer,
            resumption,
        }
    }

    /// Process HELLO: authenticate the initiator, encapsulate, and emit
    /// CHALLENGE.
    pub fn hello(
        self,
        body: &HelloBody,
    ) -> Result<(ControlMessage, AwaitingResponse), HandshakeError> {
        check_timestamp(body.timestamp_ms)?;

        let peer = IdentityPublic::from_bytes(&body.identity)?;
        let peer_id = peer.peer_id();
        if let Some(expected) = self.expected_peer {
            if peer_id != expected {
                return Err(HandshakeError::PeerIdMismatch);
            }
        }

        let signature = parse_signature(&body.signature)?;
        peer.verify(&body.signing_bytes(), &signature)?;

        let kem_public = HybridKemPublic::from_bytes(&body.kem_public)?;
        let (ciphertext, secret) = encapsulate(&kem_public);

        let hello_encoded = ControlMessage::Hello(body.clone()).encode();
        let hello_digest: [u8; 32] = Sha256::digest(&hello_encoded).into();
        let mut transcript = Sha256::new();
        transcript.update(&hello_encoded);

        let mut challenge = ChallengeBody {
            session_nonce: body.session_nonce,
            replay_nonce: random_nonce::<REPLAY_NONCE_SIZE>(),
            timestamp_ms: now_ms(),
            identity: self.identity.public().to_bytes(),
            kem_ciphertext: ciphertext.to_bytes(),
            signature: Vec::new(),
        };
        challenge.signature = self
            .identity
            .sign(&challenge_sig_input(&challenge, &hello_digest))
            .to_bytes();

        let message = ControlMessage::Challenge(challenge);
        transcript.update(message.encode());
        let th1 = transcript_checkpoint(&transcript);

        let keys = SessionKeys::derive(&secret, &th1, self.resumption.as_ref())?;

        Ok((
            message,
            AwaitingResponse {
                identity: self.identity,
                config: self.config,
                peer,
                peer_id,
                session_nonce: body.session_nonce,
                transcript,
                th1,
                keys: Some(keys),
            },
        ))
    }
}

/// Responder-side handshake, waiting for RESPONSE.
pub struct AwaitingResponse {
    identity: Arc<NodeIdentity>,
    config: ResponderConfig,
    peer: IdentityPublic,
    peer_id: PeerId,
    session_nonce: [u8; SESSION_NONCE_SIZE],
    transcript: Sha256,
    th1: [u8; TRANSCRIPT_HASH_SIZE],
    keys: Option<SessionKeys>,
}

impl AwaitingResponse {
    /// Process RESPONSE, emit ESTABLISHED, and finish the handshake.
    pub fn response(
        mut self,
        body: &ResponseBody,
    ) -> Result<(ControlMessage, HandshakeOutcome), HandshakeError> {
        if body.session_nonce != self.session_nonce {
            return Err(HandshakeError::ProtocolViolation("session nonce mismatch"));
        }
        check_timestamp(body.timestamp_ms)?;
        if body.transcript_hash != self.th1 {
            return Err(HandshakeError::ProtocolViolation("transcript mismatch"));
        }

        let signature = parse_signature(&body.signature)?;
        self.peer.verify(&body.signing_bytes(), &signature)?;

        self.transcript
            .update(ControlMessage::Response(body.clone()).encode());
        let th2 = transcript_checkpoint(&self.transcript);

        let mut established = EstablishedBody {
            session_nonce: self.session_nonce,
            replay_nonce: random_nonce::<REPLAY_NONCE_SIZE>(),
            timestamp_ms: now_ms(),
            session_id: random_nonce::<SESSION_ID_SIZE>(),
            transcript_hash: th2,
            mtu: self.config.mtu,
            heartbeat_secs: self.config.heartbeat.as_secs() as u32,
            rekey_secs: self.config.rekey.as_secs() as u32,
            observed_addr: self.config.observed_peer_addr,
            supports_direct: self.config.supports_direct,
            signature: Vec::new(),
        };
        established.signature = self
            .identity
            .sign(&established.signing_bytes())
            .to_bytes();

        let keys = self.keys.take().expect("keys present until consumed");
        let outcome = HandshakeOutcome {
            keys,
            role: Role::Responder,
            peer_id: self.peer_id,
            peer: self.peer,
            params: SessionParams {
                session_id: established.session_id,
                mtu: self.config.mtu,
                heartbeat: self.config.heartbeat,
                rekey: self.config.rekey,
                reflexive_addr: None,
                peer_supports_direct: true,
            },
            transcript_hash: th2,
        };

        Ok((ControlMessage::Established(established), outcome))
    }
}
