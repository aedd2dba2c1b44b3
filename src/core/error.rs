//! Error types, layered per component.
//!
//! Pumps never propagate per-frame errors upward; they count and continue.
//! The session state machine is the only component that transitions on
//! errors, and handshake verification failures are plain values, never
//! panics.

use thiserror::Error;

/// Errors from the framing codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Header fails validation: wrong magic or version, unknown type, or
    /// non-zero reserved bytes.
    #[error("malformed frame header")]
    Malformed,

    /// Declared payload length exceeds the negotiated maximum.
    #[error("frame too large: {len} bytes exceeds limit {limit}")]
    TooLarge {
        /// Declared total frame length.
        len: usize,
        /// Maximum permitted length.
        limit: usize,
    },

    /// Buffer is shorter than the header or the declared payload.
    #[error("truncated frame: expected at least {expected} bytes, got {actual}")]
    Short {
        /// Minimum expected size.
        expected: usize,
        /// Actual size available.
        actual: usize,
    },
}

/// Errors from the AEAD channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify. The frame is dropped and no
    /// channel state is mutated.
    #[error("AEAD authentication failed")]
    AuthFail,

    /// Sequence number outside or already seen inside the replay window.
    #[error("replayed sequence number")]
    Replay,

    /// Outbound sequence space exhausted; the session must rekey.
    #[error("sequence counter exhausted")]
    CounterExhausted,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivation,

    /// Encryption failed (buffer too small or cipher error).
    #[error("AEAD encryption failed")]
    EncryptFail,
}

/// Handshake failure causes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// One or both signatures over the transcript did not verify.
    #[error("handshake signature invalid")]
    SignatureInvalid,

    /// Declared peer id does not match the digest of the presented keys.
    #[error("peer id does not match presented public keys")]
    PeerIdMismatch,

    /// Message timestamp drifts more than the permitted skew.
    #[error("handshake timestamp outside permitted skew")]
    Timestamp,

    /// Message out of order, malformed body, or transcript disagreement.
    #[error("handshake protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A handshake step exceeded its budget.
    #[error("handshake step timed out")]
    Timeout,

    /// Key material could not be processed (bad KEM key or ciphertext).
    #[error("invalid handshake key material")]
    KeyMaterial,
}

impl From<CryptoError> for HandshakeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyDerivation => HandshakeError::KeyMaterial,
            CryptoError::AuthFail
            | CryptoError::Replay
            | CryptoError::CounterExhausted
            | CryptoError::EncryptFail => {
                HandshakeError::ProtocolViolation("crypto failure during handshake")
            }
        }
    }
}

/// Errors from control and data transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel ended unexpectedly.
    #[error("transport closed")]
    Closed,

    /// A control message exceeded the length-prefix limit.
    #[error("control message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Malformed control message body.
    #[error("malformed control message")]
    MalformedMessage,

    /// TLS layer failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the virtual interface adaptor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device was closed; pending reads return this promptly.
    #[error("device closed")]
    Closed,

    /// The device cannot take the frame right now; the caller drops it
    /// rather than stalling.
    #[error("device busy")]
    Busy,

    /// A frame exceeded the device MTU.
    #[error("frame of {len} bytes exceeds device mtu {mtu}")]
    OversizedFrame {
        /// Frame length.
        len: usize,
        /// Device MTU.
        mtu: usize,
    },
}

/// Session-level failures surfaced through status snapshots and the
/// process-level termination reason.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Handshake failed with a cause code; not retried under the same
    /// identity mismatch.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Every reachability candidate was exhausted.
    #[error("no reachable candidate for peer")]
    NoRoute,

    /// The peer is unknown to the directory.
    #[error("peer not found in directory")]
    UnknownPeer,

    /// Control or data channel ended unexpectedly.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Buffer-pool fallback allocation or OS socket limits hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The session was closed while an operation was in flight.
    #[error("session terminated")]
    Terminated,
}

/// Top-level error for node construction and operation.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Session failure.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Transport failure outside any session (listener setup).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Device failure.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::TooLarge { len: 9000, limit: 1543 };
        assert_eq!(err.to_string(), "frame too large: 9000 bytes exceeds limit 1543");

        let err = HandshakeError::ProtocolViolation("unexpected message kind");
        assert!(err.to_string().contains("unexpected message kind"));
    }

    #[test]
    fn test_error_conversion_chain() {
        let session: SessionError = HandshakeError::PeerIdMismatch.into();
        let mesh: MeshError = session.into();
        assert!(matches!(
            mesh,
            MeshError::Session(SessionError::Handshake(HandshakeError::PeerIdMismatch))
        ));
    }
}
