//! Control-channel message codec.
//!
//! Control messages travel length-prefixed (`u32` BE, bounded by
//! [`CONTROL_MESSAGE_MAX`]) on the reliable control channel: the four
//! handshake messages, endpoint notification, heartbeats, relay-carried
//! data frames, and the goodbye marker.
//!
//! Handshake bodies keep their key material as opaque byte fields here;
//! the handshake engine owns parsing them into crypto types. Every
//! handshake body is signed over the message kind byte plus all fields
//! preceding the signature.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::constants::{
    CONTROL_MESSAGE_MAX, REPLAY_NONCE_SIZE, SESSION_ID_SIZE, SESSION_NONCE_SIZE,
    TRANSCRIPT_HASH_SIZE,
};
use crate::core::TransportError;

const KIND_HELLO: u8 = 0x10;
const KIND_CHALLENGE: u8 = 0x11;
const KIND_RESPONSE: u8 = 0x12;
const KIND_ESTABLISHED: u8 = 0x13;
const KIND_ENDPOINT_NOTIFY: u8 = 0x20;
const KIND_HEARTBEAT: u8 = 0x21;
const KIND_HEARTBEAT_ACK: u8 = 0x22;
const KIND_RELAY_DATA: u8 = 0x30;
const KIND_GOODBYE: u8 = 0x3F;

/// HELLO body: the initiator's opening message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloBody {
    /// Fresh 16-byte nonce naming this handshake attempt.
    pub session_nonce: [u8; SESSION_NONCE_SIZE],
    /// Per-message replay nonce.
    pub replay_nonce: [u8; REPLAY_NONCE_SIZE],
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Serialized long-term public keys.
    pub identity: Vec<u8>,
    /// Serialized ephemeral hybrid KEM public key.
    pub kem_public: Vec<u8>,
    /// Hybrid signature over the preceding fields.
    pub signature: Vec<u8>,
}

/// CHALLENGE body: the responder's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeBody {
    /// Echo of the HELLO session nonce.
    pub session_nonce: [u8; SESSION_NONCE_SIZE],
    /// Per-message replay nonce.
    pub replay_nonce: [u8; REPLAY_NONCE_SIZE],
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Serialized long-term public keys.
    pub identity: Vec<u8>,
    /// Serialized hybrid KEM encapsulation.
    pub kem_ciphertext: Vec<u8>,
    /// Hybrid signature over the transcript so far.
    pub signature: Vec<u8>,
}

/// RESPONSE body: the initiator's transcript confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    /// Echo of the session nonce.
    pub session_nonce: [u8; SESSION_NONCE_SIZE],
    /// Per-message replay nonce.
    pub replay_nonce: [u8; REPLAY_NONCE_SIZE],
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// SHA-256 over the transcript up to and including CHALLENGE.
    pub transcript_hash: [u8; TRANSCRIPT_HASH_SIZE],
    /// Hybrid signature over the full transcript.
    pub signature: Vec<u8>,
}

/// ESTABLISHED body: the responder's session confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedBody {
    /// Echo of the session nonce.
    pub session_nonce: [u8; SESSION_NONCE_SIZE],
    /// Per-message replay nonce.
    pub replay_nonce: [u8; REPLAY_NONCE_SIZE],
    /// Sender clock, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Responder-assigned session identifier.
    pub session_id: [u8; SESSION_ID_SIZE],
    /// SHA-256 over the transcript up to and including RESPONSE.
    pub transcript_hash: [u8; TRANSCRIPT_HASH_SIZE],
    /// Interface MTU the responder tunnels with.
    pub mtu: u16,
    /// Heartbeat interval in seconds.
    pub heartbeat_secs: u32,
    /// Rekey interval in seconds.
    pub rekey_secs: u32,
    /// The initiator's address as observed by the responder.
    pub observed_addr: SocketAddr,
    /// Whether the responder can accept a direct data path.
    pub supports_direct: bool,
    /// Hybrid signature over the full transcript.
    pub signature: Vec<u8>,
}

/// A control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Handshake step 1.
    Hello(HelloBody),
    /// Handshake step 2.
    Challenge(ChallengeBody),
    /// Handshake step 3.
    Response(ResponseBody),
    /// Handshake step 4.
    Established(EstablishedBody),
    /// The sender's chosen data endpoint for direct migration.
    EndpointNotify {
        /// Advertised data address.
        addr: SocketAddr,
    },
    /// Liveness probe.
    Heartbeat {
        /// Monotonic heartbeat counter.
        seq: u64,
        /// Sender timestamp in nanoseconds, echoed back for RTT.
        timestamp_ns: u64,
    },
    /// Liveness probe answer.
    HeartbeatAck {
        /// Counter of the heartbeat being answered.
        seq: u64,
        /// Responder timestamp in nanoseconds.
        timestamp_ns: u64,
        /// Echo of the probe's timestamp.
        echo_timestamp_ns: u64,
    },
    /// A complete encrypted wire frame carried over the relay path.
    RelayData(Vec<u8>),
    /// Graceful teardown marker.
    Goodbye {
        /// 0 = orderly close, 1 = unrecoverable local error.
        reason: u8,
    },
}

impl ControlMessage {
    /// Encode to the control-channel wire format (kind byte + body).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Hello(body) => {
                out.push(KIND_HELLO);
                out.extend_from_slice(&body.signing_bytes()[1..]);
                put_var16(&mut out, &body.signature);
            }
            Self::Challenge(body) => {
                out.push(KIND_CHALLENGE);
                out.extend_from_slice(&body.signing_bytes()[1..]);
                put_var16(&mut out, &body.signature);
            }
            Self::Response(body) => {
                out.push(KIND_RESPONSE);
                out.extend_from_slice(&body.signing_bytes()[1..]);
                put_var16(&mut out, &body.signature);
            }
            Self::Established(body) => {
                out.push(KIND_ESTABLISHED);
                out.extend_from_slice(&body.signing_bytes()[1..]);
                put_var16(&mut out, &body.signature);
            }
            Self::EndpointNotify { addr } => {
                out.push(KIND_ENDPOINT_NOTIFY);
                put_addr(&mut out, addr);
            }
            Self::Heartbeat { seq, timestamp_ns } => {
                out.push(KIND_HEARTBEAT);
                out.extend_from_slice(&seq.to_be_bytes());
                out.extend_from_slice(&timestamp_ns.to_be_bytes());
            }
            Self::HeartbeatAck {
                seq,
                timestamp_ns,
                echo_timestamp_ns,
            } => {
                out.push(KIND_HEARTBEAT_ACK);
                out.extend_from_slice(&seq.to_be_bytes());
                out.extend_from_slice(&timestamp_ns.to_be_bytes());
                out.extend_from_slice(&echo_timestamp_ns.to_be_bytes());
            }
            Self::RelayData(frame) => {
                out.push(KIND_RELAY_DATA);
                out.extend_from_slice(frame);
            }
            Self::Goodbye { reason } => {
                out.push(KIND_GOODBYE);
                out.push(*reason);
            }
        }
        out
    }

    /// Decode from the control-channel wire format.
    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if data.is_empty() || data.len() > CONTROL_MESSAGE_MAX {
            return Err(TransportError::MalformedMessage);
        }
        let mut reader = Reader::new(&data[1..]);
        let message = match data[0] {
            KIND_HELLO => Self::Hello(HelloBody {
                session_nonce: reader.array()?,
                replay_nonce: reader.array()?,
                timestamp_ms: reader.u64()?,
                identity: reader.var16()?,
                kem_public: reader.var16()?,
                signature: reader.var16()?,
            }),
            KIND_CHALLENGE => Self::Challenge(ChallengeBody {
                session_nonce: reader.array()?,
                replay_nonce: reader.array()?,
                timestamp_ms: reader.u64()?,
                identity: reader.var16()?,
                kem_ciphertext: reader.var16()?,
                signature: reader.var16()?,
            }),
            KIND_RESPONSE => Self::Response(ResponseBody {
                session_nonce: reader.array()?,
                replay_nonce: reader.array()?,
                timestamp_ms: reader.u64()?,
                transcript_hash: reader.array()?,
                signature: reader.var16()?,
            }),
            KIND_ESTABLISHED => Self::Established(EstablishedBody {
                session_nonce: reader.array()?,
                replay_nonce: reader.array()?,
                timestamp_ms: reader.u64()?,
                session_id: reader.array()?,
                transcript_hash: reader.array()?,
                mtu: reader.u16()?,
                heartbeat_secs: reader.u32()?,
                rekey_secs: reader.u32()?,
                observed_addr: reader.addr()?,
                supports_direct: reader.u8()? != 0,
                signature: reader.var16()?,
            }),
            KIND_ENDPOINT_NOTIFY => Self::EndpointNotify {
                addr: reader.addr()?,
            },
            KIND_HEARTBEAT => Self::Heartbeat {
                seq: reader.u64()?,
                timestamp_ns: reader.u64()?,
            },
            KIND_HEARTBEAT_ACK => Self::HeartbeatAck {
                seq: reader.u64()?,
                timestamp_ns: reader.u64()?,
                echo_timestamp_ns: reader.u64()?,
            },
            KIND_RELAY_DATA => return Ok(Self::RelayData(data[1..].to_vec())),
            KIND_GOODBYE => Self::Goodbye {
                reason: reader.u8()?,
            },
            _ => return Err(TransportError::MalformedMessage),
        };
        reader.finish()?;
        Ok(message)
    }

    /// Short name for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Challenge(_) => "challenge",
            Self::Response(_) => "response",
            Self::Established(_) => "established",
            Self::EndpointNotify { .. } => "endpoint-notify",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat-ack",
            Self::RelayData(_) => "relay-data",
            Self::Goodbye { .. } => "goodbye",
        }
    }
}

impl HelloBody {
    /// Bytes covered by this message's signature: kind byte plus every
    /// field preceding the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = vec![KIND_HELLO];
        out.extend_from_slice(&self.session_nonce);
        out.extend_from_slice(&self.replay_nonce);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        put_var16(&mut out, &self.identity);
        put_var16(&mut out, &self.kem_public);
        out
    }
}

impl ChallengeBody {
    /// Bytes covered by this message's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = vec![KIND_CHALLENGE];
        out.extend_from_slice(&self.session_nonce);
        out.extend_from_slice(&self.replay_nonce);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        put_var16(&mut out, &self.identity);
        put_var16(&mut out, &self.kem_ciphertext);
        out
    }
}

impl ResponseBody {
    /// Bytes covered by this message's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = vec![KIND_RESPONSE];
        out.extend_from_slice(&self.session_nonce);
        out.extend_from_slice(&self.replay_nonce);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.transcript_hash);
        out
    }
}

impl EstablishedBody {
    /// Bytes covered by this message's signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = vec![KIND_ESTABLISHED];
        out.extend_from_slice(&self.session_nonce);
        out.extend_from_slice(&self.replay_nonce);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.transcript_hash);
        out.extend_from_slice(&self.mtu.to_be_bytes());
        out.extend_from_slice(&self.heartbeat_secs.to_be_bytes());
        out.extend_from_slice(&self.rekey_secs.to_be_bytes());
        put_addr(&mut out, &self.observed_addr);
        out.push(self.supports_direct as u8);
        out
    }
}

fn put_var16(out: &mut Vec<u8>, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_addr(out: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
}

/// Bounds-checked cursor over a message body.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        if self.data.len() - self.pos < n {
            return Err(TransportError::MalformedMessage);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TransportError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64, TransportError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], TransportError> {
        Ok(self.take(N)?.try_into().expect("sized"))
    }

    fn var16(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn addr(&mut self) -> Result<SocketAddr, TransportError> {
        let ip = match self.u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(self.array::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(self.array::<16>()?)),
            _ => return Err(TransportError::MalformedMessage),
        };
        let port = self.u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Trailing bytes after the last field are a protocol violation.
    fn finish(self) -> Result<(), TransportError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(TransportError::MalformedMessage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: ControlMessage) {
        let encoded = message.encode();
        let decoded = ControlMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_hello_roundtrip() {
        roundtrip(ControlMessage::Hello(HelloBody {
            session_nonce: [0x11; SESSION_NONCE_SIZE],
            replay_nonce: [0x22; REPLAY_NONCE_SIZE],
            timestamp_ms: 1_700_000_000_123,
            identity: vec![0xAA; 100],
            kem_public: vec![0xBB; 200],
            signature: vec![0xCC; 300],
        }));
    }

    #[test]
    fn test_challenge_roundtrip() {
        roundtrip(ControlMessage::Challenge(ChallengeBody {
            session_nonce: [0x11; SESSION_NONCE_SIZE],
            replay_nonce: [0x33; REPLAY_NONCE_SIZE],
            timestamp_ms: 1_700_000_000_456,
            identity: vec![0x01, 0x02],
            kem_ciphertext: vec![0x03; 50],
            signature: vec![0x04; 10],
        }));
    }

    #[test]
    fn test_response_roundtrip() {
        roundtrip(ControlMessage::Response(ResponseBody {
            session_nonce: [0x11; SESSION_NONCE_SIZE],
            replay_nonce: [0x44; REPLAY_NONCE_SIZE],
            timestamp_ms: 7,
            transcript_hash: [0x55; TRANSCRIPT_HASH_SIZE],
            signature: vec![0x66; 64],
        }));
    }

    #[test]
    fn test_established_roundtrip() {
        for addr in ["203.0.113.9:9443", "[2001:db8::1]:9443"] {
            roundtrip(ControlMessage::Established(EstablishedBody {
                session_nonce: [0x11; SESSION_NONCE_SIZE],
                replay_nonce: [0x77; REPLAY_NONCE_SIZE],
                timestamp_ms: 99,
                session_id: [0x88; SESSION_ID_SIZE],
                transcript_hash: [0x99; TRANSCRIPT_HASH_SIZE],
                mtu: 1500,
                heartbeat_secs: 30,
                rekey_secs: 3600,
                observed_addr: addr.parse().unwrap(),
                supports_direct: true,
                signature: vec![0xAB; 128],
            }));
        }
    }

    #[test]
    fn test_plain_messages_roundtrip() {
        roundtrip(ControlMessage::EndpointNotify {
            addr: "10.0.0.1:9443".parse().unwrap(),
        });
        roundtrip(ControlMessage::Heartbeat {
            seq: 3,
            timestamp_ns: 123_456_789,
        });
        roundtrip(ControlMessage::HeartbeatAck {
            seq: 3,
            timestamp_ns: 123_999_999,
            echo_timestamp_ns: 123_456_789,
        });
        roundtrip(ControlMessage::RelayData(vec![0xDE, 0xAD, 0xBE, 0xEF]));
        roundtrip(ControlMessage::Goodbye { reason: 0 });
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        assert!(ControlMessage::decode(&[0xEE, 0x00]).is_err());
        assert!(ControlMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_truncation_and_trailing_bytes() {
        let encoded = ControlMessage::Heartbeat {
            seq: 1,
            timestamp_ns: 2,
        }
        .encode();
        assert!(ControlMessage::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut padded = encoded.clone();
        padded.push(0x00);
        assert!(ControlMessage::decode(&padded).is_err());
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let body = HelloBody {
            session_nonce: [0x11; SESSION_NONCE_SIZE],
            replay_nonce: [0x22; REPLAY_NONCE_SIZE],
            timestamp_ms: 1,
            identity: vec![0xAA; 4],
            kem_public: vec![0xBB; 4],
            signature: vec![0xCC; 4],
        };
        let mut other = body.clone();
        other.signature = vec![0xDD; 9];
        assert_eq!(body.signing_bytes(), other.signing_bytes());

        other.timestamp_ms = 2;
        assert_ne!(body.signing_bytes(), other.signing_bytes());
    }
}
