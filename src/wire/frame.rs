//! Wire frame encoding and decoding.
//!
//! Every datagram on the data path carries a fixed 27-byte big-endian
//! header followed by the AEAD ciphertext and tag:
//!
//! ```text
//! offset  size  field
//! 0       4     magic ("PMSH")
//! 4       2     version
//! 6       1     type
//! 7       1     flags (bit 0 = last-in-burst)
//! 8       8     sequence number
//! 16      8     sender timestamp (ns, RTT only, not trusted)
//! 24      2     payload length (post-encryption, including tag)
//! 26      1     reserved = 0
//! ```
//!
//! The header doubles as the AEAD associated data, so any in-window bit
//! flip that survives decoding is still caught by the tag check.

use crate::core::constants::{
    AEAD_TAG_SIZE, FLAG_LAST_IN_BURST, FRAME_HEADER_SIZE, FRAME_MAGIC, FRAME_TYPE_CONTROL,
    FRAME_TYPE_DATA, FRAME_TYPE_ENDPOINT_NOTIFY, FRAME_TYPE_KEEPALIVE, PROTOCOL_VERSION,
};
use crate::core::FrameError;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Encrypted Ethernet payload.
    Data = FRAME_TYPE_DATA,
    /// Data-path keepalive, empty encrypted payload.
    Keepalive = FRAME_TYPE_KEEPALIVE,
    /// Direct-path probe carrying the sender's data endpoint.
    EndpointNotify = FRAME_TYPE_ENDPOINT_NOTIFY,
    /// In-band control payload.
    Control = FRAME_TYPE_CONTROL,
}

impl FrameType {
    /// Parse a frame type from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            FRAME_TYPE_DATA => Some(Self::Data),
            FRAME_TYPE_KEEPALIVE => Some(Self::Keepalive),
            FRAME_TYPE_ENDPOINT_NOTIFY => Some(Self::EndpointNotify),
            FRAME_TYPE_CONTROL => Some(Self::Control),
            _ => None,
        }
    }

    /// Wire byte for this type.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Frame flags. Bit 0 marks the last frame of a burst; the remaining bits
/// are reserved and must be zero on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Last frame in a burst.
    pub const LAST_IN_BURST: Self = Self(FLAG_LAST_IN_BURST);

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Construct from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Whether the last-in-burst bit is set.
    pub fn is_last_in_burst(self) -> bool {
        self.0 & FLAG_LAST_IN_BURST != 0
    }

    /// Reserved bits must be zero.
    pub fn is_valid(self) -> bool {
        self.0 & !FLAG_LAST_IN_BURST == 0
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type.
    pub frame_type: FrameType,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Per-direction monotonic sequence number.
    pub sequence: u64,
    /// Sender timestamp in nanoseconds. RTT estimation only.
    pub timestamp_ns: u64,
    /// Ciphertext length including the AEAD tag.
    pub payload_len: u16,
}

impl FrameHeader {
    /// Header for an encrypted Ethernet frame of `plaintext_len` bytes.
    pub fn data(sequence: u64, timestamp_ns: u64, plaintext_len: usize) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags: FrameFlags::NONE,
            sequence,
            timestamp_ns,
            payload_len: (plaintext_len + AEAD_TAG_SIZE) as u16,
        }
    }

    /// Header for a frame of the given type and plaintext length.
    pub fn typed(
        frame_type: FrameType,
        sequence: u64,
        timestamp_ns: u64,
        plaintext_len: usize,
    ) -> Self {
        Self {
            frame_type,
            flags: FrameFlags::NONE,
            sequence,
            timestamp_ns,
            payload_len: (plaintext_len + AEAD_TAG_SIZE) as u16,
        }
    }

    /// Serialize into the fixed header layout.
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Write the header into the first [`FRAME_HEADER_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than the header. Callers hand in pooled
    /// buffers that always have the headroom.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf[6] = self.frame_type.as_byte();
        buf[7] = self.flags.as_byte();
        buf[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf[16..24].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        buf[24..26].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[26] = 0;
    }

    /// Decode and validate a header from the front of `data`.
    ///
    /// `max_payload` bounds the declared ciphertext length (MTU + AEAD
    /// overhead + slack). The ciphertext itself may extend past `data` when
    /// the caller has only the header so far; use [`decode_frame`] to also
    /// require the full payload.
    pub fn decode(data: &[u8], max_payload: usize) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Short {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let version = u16::from_be_bytes([data[4], data[5]]);
        if magic != FRAME_MAGIC || version != PROTOCOL_VERSION {
            return Err(FrameError::Malformed);
        }

        let frame_type = FrameType::from_byte(data[6]).ok_or(FrameError::Malformed)?;
        let flags = FrameFlags::from_byte(data[7]);
        if !flags.is_valid() || data[26] != 0 {
            return Err(FrameError::Malformed);
        }

        let sequence = u64::from_be_bytes(data[8..16].try_into().expect("8 bytes"));
        let timestamp_ns = u64::from_be_bytes(data[16..24].try_into().expect("8 bytes"));
        let payload_len = u16::from_be_bytes([data[24], data[25]]);

        if (payload_len as usize) < AEAD_TAG_SIZE {
            return Err(FrameError::Malformed);
        }
        if payload_len as usize > max_payload {
            return Err(FrameError::TooLarge {
                len: FRAME_HEADER_SIZE + payload_len as usize,
                limit: FRAME_HEADER_SIZE + max_payload,
            });
        }

        Ok(Self {
            frame_type,
            flags,
            sequence,
            timestamp_ns,
            payload_len,
        })
    }
}

/// Decode a complete frame: validated header plus the ciphertext slice.
pub fn decode_frame(data: &[u8], max_payload: usize) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = FrameHeader::decode(data, max_payload)?;
    let total = FRAME_HEADER_SIZE + header.payload_len as usize;
    if data.len() < total {
        return Err(FrameError::Short {
            expected: total,
            actual: data.len(),
        });
    }
    Ok((header, &data[FRAME_HEADER_SIZE..total]))
}
