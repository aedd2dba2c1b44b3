//! Protocol constants.
//!
//! These values are fixed by the wire protocol and MUST NOT be changed
//! without a version bump.

use std::time::Duration;

// =============================================================================
// WIRE FRAME
// =============================================================================

/// Protocol magic tag, first four bytes of every frame ("PMSH").
pub const FRAME_MAGIC: u32 = 0x504D_5348;

/// Protocol version (v1).
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Fixed frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 27;

/// Encrypted Ethernet payload.
pub const FRAME_TYPE_DATA: u8 = 0x01;

/// Data-path keepalive (empty encrypted payload).
pub const FRAME_TYPE_KEEPALIVE: u8 = 0x02;

/// Direct-path probe carrying the sender's data endpoint.
pub const FRAME_TYPE_ENDPOINT_NOTIFY: u8 = 0x03;

/// In-band control payload on the data path.
pub const FRAME_TYPE_CONTROL: u8 = 0x04;

/// Flag bit 0: last frame of a burst.
pub const FLAG_LAST_IN_BURST: u8 = 0x01;

// =============================================================================
// AEAD
// =============================================================================

/// ChaCha20-Poly1305 key size.
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size (direction salt || sequence).
pub const AEAD_NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Per-direction nonce salt size.
pub const DIRECTION_SALT_SIZE: usize = 4;

/// Sliding replay window size in sequence numbers.
pub const REPLAY_WINDOW: usize = 1024;

// =============================================================================
// IDENTITY AND HANDSHAKE
// =============================================================================

/// Peer id size: SHA-256 digest over the concatenated long-term public keys.
pub const PEER_ID_SIZE: usize = 32;

/// Session identifier size, assigned by the responder in ESTABLISHED.
pub const SESSION_ID_SIZE: usize = 16;

/// Handshake session nonce size.
pub const SESSION_NONCE_SIZE: usize = 16;

/// Handshake per-message replay nonce size.
pub const REPLAY_NONCE_SIZE: usize = 16;

/// Transcript hash size (SHA-256).
pub const TRANSCRIPT_HASH_SIZE: usize = 32;

/// Resumption secret size, mixed into the rekey key schedule.
pub const RESUMPTION_SECRET_SIZE: usize = 32;

/// Ed25519 signature size (the classical half of a hybrid signature).
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Maximum tolerated clock drift on handshake timestamps.
pub const HANDSHAKE_MAX_SKEW: Duration = Duration::from_secs(300);

/// Budget for each handshake message exchange.
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// CONTROL CHANNEL
// =============================================================================

/// Maximum length-prefixed control message size.
pub const CONTROL_MESSAGE_MAX: usize = 64 * 1024;

/// Heartbeat interval on the control channel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive heartbeat misses before the session degrades.
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;

// =============================================================================
// SESSION LIFECYCLE
// =============================================================================

/// Per-candidate control connection attempt budget.
pub const CANDIDATE_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Direct-path migration attempt budget.
pub const MIGRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiescence window before the relay path is demoted after migration.
pub const MIGRATION_QUIESCENCE: Duration = Duration::from_secs(2);

/// Session key lifetime before a rekey handshake is forced.
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Old receive keys stay valid this long after a rekey swap.
pub const REKEY_GRACE: Duration = Duration::from_secs(2);

/// First reconnect backoff step; doubles up to [`RECONNECT_BACKOFF_CAP`].
pub const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Wait for an inbound HELLO after losing the simultaneous-open tie-break.
pub const SIMULTANEOUS_OPEN_WAIT: Duration = Duration::from_secs(2);

/// Target bound for all session tasks to exit after `close()`.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(1);

// =============================================================================
// BUFFERS AND SOCKETS
// =============================================================================

/// Default interface MTU when the device does not report one.
pub const DEFAULT_MTU: usize = 1500;

/// Extra headroom in pooled buffers beyond MTU + header + tag.
pub const FRAME_SLACK: usize = 64;

/// Maximum in-flight frames per direction; the pool holds twice this.
pub const MAX_IN_FLIGHT_FRAMES: usize = 64;

/// Target UDP receive buffer size for the data transport.
pub const DATA_RECV_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Total on-wire size of a frame carrying `payload` plaintext bytes.
pub const fn wire_frame_size(payload: usize) -> usize {
    FRAME_HEADER_SIZE + payload + AEAD_TAG_SIZE
}

/// Capacity of a pooled buffer for a device with the given MTU.
pub const fn pooled_buffer_capacity(mtu: usize) -> usize {
    FRAME_HEADER_SIZE + mtu + AEAD_TAG_SIZE + FRAME_SLACK
}
