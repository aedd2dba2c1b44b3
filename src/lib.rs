//! # pqmesh
//!
//! A post-quantum peer-to-peer Layer-2 overlay. Each node operates a
//! virtual Ethernet interface whose frames are encrypted, sequenced, and
//! forwarded to remote peers over an authenticated transport; a mesh of
//! nodes forms one private broadcast domain on top of the public
//! Internet.
//!
//! - **Hybrid security**: every handshake signs with Dilithium3 + Ed25519
//!   and key-exchanges with Kyber768 + X25519, so both a lattice and an
//!   elliptic-curve break are required to compromise a session.
//! - **Relay-first, direct-fast**: sessions come up over a TLS control
//!   channel immediately and migrate the data flow onto a direct UDP path
//!   when one can be confirmed, with automatic fallback.
//! - **Loss-tolerant data plane**: ChaCha20-Poly1305 per direction with
//!   sequence-derived nonces and a sliding replay window; drops are
//!   always preferred over stalls.
//!
//! ## Modules
//!
//! - [`core`]: constants, configuration, and the error taxonomy
//! - [`wire`]: frame and control-message codecs
//! - [`crypto`]: identity, hybrid KEM, key schedule, AEAD channels
//! - [`pool`]: bounded frame-buffer pool
//! - [`device`]: virtual interface adaptor
//! - [`transport`]: control/data channel seams and implementations
//! - [`directory`]: rendezvous client interface
//! - [`session`]: per-peer state machine and forwarding pumps
//! - [`registry`]: peer id → session map and relay fan-out
//! - [`node`]: process-level wiring
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pqmesh::prelude::*;
//!
//! # async fn run() -> Result<(), pqmesh::MeshError> {
//! let identity = Arc::new(NodeIdentity::generate());
//! let directory = Arc::new(InMemoryDirectory::new());
//! let (device, _host) = memory_device("mesh0", 1500);
//!
//! let node = MeshNode::start(
//!     identity,
//!     device,
//!     directory,
//!     NodeConfig::default(),
//! )
//! .await?;
//!
//! // Dial a peer previously registered in the directory.
//! # let peer_id = node.peer_id();
//! let session = node.connect(peer_id);
//! let _states = session.subscribe();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod crypto;
pub mod device;
pub mod directory;
pub mod node;
pub mod pool;
pub mod registry;
pub mod session;
pub mod transport;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{MeshError, NodeConfig, TunnelConfig};
    pub use crate::crypto::{IdentityPublic, NodeIdentity, PeerId};
    pub use crate::device::{memory_device, DeviceHost, L2Device};
    pub use crate::directory::{
        Candidate, CandidateKind, Directory, InMemoryDirectory, PeerRecord,
    };
    pub use crate::node::MeshNode;
    pub use crate::registry::PeerRegistry;
    pub use crate::session::{Session, SessionSnapshot, SessionState, StatsSnapshot};
}

pub use core::{MeshError, NodeConfig, TunnelConfig};
pub use crypto::{NodeIdentity, PeerId};
pub use node::MeshNode;
pub use session::{Session, SessionState};
