//! Rendezvous directory client interface.
//!
//! The directory service itself (authentication, persistence, attestation)
//! is an external collaborator; the core consumes a small client trait:
//! resolve a peer id to reachability information and publish our own.
//! [`InMemoryDirectory`] implements it for tests and single-process
//! meshes.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::crypto::PeerId;

/// Directory client failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory cannot be reached or refused the request.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// How a reachability candidate was learned, in dialing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CandidateKind {
    /// Address bound on the peer's own interfaces.
    Host,
    /// Address observed by another party across the peer's NAT.
    ServerReflexive,
    /// A public relay willing to forward for the peer.
    Relay,
}

/// One way to reach a peer's control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Candidate IP.
    pub ip: IpAddr,
    /// Candidate control port.
    pub port: u16,
    /// Provenance of the address.
    pub kind: CandidateKind,
    /// Tie-break within a kind; higher dials first.
    pub priority: u32,
}

impl Candidate {
    /// The dialable address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Sort candidates into dialing order: host, then server-reflexive, then
/// relay; higher priority first within a kind.
pub fn dialing_order(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.kind.cmp(&b.kind).then(b.priority.cmp(&a.priority)));
    candidates
}

/// A directory entry for one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's id.
    pub peer_id: PeerId,
    /// Declared public IP.
    pub ip: IpAddr,
    /// Control (TLS) port.
    pub control_port: u16,
    /// Data (datagram) port.
    pub data_port: u16,
    /// Whether the peer forwards for others.
    pub is_public_relay: bool,
    /// Serialized long-term public keys ([`crate::crypto::IdentityPublic`]).
    pub long_term_public_key: Vec<u8>,
    /// When the directory last heard from the peer.
    pub last_seen: SystemTime,
}

impl PeerRecord {
    /// The peer's control endpoint as a host candidate.
    pub fn host_candidate(&self) -> Candidate {
        Candidate {
            ip: self.ip,
            port: self.control_port,
            kind: CandidateKind::Host,
            priority: 0,
        }
    }
}

/// Client view of the rendezvous directory.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish or refresh our own record.
    async fn register(&self, record: PeerRecord) -> Result<(), DirectoryError>;

    /// Resolve a peer id to its record.
    async fn lookup(&self, peer_id: PeerId) -> Result<Option<PeerRecord>, DirectoryError>;

    /// Publish our current candidate list.
    async fn publish_candidates(
        &self,
        peer_id: PeerId,
        candidates: Vec<Candidate>,
    ) -> Result<(), DirectoryError>;

    /// Fetch a peer's published candidates.
    async fn get_candidates(&self, peer_id: PeerId) -> Result<Vec<Candidate>, DirectoryError>;
}

#[derive(Default)]
struct DirectoryState {
    records: HashMap<PeerId, PeerRecord>,
    candidates: HashMap<PeerId, Vec<Candidate>>,
}

/// Process-local directory for tests and single-host meshes.
#[derive(Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn register(&self, record: PeerRecord) -> Result<(), DirectoryError> {
        self.state.write().records.insert(record.peer_id, record);
        Ok(())
    }

    async fn lookup(&self, peer_id: PeerId) -> Result<Option<PeerRecord>, DirectoryError> {
        Ok(self.state.read().records.get(&peer_id).cloned())
    }

    async fn publish_candidates(
        &self,
        peer_id: PeerId,
        candidates: Vec<Candidate>,
    ) -> Result<(), DirectoryError> {
        self.state.write().candidates.insert(peer_id, candidates);
        Ok(())
    }

    async fn get_candidates(&self, peer_id: PeerId) -> Result<Vec<Candidate>, DirectoryError> {
        Ok(self
            .state
            .read()
            .candidates
            .get(&peer_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::PEER_ID_SIZE;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_bytes([byte; PEER_ID_SIZE])
    }

    fn candidate(kind: CandidateKind, priority: u32) -> Candidate {
        Candidate {
            ip: "192.0.2.1".parse().unwrap(),
            port: 8443,
            kind,
            priority,
        }
    }

    #[test]
    fn test_dialing_order() {
        let ordered = dialing_order(vec![
            candidate(CandidateKind::Relay, 100),
            candidate(CandidateKind::Host, 1),
            candidate(CandidateKind::ServerReflexive, 50),
            candidate(CandidateKind::Host, 9),
        ]);
        let kinds: Vec<_> = ordered.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CandidateKind::Host,
                CandidateKind::Host,
                CandidateKind::ServerReflexive,
                CandidateKind::Relay
            ]
        );
        // Higher priority first within the same kind.
        assert_eq!(ordered[0].priority, 9);
    }

    #[tokio::test]
    async fn test_register_lookup() {
        let directory = InMemoryDirectory::new();
        assert!(directory.lookup(peer(1)).await.unwrap().is_none());

        let record = PeerRecord {
            peer_id: peer(1),
            ip: "203.0.113.4".parse().unwrap(),
            control_port: 8443,
            data_port: 9443,
            is_public_relay: false,
            long_term_public_key: vec![0xAA],
            last_seen: SystemTime::now(),
        };
        directory.register(record.clone()).await.unwrap();

        let found = directory.lookup(peer(1)).await.unwrap().unwrap();
        assert_eq!(found.control_port, 8443);
        assert_eq!(found.host_candidate().addr(), "203.0.113.4:8443".parse().unwrap());
    }

    #[tokio::test]
    async fn test_candidates_roundtrip() {
        let directory = InMemoryDirectory::new();
        assert!(directory.get_candidates(peer(2)).await.unwrap().is_empty());

        directory
            .publish_candidates(peer(2), vec![candidate(CandidateKind::Host, 3)])
            .await
            .unwrap();
        assert_eq!(directory.get_candidates(peer(2)).await.unwrap().len(), 1);
    }
}
