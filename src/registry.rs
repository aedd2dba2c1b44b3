//! Peer registry: the in-process map from peer id to session.
//!
//! The registry is the ownership root of the data plane. It exclusively
//! owns sessions; pumps and drivers hold no back-references, so dropping
//! a session from the map (after Terminated) releases everything in
//! topological order. Reads vastly outnumber writes — `broadcast` runs
//! per forwarded frame on relay nodes — hence the read-write lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::core::TunnelConfig;
use crate::crypto::handshake::HandshakeOutcome;
use crate::crypto::identity::{NodeIdentity, PeerId};
use crate::device::L2Device;
use crate::directory::Directory;
use crate::pool::BufferPool;
use crate::session::{Session, SessionDeps, SessionSnapshot, SessionState};
use crate::transport::{ControlChannel, DataPathProvider};

/// Shared pieces every session driver needs, held once per node.
pub(crate) struct RegistryContext {
    pub identity: Arc<NodeIdentity>,
    pub directory: Arc<dyn Directory>,
    pub device: Arc<dyn L2Device>,
    pub pool: Arc<BufferPool>,
    pub config: TunnelConfig,
    pub data_path: Arc<dyn DataPathProvider>,
    pub supports_direct: bool,
    pub advertised_ip: Option<IpAddr>,
}

impl RegistryContext {
    fn deps(&self) -> SessionDeps {
        SessionDeps {
            identity: Arc::clone(&self.identity),
            directory: Arc::clone(&self.directory),
            device: Arc::clone(&self.device),
            pool: Arc::clone(&self.pool),
            config: self.config.clone(),
            data_path: Arc::clone(&self.data_path),
            supports_direct: self.supports_direct,
            advertised_ip: self.advertised_ip,
        }
    }
}

/// Map from peer id to the session owning that peer relationship.
pub struct PeerRegistry {
    ctx: RegistryContext,
    local_id: PeerId,
    sessions: RwLock<HashMap<PeerId, Arc<Session>>>,
}

impl PeerRegistry {
    pub(crate) fn new(ctx: RegistryContext) -> Arc<Self> {
        let local_id = ctx.identity.peer_id();
        Arc::new(Self {
            ctx,
            local_id,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Our own peer id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub(crate) fn tunnel_config(&self) -> TunnelConfig {
        self.ctx.config.clone()
    }

    /// Connect to a peer, creating a session if none is live.
    pub fn connect(&self, peer_id: PeerId) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&peer_id) {
            if !matches!(
                existing.state(),
                SessionState::Terminated | SessionState::Failed
            ) {
                return Arc::clone(existing);
            }
        }
        debug!(peer = %peer_id, "creating outbound session");
        let session = Session::spawn_outbound(peer_id, self.ctx.deps());
        sessions.insert(peer_id, Arc::clone(&session));
        session
    }

    /// Look up the session for a peer.
    pub fn get(&self, peer_id: PeerId) -> Option<Arc<Session>> {
        self.sessions.read().get(&peer_id).cloned()
    }

    /// Simultaneous-open arbitration for an inbound HELLO.
    ///
    /// The node with the lexicographically smaller peer id takes the
    /// responder role: it aborts its own outbound attempt and accepts the
    /// inbound handshake. The larger id refuses the inbound connection
    /// and keeps dialing; its HELLO is already on the way to the peer.
    pub(crate) fn accept_inbound(&self, peer_id: PeerId) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(&peer_id) {
            Some(existing)
                if matches!(
                    existing.state(),
                    SessionState::Idle
                        | SessionState::Dialing
                        | SessionState::Handshaking
                        | SessionState::Reconnecting
                ) =>
            {
                if self.local_id < peer_id {
                    debug!(peer = %peer_id, "simultaneous open, yielding to inbound");
                    existing.close();
                    true
                } else {
                    debug!(peer = %peer_id, "simultaneous open, refusing inbound");
                    false
                }
            }
            _ => true,
        }
    }

    /// Install a session for an inbound, already-handshaken connection.
    pub(crate) fn adopt_inbound(
        &self,
        peer_id: PeerId,
        control: Arc<dyn ControlChannel>,
        outcome: HandshakeOutcome,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.remove(&peer_id) {
            // A replaced session (stale establishment, lost tie-break)
            // shuts down as the new one comes up.
            existing.close();
        }
        debug!(peer = %peer_id, "adopting inbound session");
        let session = Session::spawn_inbound(peer_id, self.ctx.deps(), control, outcome);
        sessions.insert(peer_id, Arc::clone(&session));
        session
    }

    /// Fan a plaintext Ethernet frame to every established session.
    /// Relay nodes use this to forward between spokes; returns how many
    /// sessions took the frame.
    pub async fn broadcast(&self, frame: &[u8]) -> usize {
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|session| session.is_established())
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for session in targets {
            if session.send_frame(frame).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop sessions that reached a terminal state.
    pub fn prune(&self) {
        self.sessions.write().retain(|_, session| {
            !matches!(
                session.state(),
                SessionState::Terminated | SessionState::Failed
            )
        });
    }

    /// Status snapshot over every session.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .values()
            .map(|session| session.snapshot())
            .collect()
    }

    /// Close every session.
    pub fn close_all(&self) {
        for session in self.sessions.read().values() {
            session.close();
        }
    }

    /// Wait for every session to finish shutting down.
    pub async fn drained(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            session.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::core::constants::{DEFAULT_MTU, PEER_ID_SIZE};
    use crate::device::memory_device;
    use crate::directory::{Candidate, DirectoryError, PeerRecord};
    use crate::transport::UdpProvider;

    /// Directory whose lookups never resolve; keeps sessions in Dialing.
    struct StalledDirectory;

    #[async_trait]
    impl Directory for StalledDirectory {
        async fn register(&self, _record: PeerRecord) -> Result<(), DirectoryError> {
            Ok(())
        }
        async fn lookup(&self, _peer_id: PeerId) -> Result<Option<PeerRecord>, DirectoryError> {
            std::future::pending().await
        }
        async fn publish_candidates(
            &self,
            _peer_id: PeerId,
            _candidates: Vec<Candidate>,
        ) -> Result<(), DirectoryError> {
            Ok(())
        }
        async fn get_candidates(&self, _peer_id: PeerId) -> Result<Vec<Candidate>, DirectoryError> {
            Ok(Vec::new())
        }
    }

    fn test_registry() -> Arc<PeerRegistry> {
        let (device, _host) = memory_device("reg0", DEFAULT_MTU);
        std::mem::forget(_host);
        PeerRegistry::new(RegistryContext {
            identity: Arc::new(NodeIdentity::generate()),
            directory: Arc::new(StalledDirectory),
            device,
            pool: BufferPool::new(DEFAULT_MTU),
            config: TunnelConfig::default(),
            data_path: Arc::new(UdpProvider),
            supports_direct: true,
            advertised_ip: None,
        })
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_live() {
        let registry = test_registry();
        let peer = PeerId::from_bytes([0x44; PEER_ID_SIZE]);

        let first = registry.connect(peer);
        let second = registry.connect(peer);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.snapshot().len(), 1);
        first.close();
    }

    #[tokio::test]
    async fn test_simultaneous_open_smaller_id_yields() {
        let registry = test_registry();

        // Our digest is smaller than all-0xFF with overwhelming odds: we
        // are the responder and must abort the outbound attempt.
        let bigger = PeerId::from_bytes([0xFF; PEER_ID_SIZE]);
        let outbound = registry.connect(bigger);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.accept_inbound(bigger));
        tokio::time::timeout(Duration::from_secs(1), outbound.closed())
            .await
            .expect("losing outbound attempt shuts down");
    }

    #[tokio::test]
    async fn test_simultaneous_open_larger_id_refuses() {
        let registry = test_registry();

        // Our digest is larger than all-0x00: we stay the initiator and
        // refuse the inbound connection.
        let smaller = PeerId::from_bytes([0x00; PEER_ID_SIZE]);
        let outbound = registry.connect(smaller);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.accept_inbound(smaller));
        assert!(!matches!(
            outbound.state(),
            crate::session::SessionState::Terminated
        ));
        outbound.close();
    }

    #[tokio::test]
    async fn test_broadcast_skips_unestablished() {
        let registry = test_registry();
        let peer = PeerId::from_bytes([0x22; PEER_ID_SIZE]);
        let session = registry.connect(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still dialing: nothing established, nothing delivered.
        assert_eq!(registry.broadcast(&[0xAA; 60]).await, 0);
        session.close();
    }

    #[tokio::test]
    async fn test_prune_drops_terminated() {
        let registry = test_registry();
        let peer = PeerId::from_bytes([0x33; PEER_ID_SIZE]);
        let session = registry.connect(peer);
        session.close();
        session.closed().await;

        assert_eq!(registry.snapshot().len(), 1);
        registry.prune();
        assert!(registry.snapshot().is_empty());
        assert!(registry.get(peer).is_none());
    }
}
