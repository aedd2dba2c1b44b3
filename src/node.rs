//! Process surface: one overlay node.
//!
//! A node binds the control listener, registers with the directory,
//! accepts inbound handshakes, and owns the peer registry. Startup needs
//! a loaded identity, a directory client, and an L2 device handle;
//! shutdown stops the sessions, closes the device, and releases the
//! sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::constants::SHUTDOWN_DEADLINE;
use crate::core::{MeshError, NodeConfig};
use crate::crypto::handshake::{ResponderConfig, ResponderHandshake};
use crate::crypto::identity::{IdentityPublic, NodeIdentity, PeerId};
use crate::device::L2Device;
use crate::directory::{Candidate, CandidateKind, Directory, PeerRecord};
use crate::pool::BufferPool;
use crate::registry::{PeerRegistry, RegistryContext};
use crate::session::Session;
use crate::transport::{ControlChannel, TlsControlListener};
use crate::wire::ControlMessage;

/// One running overlay node.
pub struct MeshNode {
    identity: Arc<NodeIdentity>,
    registry: Arc<PeerRegistry>,
    device: Arc<dyn L2Device>,
    control_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl MeshNode {
    /// Bind, register with the directory, and start accepting peers.
    pub async fn start(
        identity: Arc<NodeIdentity>,
        device: Arc<dyn L2Device>,
        directory: Arc<dyn Directory>,
        config: NodeConfig,
    ) -> Result<Arc<Self>, MeshError> {
        let listener = TlsControlListener::bind(config.control_bind).await?;
        let control_addr = listener.local_addr()?;

        let advertised_ip = config
            .advertised_ip
            .unwrap_or_else(|| match control_addr.ip() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                ip => ip,
            });

        let registry = PeerRegistry::new(RegistryContext {
            identity: Arc::clone(&identity),
            directory: Arc::clone(&directory),
            device: Arc::clone(&device),
            pool: BufferPool::new(device.mtu()),
            config: config.tunnel.clone(),
            data_path: Arc::new(crate::transport::UdpProvider),
            supports_direct: true,
            advertised_ip: Some(advertised_ip),
        });
        let record = PeerRecord {
            peer_id: identity.peer_id(),
            ip: advertised_ip,
            control_port: control_addr.port(),
            data_port: config.data_bind.port(),
            is_public_relay: config.is_public_relay,
            long_term_public_key: identity.public().to_bytes(),
            last_seen: SystemTime::now(),
        };
        directory
            .register(record)
            .await
            .map_err(|e| MeshError::Config(e.to_string()))?;
        directory
            .publish_candidates(
                identity.peer_id(),
                vec![Candidate {
                    ip: advertised_ip,
                    port: control_addr.port(),
                    kind: CandidateKind::Host,
                    priority: 0,
                }],
            )
            .await
            .map_err(|e| MeshError::Config(e.to_string()))?;

        let node = Arc::new(Self {
            identity,
            registry,
            device,
            control_addr,
            shutdown: CancellationToken::new(),
        });

        node.spawn_accept_loop(listener, config.tunnel.handshake_timeout);
        info!(peer = %node.peer_id(), addr = %control_addr, "node up");

        for peer_id in config.connect_eagerly {
            node.connect(peer_id);
        }
        Ok(node)
    }

    /// Our peer id.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Bound control listener address.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Dial a peer (idempotent while a session is live).
    pub fn connect(&self, peer_id: PeerId) -> Arc<Session> {
        self.registry.connect(peer_id)
    }

    /// Stop the node: close sessions, the listener, and the device.
    pub async fn shutdown(&self) {
        info!(peer = %self.peer_id(), "node shutting down");
        self.shutdown.cancel();
        self.registry.close_all();
        let _ = tokio::time::timeout(SHUTDOWN_DEADLINE, self.registry.drained()).await;
        self.device.close();
    }

    fn spawn_accept_loop(
        self: &Arc<Self>,
        listener: TlsControlListener,
        handshake_timeout: std::time::Duration,
    ) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(channel) => {
                            let node = Arc::clone(&node);
                            tokio::spawn(async move {
                                if let Err(error) =
                                    node.handle_inbound(channel, handshake_timeout).await
                                {
                                    debug!(%error, "inbound handshake failed");
                                }
                            });
                        }
                        Err(error) => {
                            warn!(%error, "accept failed");
                        }
                    },
                }
            }
        });
    }

    async fn handle_inbound(
        &self,
        channel: crate::transport::TlsControlChannel,
        handshake_timeout: std::time::Duration,
    ) -> Result<(), MeshError> {
        let first = tokio::time::timeout(handshake_timeout, channel.recv())
            .await
            .map_err(|_| MeshError::Config("inbound handshake timed out".into()))?
            .map_err(MeshError::Transport)?;

        let hello = match first {
            ControlMessage::Hello(body) => body,
            other => {
                channel.close().await;
                return Err(MeshError::Config(format!(
                    "inbound connection opened with {}",
                    other.kind_name()
                )));
            }
        };

        let peer_id = match IdentityPublic::from_bytes(&hello.identity) {
            Ok(identity) => identity.peer_id(),
            Err(_) => {
                channel.close().await;
                return Err(MeshError::Config("inbound hello with bad identity".into()));
            }
        };
        if peer_id == self.peer_id() {
            channel.close().await;
            return Err(MeshError::Config("refusing connection to self".into()));
        }

        let tunnel = self.registry.tunnel_config();
        let responder = ResponderHandshake::new(
            Arc::clone(&self.identity),
            ResponderConfig {
                mtu: self.device.mtu() as u16,
                heartbeat: tunnel.heartbeat_interval,
                rekey: tunnel.rekey_interval,
                observed_peer_addr: channel
                    .peer_addr()
                    .unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr")),
                supports_direct: true,
            },
            None,
            None,
        );

        let (challenge, awaiting) = responder
            .hello(&hello)
            .map_err(|e| MeshError::Session(e.into()))?;

        // Arbitrate a simultaneous open only once the dialer is
        // authenticated; a spoofed HELLO must not abort a genuine attempt.
        if !self.registry.accept_inbound(peer_id) {
            channel.close().await;
            return Ok(());
        }
        channel.send(&challenge).await?;

        let response = tokio::time::timeout(handshake_timeout, channel.recv())
            .await
            .map_err(|_| MeshError::Config("inbound handshake timed out".into()))?
            .map_err(MeshError::Transport)?;
        let response = match response {
            ControlMessage::Response(body) => body,
            other => {
                channel.close().await;
                return Err(MeshError::Config(format!(
                    "expected response, got {}",
                    other.kind_name()
                )));
            }
        };

        let (established, outcome) = awaiting
            .response(&response)
            .map_err(|e| MeshError::Session(e.into()))?;
        channel.send(&established).await?;

        let control: Arc<dyn ControlChannel> = Arc::new(channel);
        self.registry.adopt_inbound(peer_id, control, outcome);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::device::{memory_device, DeviceHost};
    use crate::directory::InMemoryDirectory;
    use crate::session::SessionState;

    fn test_config() -> NodeConfig {
        NodeConfig {
            control_bind: "127.0.0.1:0".parse().unwrap(),
            data_bind: "127.0.0.1:0".parse().unwrap(),
            advertised_ip: None,
            is_public_relay: false,
            connect_eagerly: Vec::new(),
            tunnel: crate::core::TunnelConfig {
                dial_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(5),
                migration_quiescence: Duration::from_millis(300),
                ..Default::default()
            },
        }
    }

    async fn start_node(
        name: &str,
        directory: Arc<InMemoryDirectory>,
    ) -> (Arc<MeshNode>, DeviceHost) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let identity = Arc::new(NodeIdentity::generate());
        let (device, host) = memory_device(name, 1500);
        let node = MeshNode::start(identity, device, directory, test_config())
            .await
            .unwrap();
        (node, host)
    }

    /// Poll the registry rather than one session handle: the tie-break may
    /// replace the session object mid-flight.
    async fn wait_established(node: &MeshNode, peer: PeerId, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if node
                .registry()
                .get(peer)
                .is_some_and(|session| session.is_established())
            {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session to {peer} never established"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_two_nodes_tunnel_one_frame() {
        let directory = Arc::new(InMemoryDirectory::new());
        let (node_a, host_a) = start_node("tap-a", Arc::clone(&directory)).await;
        let (node_b, host_b) = start_node("tap-b", Arc::clone(&directory)).await;

        let session = node_a.connect(node_b.peer_id());
        let mut rx = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|state| state.is_established()),
        )
        .await
        .expect("dialing node establishes")
        .unwrap();

        // The acceptor's session shows up and establishes too.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if node_b
                .registry()
                .get(node_a.peer_id())
                .is_some_and(|s| s.is_established())
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "acceptor never established");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // One Ethernet frame through the full stack.
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xFF; 6]);
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&[0x08, 0x00]);
        frame.extend_from_slice(&[0xAB; 64]);

        host_a.inject(&frame).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), host_b.next_frame())
            .await
            .expect("frame crosses the overlay")
            .unwrap();
        assert_eq!(delivered, frame);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.stats.tx_frames, 1);
        assert!(snapshot.session_id.is_some());

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_simultaneous_open_converges() {
        let directory = Arc::new(InMemoryDirectory::new());
        let (node_a, host_a) = start_node("tap-a", Arc::clone(&directory)).await;
        let (node_b, host_b) = start_node("tap-b", Arc::clone(&directory)).await;

        // Both sides dial at once; the tie-break leaves one live session
        // per registry.
        node_a.connect(node_b.peer_id());
        node_b.connect(node_a.peer_id());

        wait_established(&node_a, node_b.peer_id(), Duration::from_secs(15)).await;
        wait_established(&node_b, node_a.peer_id(), Duration::from_secs(15)).await;

        host_a.inject(&[0x01; 60]).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), host_b.next_frame())
            .await
            .expect("a to b after simultaneous open")
            .unwrap();
        assert_eq!(delivered, vec![0x01; 60]);

        host_b.inject(&[0x02; 60]).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(2), host_a.next_frame())
            .await
            .expect("b to a after simultaneous open")
            .unwrap();
        assert_eq!(delivered, vec![0x02; 60]);

        node_a.registry().prune();
        assert_eq!(node_a.registry().snapshot().len(), 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_terminates_sessions_and_device() {
        let directory = Arc::new(InMemoryDirectory::new());
        let (node_a, _host_a) = start_node("tap-a", Arc::clone(&directory)).await;
        let (node_b, _host_b) = start_node("tap-b", Arc::clone(&directory)).await;

        let session = node_a.connect(node_b.peer_id());
        let mut rx = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(10),
            rx.wait_for(|state| state.is_established()),
        )
        .await
        .expect("establishes before shutdown")
        .unwrap();

        node_a.shutdown().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.holds_keys());

        // The peer hears the goodbye.
        let peer_session = node_b.registry().get(node_a.peer_id()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), peer_session.closed())
            .await
            .expect("peer session ends on goodbye");

        node_b.shutdown().await;
    }
}
