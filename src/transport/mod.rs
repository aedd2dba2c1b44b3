//! Transport seams: the reliable control channel and the unreliable
//! data channel.
//!
//! Both are object-safe traits so the concrete pairing (TLS/TCP + UDP
//! today, QUIC streams + QUIC datagrams tomorrow) stays swappable. The
//! relay adaptor reuses a control channel as a data channel for peers
//! without a direct path; the in-memory pair backs the loopback tests.

mod mem;
mod relay;
mod stream;
mod tls;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::TransportError;
use crate::wire::ControlMessage;

pub use mem::{memory_control_pair, memory_data_pair, MemoryDataChannel};
pub use relay::RelayDataChannel;
pub use stream::StreamControlChannel;
pub use tls::{dial_control, TlsControlChannel, TlsControlListener};
pub use udp::{UdpDataChannel, UdpProvider};

/// Reliable, ordered, message-framed channel for handshake and control
/// traffic.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send one control message.
    async fn send(&self, message: &ControlMessage) -> Result<(), TransportError>;

    /// Receive the next control message.
    ///
    /// Returns [`TransportError::Closed`] once the peer hangs up or
    /// [`ControlChannel::close`] is called, including for receives already
    /// parked at that moment.
    async fn recv(&self) -> Result<ControlMessage, TransportError>;

    /// The peer's observed source address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Local address of this channel.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Close the channel, waking pending receives.
    async fn close(&self);
}

/// Unreliable datagram channel for encrypted frames. Loss, reorder, and
/// duplication are expected; the AEAD replay window absorbs them.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one datagram to the configured remote.
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Receive one datagram into `buf` (cleared first); returns its length
    /// and source address.
    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), TransportError>;

    /// Point the channel at a remote endpoint.
    fn set_remote(&self, remote: SocketAddr);

    /// Currently configured remote, if any.
    fn remote(&self) -> Option<SocketAddr>;

    /// Local address of this channel.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Close the channel, waking pending receives.
    fn close(&self);
}

/// Binds fresh data channels for direct-path attempts. Concrete nodes
/// hand out UDP sockets; tests hand out in-memory links.
#[async_trait]
pub trait DataPathProvider: Send + Sync {
    /// Bind a new, unconnected data channel.
    async fn bind(&self) -> Result<Arc<dyn DataChannel>, TransportError>;
}
