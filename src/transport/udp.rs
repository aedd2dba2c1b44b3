//! UDP data transport.
//!
//! Thin wrapper around a tokio UDP socket with the receive buffer
//! enlarged well past the OS default so traffic bursts queue in the
//! kernel instead of dropping at the socket. Failure to enlarge is
//! logged, not fatal: some environments cap SO_RCVBUF and the tunnel
//! still works, just with less burst headroom.

use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::sync::Arc;

use crate::core::constants::DATA_RECV_BUFFER_SIZE;
use crate::core::TransportError;
use crate::transport::{DataChannel, DataPathProvider};

/// [`DataChannel`] over UDP.
pub struct UdpDataChannel {
    socket: UdpSocket,
    remote: Mutex<Option<SocketAddr>>,
    closed: CancellationToken,
}

impl UdpDataChannel {
    /// Bind a data socket and enlarge its receive buffer.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;

        let sock_ref = socket2::SockRef::from(&socket);
        if let Err(e) = sock_ref.set_recv_buffer_size(DATA_RECV_BUFFER_SIZE) {
            warn!(error = %e, "could not enlarge data socket receive buffer");
        } else {
            debug!(
                requested = DATA_RECV_BUFFER_SIZE,
                granted = sock_ref.recv_buffer_size().unwrap_or(0),
                "data socket receive buffer"
            );
        }

        Ok(Self {
            socket,
            remote: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    /// Bind with the remote already set.
    pub async fn bind_connected(
        addr: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Self, TransportError> {
        let channel = Self::bind(addr).await?;
        channel.set_remote(remote);
        Ok(channel)
    }
}

/// Hands out ephemeral UDP data sockets.
pub struct UdpProvider;

#[async_trait]
impl DataPathProvider for UdpProvider {
    async fn bind(&self) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = UdpDataChannel::bind("0.0.0.0:0".parse().expect("static addr")).await?;
        Ok(Arc::new(channel))
    }
}

#[async_trait]
impl DataChannel for UdpDataChannel {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let remote = (*self.remote.lock())
            .ok_or_else(|| TransportError::Io(std::io::ErrorKind::NotConnected.into()))?;
        self.socket.send_to(datagram, remote).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), TransportError> {
        buf.clear();
        buf.resize(buf.capacity().max(2048), 0);
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = self.socket.recv_from(buf.as_mut_slice()) => {
                let (len, src) = result?;
                buf.truncate(len);
                Ok((len, src))
            }
        }
    }

    fn set_remote(&self, remote: SocketAddr) {
        *self.remote.lock() = Some(remote);
    }

    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let a = UdpDataChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = UdpDataChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        a.set_remote(b.local_addr().unwrap());
        b.set_remote(a.local_addr().unwrap());

        a.send(&[0x42; 1200]).await.unwrap();

        let mut buf = Vec::with_capacity(2048);
        let (len, src) = b.recv(&mut buf).await.unwrap();
        assert_eq!(len, 1200);
        assert_eq!(&buf[..], &[0x42; 1200][..]);
        assert_eq!(src, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_without_remote_fails() {
        let a = UdpDataChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(a.send(&[0x01]).await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let channel = Arc::new(
            UdpDataChannel::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                let mut buf = Vec::with_capacity(2048);
                channel.recv(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("recv must unblock")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
