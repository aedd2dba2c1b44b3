//! In-process transports for tests and single-host meshes.
//!
//! The control pair is the stream framing over a tokio duplex pipe; the
//! data pair models a lossy datagram link: sends never block, and frames
//! beyond the queue depth (or while blackholed) simply disappear, which
//! is exactly the contract the forwarding pipeline is built for.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::constants::CONTROL_MESSAGE_MAX;
use crate::core::TransportError;
use crate::transport::{DataChannel, StreamControlChannel};

/// Queue depth of the simulated datagram link.
const MEM_LINK_DEPTH: usize = 512;

/// Connected control-channel pair over an in-process pipe.
pub fn memory_control_pair() -> (
    StreamControlChannel<tokio::io::DuplexStream>,
    StreamControlChannel<tokio::io::DuplexStream>,
) {
    let (a, b) = tokio::io::duplex(CONTROL_MESSAGE_MAX * 4);
    (
        StreamControlChannel::new(a, None, None),
        StreamControlChannel::new(b, None, None),
    )
}

/// One endpoint of a simulated datagram link.
pub struct MemoryDataChannel {
    local: SocketAddr,
    peer: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    remote: SyncMutex<Option<SocketAddr>>,
    /// Drop everything sent while set; models a dead direct path.
    blackhole: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl MemoryDataChannel {
    /// Silently drop all outbound datagrams from this endpoint.
    pub fn set_blackhole(&self, enabled: bool) {
        self.blackhole.store(enabled, Ordering::Release);
    }
}

/// Connected lossy datagram pair between two synthetic addresses.
pub fn memory_data_pair(
    addr_a: SocketAddr,
    addr_b: SocketAddr,
) -> (Arc<MemoryDataChannel>, Arc<MemoryDataChannel>) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(MEM_LINK_DEPTH);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(MEM_LINK_DEPTH);
    (
        Arc::new(MemoryDataChannel {
            local: addr_a,
            peer: addr_b,
            outbound: a_to_b_tx,
            inbound: Mutex::new(b_to_a_rx),
            remote: SyncMutex::new(Some(addr_b)),
            blackhole: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
        }),
        Arc::new(MemoryDataChannel {
            local: addr_b,
            peer: addr_a,
            outbound: b_to_a_tx,
            inbound: Mutex::new(a_to_b_rx),
            remote: SyncMutex::new(Some(addr_a)),
            blackhole: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
        }),
    )
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.blackhole.load(Ordering::Acquire) {
            // The wire ate it. Datagram links do that.
            return Ok(());
        }
        // Full queue = congested link = loss, never backpressure.
        let _ = self.outbound.try_send(datagram.to_vec());
        Ok(())
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    buf.clear();
                    buf.extend_from_slice(&frame);
                    Ok((frame.len(), self.peer))
                }
                None => Err(TransportError::Closed),
            },
        }
    }

    fn set_remote(&self, remote: SocketAddr) {
        *self.remote.lock() = Some(remote);
    }

    fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let (a, b) = memory_data_pair(addr(1000), addr(2000));
        a.send(&[0x11; 100]).await.unwrap();

        let mut buf = Vec::new();
        let (len, src) = b.recv(&mut buf).await.unwrap();
        assert_eq!(len, 100);
        assert_eq!(src, addr(1000));
    }

    #[tokio::test]
    async fn test_blackhole_drops_silently() {
        let (a, b) = memory_data_pair(addr(1000), addr(2000));
        a.set_blackhole(true);
        a.send(&[0x22; 10]).await.unwrap();
        a.set_blackhole(false);
        a.send(&[0x33; 10]).await.unwrap();

        let mut buf = Vec::new();
        let (_, _) = b.recv(&mut buf).await.unwrap();
        // Only the post-blackhole frame arrives.
        assert_eq!(buf, vec![0x33; 10]);
    }

    #[tokio::test]
    async fn test_overflow_is_loss_not_backpressure() {
        let (a, _b) = memory_data_pair(addr(1000), addr(2000));
        // Far past the queue depth; send must never block or fail.
        for _ in 0..2 * MEM_LINK_DEPTH {
            a.send(&[0x44; 8]).await.unwrap();
        }
    }
}
