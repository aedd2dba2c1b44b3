//! Relay-mediated data path.
//!
//! Before a direct path exists (and again after a direct path dies),
//! encrypted wire frames ride the reliable control channel as
//! `RelayData` messages. This adaptor presents that as a [`DataChannel`]
//! so the forwarding pumps never care which path they are bound to.
//!
//! Outbound frames are written straight to the control channel; inbound
//! `RelayData` payloads are fed in by the session's control reader, which
//! owns the control channel's receive side.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::TransportError;
use crate::transport::{ControlChannel, DataChannel};
use crate::wire::ControlMessage;

/// Frames queued from the control reader toward the relay RX pump.
const RELAY_INBOUND_DEPTH: usize = 256;

/// [`DataChannel`] tunnelled through a [`ControlChannel`].
pub struct RelayDataChannel {
    control: Arc<dyn ControlChannel>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl RelayDataChannel {
    /// Wrap a control channel. The returned sender is handed to the
    /// session's control reader, which pushes every `RelayData` payload
    /// it receives.
    pub fn new(control: Arc<dyn ControlChannel>) -> (Arc<Self>, mpsc::Sender<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(RELAY_INBOUND_DEPTH);
        (
            Arc::new(Self {
                control,
                inbound: Mutex::new(rx),
                closed: CancellationToken::new(),
            }),
            tx,
        )
    }
}

#[async_trait]
impl DataChannel for RelayDataChannel {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.control
            .send(&ControlMessage::RelayData(datagram.to_vec()))
            .await
    }

    async fn recv(&self, buf: &mut Vec<u8>) -> Result<(usize, SocketAddr), TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    buf.clear();
                    buf.extend_from_slice(&frame);
                    let src = self
                        .control
                        .peer_addr()
                        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
                    Ok((frame.len(), src))
                }
                None => Err(TransportError::Closed),
            },
        }
    }

    fn set_remote(&self, _remote: SocketAddr) {
        // The remote is wherever the control channel leads.
    }

    fn remote(&self) -> Option<SocketAddr> {
        self.control.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_control_pair;

    #[tokio::test]
    async fn test_send_becomes_relay_data_message() {
        let (a, b) = memory_control_pair();
        let (relay, _inbound_tx) = RelayDataChannel::new(Arc::new(a));

        relay.send(&[0x01, 0x02, 0x03]).await.unwrap();
        match b.recv().await.unwrap() {
            ControlMessage::RelayData(frame) => assert_eq!(frame, vec![0x01, 0x02, 0x03]),
            other => panic!("unexpected message: {}", other.kind_name()),
        }
    }

    #[tokio::test]
    async fn test_recv_drains_fed_frames() {
        let (a, _b) = memory_control_pair();
        let (relay, inbound_tx) = RelayDataChannel::new(Arc::new(a));

        inbound_tx.send(vec![0xAA; 42]).await.unwrap();
        let mut buf = Vec::new();
        let (len, _src) = relay.recv(&mut buf).await.unwrap();
        assert_eq!(len, 42);
        assert_eq!(buf, vec![0xAA; 42]);
    }

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let (a, _b) = memory_control_pair();
        let (relay, _inbound_tx) = RelayDataChannel::new(Arc::new(a));

        let pending = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                relay.recv(&mut buf).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        relay.close();
        assert!(matches!(
            pending.await.unwrap(),
            Err(TransportError::Closed)
        ));
    }
}
