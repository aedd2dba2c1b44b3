//! Length-prefixed control framing over any byte stream.
//!
//! One implementation serves every reliable transport: TLS sessions,
//! plain TCP in tests, and in-process duplex pipes. Messages travel as
//! `u32` big-endian length followed by the encoded body, bounded by
//! [`CONTROL_MESSAGE_MAX`].

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::constants::CONTROL_MESSAGE_MAX;
use crate::core::TransportError;
use crate::transport::ControlChannel;
use crate::wire::ControlMessage;

/// A [`ControlChannel`] over a split byte stream.
pub struct StreamControlChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    closed: CancellationToken,
}

impl<S> StreamControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an established stream.
    pub fn new(stream: S, local_addr: Option<SocketAddr>, peer_addr: Option<SocketAddr>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local_addr,
            peer_addr,
            closed: CancellationToken::new(),
        }
    }

    async fn recv_inner(&self) -> Result<ControlMessage, TransportError> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        read_exact_or_closed(&mut *reader, &mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > CONTROL_MESSAGE_MAX {
            return Err(TransportError::MessageTooLarge(len));
        }

        let mut body = vec![0u8; len];
        read_exact_or_closed(&mut *reader, &mut body).await?;
        ControlMessage::decode(&body)
    }
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Closed),
        Err(e) => Err(TransportError::Io(e)),
    }
}

#[async_trait]
impl<S> ControlChannel for StreamControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, message: &ControlMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let body = message.encode();
        if body.len() > CONTROL_MESSAGE_MAX {
            return Err(TransportError::MessageTooLarge(body.len()));
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<ControlMessage, TransportError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = self.recv_inner() => result,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn pipe() -> (
        StreamControlChannel<tokio::io::DuplexStream>,
        StreamControlChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(CONTROL_MESSAGE_MAX * 2);
        (
            StreamControlChannel::new(a, None, None),
            StreamControlChannel::new(b, None, None),
        )
    }

    #[tokio::test]
    async fn test_send_recv_preserves_order() {
        let (a, b) = pipe();
        for seq in 0..8u64 {
            a.send(&ControlMessage::Heartbeat {
                seq,
                timestamp_ns: seq * 1000,
            })
            .await
            .unwrap();
        }
        for seq in 0..8u64 {
            match b.recv().await.unwrap() {
                ControlMessage::Heartbeat { seq: got, .. } => assert_eq!(got, seq),
                other => panic!("unexpected message: {}", other.kind_name()),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_hangup_is_closed() {
        let (a, b) = pipe();
        a.close().await;
        drop(a);
        assert!(matches!(b.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = pipe();
        let a = Arc::new(a);
        let pending = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("recv must unblock")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (raw_a, raw_b) = tokio::io::duplex(1024);
        let b = StreamControlChannel::new(raw_b, None, None);

        let (_, mut writer) = tokio::io::split(raw_a);
        writer
            .write_all(&(CONTROL_MESSAGE_MAX as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            b.recv().await,
            Err(TransportError::MessageTooLarge(_))
        ));
    }
}
