//! Virtual Layer-2 interface adaptor.
//!
//! The core does not create or configure the OS device; it consumes a
//! handle exposing read/write/is-active primitives and treats frames as
//! opaque bytes. Reads park the calling task until a frame or close;
//! closing the device wakes pending reads promptly.
//!
//! [`MemoryDevice`] is the in-process implementation backing the loopback
//! tests and single-process meshes; a TAP-backed implementation lives
//! with the embedder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::DeviceError;

/// Byte conduit to the local virtual Ethernet interface.
#[async_trait]
pub trait L2Device: Send + Sync {
    /// Wait for the next frame and append it to `buf`; returns its length.
    ///
    /// Returns [`DeviceError::Closed`] once the device is closed, including
    /// for reads already parked at that moment.
    async fn read_frame(&self, buf: &mut Vec<u8>) -> Result<usize, DeviceError>;

    /// Inject a frame into the interface.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), DeviceError>;

    /// Whether the interface is up.
    fn is_active(&self) -> bool;

    /// Interface name (diagnostics only).
    fn name(&self) -> &str;

    /// Interface MTU; frames never exceed it in either direction.
    fn mtu(&self) -> usize;

    /// Close the interface, waking pending reads.
    fn close(&self);
}

/// In-memory device: the "host side" is a [`DeviceHost`] handle instead
/// of a kernel interface.
pub struct MemoryDevice {
    name: String,
    mtu: usize,
    ingress: Mutex<mpsc::Receiver<Vec<u8>>>,
    egress: mpsc::Sender<Vec<u8>>,
    active: AtomicBool,
    closed: CancellationToken,
}

/// The host side of a [`MemoryDevice`]: inject frames the tunnel will
/// read, and collect frames the tunnel wrote.
pub struct DeviceHost {
    ingress: mpsc::Sender<Vec<u8>>,
    egress: Mutex<mpsc::Receiver<Vec<u8>>>,
}

/// Create a connected device/host pair.
pub fn memory_device(name: impl Into<String>, mtu: usize) -> (Arc<MemoryDevice>, DeviceHost) {
    let (ingress_tx, ingress_rx) = mpsc::channel(256);
    let (egress_tx, egress_rx) = mpsc::channel(256);
    (
        Arc::new(MemoryDevice {
            name: name.into(),
            mtu,
            ingress: Mutex::new(ingress_rx),
            egress: egress_tx,
            active: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }),
        DeviceHost {
            ingress: ingress_tx,
            egress: Mutex::new(egress_rx),
        },
    )
}

#[async_trait]
impl L2Device for MemoryDevice {
    async fn read_frame(&self, buf: &mut Vec<u8>) -> Result<usize, DeviceError> {
        let mut ingress = self.ingress.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(DeviceError::Closed),
            frame = ingress.recv() => match frame {
                Some(frame) => {
                    buf.extend_from_slice(&frame);
                    Ok(frame.len())
                }
                None => Err(DeviceError::Closed),
            },
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), DeviceError> {
        if !self.is_active() {
            return Err(DeviceError::Closed);
        }
        if frame.len() > self.mtu {
            return Err(DeviceError::OversizedFrame {
                len: frame.len(),
                mtu: self.mtu,
            });
        }
        match self.egress.try_send(frame.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeviceError::Busy),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeviceError::Closed),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.closed.cancel();
    }
}

impl DeviceHost {
    /// Feed a frame into the interface, as the host network stack would.
    pub async fn inject(&self, frame: &[u8]) -> Result<(), DeviceError> {
        self.ingress
            .send(frame.to_vec())
            .await
            .map_err(|_| DeviceError::Closed)
    }

    /// Next frame the tunnel delivered to the interface.
    pub async fn next_frame(&self) -> Option<Vec<u8>> {
        self.egress.lock().await.recv().await
    }

    /// Non-blocking poll for a delivered frame.
    pub fn try_next_frame(&self) -> Option<Vec<u8>> {
        self.egress.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_inject_then_read() {
        let (device, host) = memory_device("mem0", 1500);
        host.inject(&[0xAA; 64]).await.unwrap();

        let mut buf = Vec::new();
        let len = device.read_frame(&mut buf).await.unwrap();
        assert_eq!(len, 64);
        assert_eq!(buf, vec![0xAA; 64]);
    }

    #[tokio::test]
    async fn test_write_then_collect() {
        let (device, host) = memory_device("mem0", 1500);
        device.write_frame(&[0xBB; 100]).await.unwrap();
        assert_eq!(host.next_frame().await.unwrap(), vec![0xBB; 100]);
    }

    #[tokio::test]
    async fn test_oversized_write_rejected() {
        let (device, _host) = memory_device("mem0", 1500);
        assert_eq!(
            device.write_frame(&[0x00; 1501]).await,
            Err(DeviceError::OversizedFrame { len: 1501, mtu: 1500 })
        );
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (device, _host) = memory_device("mem0", 1500);
        let reader = {
            let device = Arc::clone(&device);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                device.read_frame(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        device.close();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read must unblock within the shutdown bound")
            .unwrap();
        assert_eq!(result, Err(DeviceError::Closed));
        assert!(!device.is_active());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (device, _host) = memory_device("mem0", 1500);
        device.close();
        assert_eq!(device.write_frame(&[0x01]).await, Err(DeviceError::Closed));
    }
}
