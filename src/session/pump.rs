//! The forwarding pipeline: one TX pump and one RX pump per data path.
//!
//! The TX pump moves Ethernet frames from the device onto the wire:
//! acquire buffer, read frame, seal into the buffer's tail, write the
//! header in place, send, release. The RX pump runs the mirror image.
//! Neither pump ever blocks the other, and per-frame failures are
//! counted, never propagated — the state machine hears only about fatal
//! conditions through [`PumpSignal`]s.
//!
//! On rekey the state machine swaps the [`ChannelSet`] atomically; a pump
//! mid-frame finishes under the set it loaded, and receive keys of the
//! previous epoch stay usable until their grace deadline so in-flight
//! frames still decrypt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::core::constants::{AEAD_TAG_SIZE, FRAME_HEADER_SIZE};
use crate::core::{CryptoError, DeviceError, TransportError};
use crate::crypto::aead::{channel_pair, RxChannel, TxChannel};
use crate::crypto::kdf::{Role, SessionKeys};
use crate::device::L2Device;
use crate::pool::BufferPool;
use crate::session::stats::TunnelStats;
use crate::transport::DataChannel;
use crate::wire::frame::{decode_frame, FrameHeader, FrameType};

/// Warn about persistent auth failures once per this many drops.
const AUTH_WARN_EVERY: u64 = 512;

/// Which data path a pump is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLabel {
    /// Relay-mediated path over the control channel.
    Relay,
    /// Direct datagram path.
    Direct,
}

/// Fatal or state-relevant conditions pumps report to the state machine.
#[derive(Debug)]
pub enum PumpSignal {
    /// The L2 device went away; the session must terminate.
    DeviceClosed,
    /// A data path died on a fatal send/recv error.
    DataPathDead(PathLabel),
    /// An authenticated frame arrived on the direct path.
    DirectInbound(SocketAddr),
    /// The outbound sequence space is exhausted; rekey now.
    RekeyNeeded,
    /// Decrypted in-band control payload from the peer.
    InbandControl(Vec<u8>),
}

/// Receive keys of a retired epoch, honored until the grace deadline.
pub struct OldRx {
    /// The previous epoch's receive channel, replay window intact.
    pub rx: Arc<RxChannel>,
    /// When these keys stop being accepted.
    pub retire_at: Instant,
}

/// One epoch's AEAD state, swapped atomically on rekey.
pub struct ChannelSet {
    /// Rekey generation, starting at 0.
    pub epoch: u32,
    /// Sealing channel for the TX pump.
    pub tx: TxChannel,
    /// Opening channel for the RX pumps.
    pub rx: Arc<RxChannel>,
    /// Previous epoch's receive keys during the rekey grace window.
    pub old_rx: Option<OldRx>,
}

impl ChannelSet {
    /// Build epoch state from freshly derived key material.
    pub fn from_keys(keys: &SessionKeys, role: Role, epoch: u32, old_rx: Option<OldRx>) -> Self {
        let (tx, rx) = channel_pair(
            keys.send_key(role),
            keys.send_salt(role),
            keys.recv_key(role),
            keys.recv_salt(role),
        );
        Self {
            epoch,
            tx,
            rx: Arc::new(rx),
            old_rx,
        }
    }
}

/// The data path(s) the TX pump sends on, swapped by the state machine.
pub struct PathSet {
    /// Where frames go.
    pub primary: Arc<dyn DataChannel>,
    /// Second path receiving duplicates while migration settles.
    pub duplicate: Option<Arc<dyn DataChannel>>,
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Maximum declared ciphertext length for a given tunnel MTU.
fn max_payload(mtu: usize) -> usize {
    mtu + AEAD_TAG_SIZE + crate::core::constants::FRAME_SLACK
}

/// TX pump: device reads → seal → send.
#[allow(clippy::too_many_arguments)]
pub async fn tx_pump(
    device: Arc<dyn L2Device>,
    pool: Arc<BufferPool>,
    channels: Arc<ArcSwap<ChannelSet>>,
    paths: Arc<ArcSwap<PathSet>>,
    stats: Arc<TunnelStats>,
    signals: mpsc::Sender<PumpSignal>,
    shutdown: CancellationToken,
    keepalive_interval: Duration,
) {
    debug!("tx pump up");
    loop {
        let mut buf = pool.acquire();
        buf.resize(FRAME_HEADER_SIZE, 0);

        // Read the next frame, or synthesize a keepalive after idling.
        let plaintext_len = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(keepalive_interval) => 0,
            read = device.read_frame(&mut buf) => match read {
                Ok(len) => len,
                Err(DeviceError::Closed) => {
                    let _ = signals.send(PumpSignal::DeviceClosed).await;
                    break;
                }
                Err(_) => continue,
            },
        };
        if !device.is_active() {
            break;
        }
        if FRAME_HEADER_SIZE + plaintext_len + AEAD_TAG_SIZE > pool.buffer_capacity() {
            stats.drop_send.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            continue;
        }

        let set = channels.load();
        let sequence = match set.tx.next_sequence() {
            Ok(sequence) => sequence,
            Err(CryptoError::CounterExhausted) => {
                let _ = signals.send(PumpSignal::RekeyNeeded).await;
                stats.drop_send.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
            Err(_) => continue,
        };

        let frame_type = if plaintext_len == 0 {
            FrameType::Keepalive
        } else {
            FrameType::Data
        };
        let header = FrameHeader::typed(frame_type, sequence, now_ns(), plaintext_len);
        header.write_to(&mut buf[..FRAME_HEADER_SIZE]);

        let (header_bytes, body) = buf.split_at_mut(FRAME_HEADER_SIZE);
        let tag = match set.tx.seal_detached(sequence, header_bytes, body) {
            Ok(tag) => tag,
            Err(_) => {
                stats.drop_send.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
        };
        buf.extend_from_slice(&tag);

        let path_set = paths.load();
        match path_set.primary.send(&buf).await {
            Ok(()) => {
                if frame_type == FrameType::Data {
                    stats.tx_frames.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    stats
                        .tx_bytes
                        .fetch_add(plaintext_len as u64, std::sync::atomic::Ordering::Relaxed);
                }
            }
            Err(TransportError::Closed) => {
                // The pump outlives any single path; the state machine
                // rebinds the path set after it hears the signal.
                stats.drop_send.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if !shutdown.is_cancelled() {
                    let _ = signals.send(PumpSignal::DataPathDead(PathLabel::Direct)).await;
                }
            }
            Err(_) => {
                stats.drop_send.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        if let Some(duplicate) = &path_set.duplicate {
            // Best effort: migration settles on whichever path delivers.
            let _ = duplicate.send(&buf).await;
        }
    }
    debug!("tx pump down");
}

/// RX pump: recv → decode → open → device write. One runs per attached
/// data path; all share the receive channel and its replay window.
#[allow(clippy::too_many_arguments)]
pub async fn rx_pump(
    device: Arc<dyn L2Device>,
    pool: Arc<BufferPool>,
    channels: Arc<ArcSwap<ChannelSet>>,
    stats: Arc<TunnelStats>,
    signals: mpsc::Sender<PumpSignal>,
    shutdown: CancellationToken,
    channel: Arc<dyn DataChannel>,
    label: PathLabel,
    mtu: usize,
) {
    debug!(?label, "rx pump up");
    let limit = max_payload(mtu);
    loop {
        let mut buf = pool.acquire();
        let (len, src) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = channel.recv(&mut buf) => match received {
                Ok(pair) => pair,
                Err(TransportError::Closed) => {
                    if !shutdown.is_cancelled() {
                        let _ = signals.send(PumpSignal::DataPathDead(label)).await;
                    }
                    break;
                }
                Err(_) => {
                    stats.drop_rx_bad.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
            },
        };
        if !device.is_active() {
            break;
        }

        let header = match decode_frame(&buf[..len], limit) {
            Ok((header, _)) => header,
            Err(_) => {
                stats.drop_rx_bad.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
        };

        let ciphertext_len = header.payload_len as usize;
        let plaintext_len = ciphertext_len - AEAD_TAG_SIZE;
        let set = channels.load();
        let (header_bytes, rest) = buf.split_at_mut(FRAME_HEADER_SIZE);
        let (body, tail) = rest.split_at_mut(plaintext_len);
        let tag = &tail[..AEAD_TAG_SIZE];

        match set.rx.open_detached(header.sequence, header_bytes, body, tag) {
            Ok(()) => {}
            Err(CryptoError::Replay) => {
                stats.drop_replay.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }
            Err(_) => {
                // Old-epoch keys stay valid for the grace window after a
                // rekey so in-flight frames are not lost.
                let grace = set.old_rx.as_ref().filter(|old| Instant::now() < old.retire_at);
                match grace {
                    Some(old) if old.rx.open_detached(header.sequence, header_bytes, body, tag).is_ok() => {}
                    _ => {
                        let dropped =
                            stats.drop_auth.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        if dropped % AUTH_WARN_EVERY == 0 {
                            // A stray packet on a reused port is normal;
                            // a stream of them deserves a look.
                            warn!(?label, %src, total = dropped + 1, "frames failing authentication");
                        }
                        continue;
                    }
                }
            }
        }

        if label == PathLabel::Direct {
            let _ = signals.try_send(PumpSignal::DirectInbound(src));
        }

        match header.frame_type {
            FrameType::Data => {
                match device.write_frame(&body[..plaintext_len]).await {
                    Ok(()) => {
                        stats.rx_frames.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        stats
                            .rx_bytes
                            .fetch_add(plaintext_len as u64, std::sync::atomic::Ordering::Relaxed);
                    }
                    Err(DeviceError::Busy) => {
                        stats.drop_write.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    Err(DeviceError::Closed) => {
                        let _ = signals.send(PumpSignal::DeviceClosed).await;
                        break;
                    }
                    Err(_) => {
                        stats.drop_write.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
            FrameType::Keepalive | FrameType::EndpointNotify => {
                trace!(?label, sequence = header.sequence, "liveness frame");
            }
            FrameType::Control => {
                let _ = signals
                    .send(PumpSignal::InbandControl(body[..plaintext_len].to_vec()))
                    .await;
            }
        }
    }
    debug!(?label, "rx pump down");
}
