//! Core constants, configuration, and error types.

mod config;
pub mod constants;
mod error;

pub use config::{NodeConfig, TunnelConfig};
pub use constants::*;
pub use error::{
    CryptoError, DeviceError, FrameError, HandshakeError, MeshError, SessionError, TransportError,
};
