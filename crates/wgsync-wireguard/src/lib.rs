//! `WireGuard` device types for the wgsync gateway.
//!
//! This crate provides the key and peer types shared across wgsync, the
//! [`WireGuardDevice`] control trait, an in-memory fake device, and (with the
//! `linux` feature) the kernel netlink backend.

mod device;
pub mod error;
mod keys;
#[cfg(feature = "linux")]
mod linux;
mod types;

pub use device::{FakeWireGuardDevice, WireGuardDevice};
pub use error::{Result, WireGuardError};
pub use keys::{PresharedKey, PrivateKey, PublicKey, KEY_SIZE};
#[cfg(feature = "linux")]
pub use linux::KernelDevice;
pub use types::{AllowedIp, DeviceSnapshot, LivePeer, PeerConfig, PeerUpdate};
