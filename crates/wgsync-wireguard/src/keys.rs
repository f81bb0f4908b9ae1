//! `WireGuard` key types.
//!
//! `WireGuard` uses Curve25519 for key exchange. Keys are 32 bytes and are
//! exchanged in their standard base64 form. Keys are only ever parsed here;
//! minting them is the job of whoever provisions the directory.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::WireGuardError;

/// `WireGuard` key size in bytes (256-bit Curve25519 keys).
pub const KEY_SIZE: usize = 32;

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE], WireGuardError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
    if bytes.len() != KEY_SIZE {
        return Err(WireGuardError::InvalidKeyLength(bytes.len()));
    }
    let mut arr = [0u8; KEY_SIZE];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn encode_key(bytes: &[u8; KEY_SIZE]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// A `WireGuard` public key (Curve25519, 32 bytes).
///
/// Public keys identify peers everywhere in wgsync, so they are `Copy`,
/// hashable and totally ordered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a public key from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireGuardError> {
        if bytes.len() != KEY_SIZE {
            return Err(WireGuardError::InvalidKeyLength(bytes.len()));
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Returns the raw bytes of the public key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a public key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_key(s).map(Self)
    }

    /// Short form of the key for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let b64 = self.to_base64();
        b64[..8.min(b64.len())].to_string()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for PublicKey {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base64(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(key: X25519PublicKey) -> Self {
        Self::from_bytes_array(*key.as_bytes())
    }
}

/// A `WireGuard` private key (Curve25519, 32 bytes).
///
/// Only the gateway's own key is ever held; it is parsed from configuration
/// to validate it and to derive the public key operators hand to clients.
#[derive(Clone)]
pub struct PrivateKey([u8; KEY_SIZE]);

impl PrivateKey {
    /// Creates a private key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the private key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Derives the corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        let public = X25519PublicKey::from(&secret);
        PublicKey::from(public)
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a private key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PrivateKey {}

/// A `WireGuard` preshared key (32 bytes).
#[derive(Clone)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    /// Creates a preshared key from a 32-byte array.
    #[must_use]
    pub const fn from_bytes_array(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of the preshared key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encodes the key as base64.
    #[must_use]
    pub fn to_base64(&self) -> String {
        encode_key(&self.0)
    }

    /// Decodes a preshared key from base64.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not valid base64 or wrong length.
    pub fn from_base64(s: &str) -> Result<Self, WireGuardError> {
        decode_key(s).map(Self)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresharedKey").field("key", &"[REDACTED]").finish()
    }
}

impl PartialEq for PresharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PresharedKey {}

impl Serialize for PresharedKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PresharedKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}
