//! Typed endpoint records: the local identity and the configured remotes.

use crate::crypto;
use p256::ecdsa::{SigningKey, VerifyingKey};
use std::fmt;
use std::net::SocketAddr;

/// A configured remote endpoint.
///
/// The public key is required to authenticate the peer; the shared HMAC key
/// is required to compute header MACs; the network address starts as the
/// last known location and is adopted from verified traffic (NAT rebind).
#[derive(Clone)]
pub struct RemoteAddr {
    /// 16-bit application-level endpoint identifier.
    pub virtual_address: u16,
    pub public_key: Option<VerifyingKey>,
    pub hmac_key: Option<Vec<u8>>,
    pub network_address: Option<SocketAddr>,
}

/// The local endpoint: its identity, signing key and UDP bind address.
#[derive(Clone)]
pub struct LocalAddr {
    pub virtual_address: u16,
    pub private_key: Option<SigningKey>,
    pub network_address: Option<SocketAddr>,
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let net = self
            .network_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".into());
        let key = self
            .public_key
            .as_ref()
            .map(crypto::fingerprint)
            .unwrap_or_else(|| "none".into());
        write!(
            f,
            "remote: {},{} - public key: {} - header hmac: {}",
            net,
            self.virtual_address,
            key,
            self.hmac_key.is_some()
        )
    }
}

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let net = self
            .network_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0.0.0.0:0".into());
        write!(
            f,
            "local: {},{} - private key: {}",
            net,
            self.virtual_address,
            self.private_key.is_some()
        )
    }
}
