//! JSON configuration: the server's peer table and the per-client
//! counterpart minted by `sudpcfg`.
//!
//! Server config:
//! ```json
//! {
//!   "server": {
//!     "virtual_address": 0,
//!     "listen": "0.0.0.0",
//!     "port": 7000,
//!     "private_key": "server_private.pem",
//!     "public_address": "203.0.113.7"
//!   },
//!   "peers": [
//!     {
//!       "virtual_address": 1001,
//!       "shared_hmac_key": "a password",
//!       "public_key": "client_1001_public.pem"
//!     }
//!   ]
//! }
//! ```
//!
//! Key files are PEM: SEC1 for private keys, SPKI for public keys.

use crate::addr::{LocalAddr, RemoteAddr};
use crate::crypto;
use crate::error::SudpError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

/// First virtual address handed to minted clients; the server itself is 0.
pub const FIRST_CLIENT_VADDR: u16 = 1001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub virtual_address: u16,
    pub listen: String,
    pub port: u16,
    /// Path to the server's private key PEM.
    pub private_key: String,
    /// Address clients should dial; written into minted client configs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    pub virtual_address: u16,
    pub shared_hmac_key: String,
    /// Path to the peer's public key PEM.
    pub public_key: String,
    /// Optional last-known network address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ServerSection,
    #[serde(default)]
    pub peers: Vec<PeerSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    pub virtual_address: u16,
    pub private_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    pub virtual_address: u16,
    pub address: String,
    pub public_key: String,
    pub shared_hmac_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client: ClientSection,
    pub server: RemoteSection,
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, SudpError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| SudpError::Config(format!("resolving {host}:{port}: {e}")))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| SudpError::Config(format!("no IPv4 address for {host}:{port}")))
}

fn resolve_pair(addr: &str) -> Result<SocketAddr, SudpError> {
    addr.to_socket_addrs()
        .map_err(|e| SudpError::Config(format!("resolving {addr}: {e}")))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| SudpError::Config(format!("no IPv4 address for {addr}")))
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SudpError> {
        let data = std::fs::read_to_string(&path)
            .map_err(|e| SudpError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&data)
            .map_err(|e| SudpError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SudpError> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SudpError::Config(format!("serializing config: {e}")))?;
        std::fs::write(&path, data)
            .map_err(|e| SudpError::Config(format!("writing {}: {e}", path.as_ref().display())))?;
        Ok(())
    }

    /// The local record: bind address plus loaded private key.
    pub fn local_address(&self) -> Result<LocalAddr, SudpError> {
        let addr = resolve(&self.server.listen, self.server.port)?;
        let private = crypto::private_key_from_pem_file(&self.server.private_key)?;
        Ok(LocalAddr {
            virtual_address: self.server.virtual_address,
            private_key: Some(private),
            network_address: Some(addr),
        })
    }

    /// Remote records for every configured peer, public keys loaded.
    pub fn peer_addresses(&self) -> Result<Vec<RemoteAddr>, SudpError> {
        let mut out = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let public = crypto::public_key_from_pem_file(&peer.public_key)?;
            let hmac_key = if peer.shared_hmac_key.is_empty() {
                None
            } else {
                Some(peer.shared_hmac_key.as_bytes().to_vec())
            };
            let network_address = match &peer.address {
                Some(addr) => Some(resolve_pair(addr)?),
                None => None,
            };
            out.push(RemoteAddr {
                virtual_address: peer.virtual_address,
                public_key: Some(public),
                hmac_key,
                network_address,
            });
        }
        Ok(out)
    }

    /// Next free client virtual address.
    pub fn next_virtual_address(&self) -> u16 {
        self.peers
            .iter()
            .map(|p| p.virtual_address)
            .max()
            .map(|v| v.saturating_add(1))
            .unwrap_or(FIRST_CLIENT_VADDR)
    }
}

impl ClientConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SudpError> {
        let data = std::fs::read_to_string(&path)
            .map_err(|e| SudpError::Config(format!("reading {}: {e}", path.as_ref().display())))?;
        serde_json::from_str(&data)
            .map_err(|e| SudpError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SudpError> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| SudpError::Config(format!("serializing config: {e}")))?;
        std::fs::write(&path, data)
            .map_err(|e| SudpError::Config(format!("writing {}: {e}", path.as_ref().display())))?;
        Ok(())
    }

    /// The local record; the bind address is left to the runtime default.
    pub fn local_address(&self) -> Result<LocalAddr, SudpError> {
        let private = crypto::private_key_from_pem_file(&self.client.private_key)?;
        Ok(LocalAddr {
            virtual_address: self.client.virtual_address,
            private_key: Some(private),
            network_address: None,
        })
    }

    /// The server's remote record.
    pub fn server_address(&self) -> Result<RemoteAddr, SudpError> {
        let public = crypto::public_key_from_pem_file(&self.server.public_key)?;
        let addr = resolve_pair(&self.server.address)?;
        let hmac_key = if self.server.shared_hmac_key.is_empty() {
            None
        } else {
            Some(self.server.shared_hmac_key.as_bytes().to_vec())
        };
        Ok(RemoteAddr {
            virtual_address: self.server.virtual_address,
            public_key: Some(public),
            hmac_key,
            network_address: Some(addr),
        })
    }
}
