//! SUDP: a secure, authenticated, multiplexed datagram protocol over UDP.
//!
//! Endpoints are identified by 16-bit virtual addresses and authenticated
//! with long-term ECDSA P-256 keys. Payloads are sealed with AES-256-GCM
//! under ephemeral ECDH keys that rotate in epochs, giving forward secrecy;
//! packet headers are bound to a pre-shared key with a BLAKE2b-192 MAC, and
//! loose time synchronization rejects replayed or late datagrams.

pub mod addr;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod server;

mod chan;
mod epoch;
mod peer;
mod tsync;
mod wire;

pub use addr::{LocalAddr, RemoteAddr};
pub use client::{connect, ClientConn, ClientOpts};
pub use config::{ClientConfig, ServerConfig};
pub use crypto::{
    generate_key, private_key_from_pem_file, public_key_from_pem_file, write_pem_keypair,
};
pub use error::SudpError;
pub use server::{listen, ServerConn};
pub use wire::header::PROTOCOL_VERSION;
pub use wire::pktbuff::PKT_BUF_SIZE;

/// Largest payload that fits a single datagram after header and AEAD
/// overhead.
pub const MAX_PAYLOAD: usize =
    PKT_BUF_SIZE - wire::header::HDR_SIZE - wire::data::DATA_OVERHEAD;
