//! Protocol error types

use thiserror::Error;

/// All failure modes of the protocol core.
///
/// Ingress validation failures (`MalformedPacket`, `AuthFailure`,
/// `UnknownPeer`, `PeerOutOfSync`, `StalePacket`, `UnexpectedEpoch`) are
/// logged and the offending datagram dropped; they never reach the user.
/// The remaining kinds surface through the public API.
#[derive(Debug, Error)]
pub enum SudpError {
    /// Buffer too short, wrong protocol version, or unknown packet kind.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Header MAC mismatch, body signature mismatch, or AEAD open failure.
    #[error("authentication failure")]
    AuthFailure,

    /// Source virtual address does not map to a configured peer, or the
    /// destination is not this endpoint.
    #[error("unknown peer {0}")]
    UnknownPeer(u16),

    /// First packet from a peer carried a clock offset beyond tolerance.
    /// The peer stays rejected until its configuration is corrected.
    #[error("peer clock offset exceeds tolerance")]
    PeerOutOfSync,

    /// Packet timestamp falls outside the acceptance window.
    #[error("stale packet")]
    StalePacket,

    /// Packet epoch does not match any usable slot of the epoch ring.
    #[error("unexpected epoch")]
    UnexpectedEpoch,

    /// Destination peer has no usable current epoch key.
    #[error("peer not ready")]
    NotReady,

    /// Handshake retries exhausted.
    #[error("handshake timeout")]
    Timeout,

    /// Operation on a closed connection.
    #[error("connection closed")]
    Closed,

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A required configuration item (key, address) is absent.
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),

    /// Configuration present but unusable (bad PEM, bad JSON, bad address).
    #[error("invalid configuration: {0}")]
    Config(String),
}
