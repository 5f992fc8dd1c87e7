//! Handshake bodies (kinds 0x01 and 0x02) and the client's retransmission
//! state.
//!
//! Both directions carry the same 153-byte layout: the header MAC, a fresh
//! 65-byte ephemeral P-256 public key, and an ECDSA signature over the
//! preceding 89 bytes.

use crate::crypto::{self, MAC_SIZE, PUBKEY_SIZE, SIG_SIZE};
use crate::error::SudpError;
use crate::wire::header::{Header, HDR_SIZE};
use crate::wire::pktbuff::PktBuff;
use p256::ecdsa::{SigningKey, VerifyingKey};
use std::time::{Duration, Instant};

pub const HANDSHAKE_SIZE: usize = MAC_SIZE + PUBKEY_SIZE + SIG_SIZE;

const SIGNED_LEN: usize = MAC_SIZE + PUBKEY_SIZE;

pub(crate) struct Handshake {
    pub mac: [u8; MAC_SIZE],
    pub pubkey: [u8; PUBKEY_SIZE],
    pub signature: [u8; SIG_SIZE],
}

impl Handshake {
    pub fn new(mac: [u8; MAC_SIZE], pubkey: [u8; PUBKEY_SIZE]) -> Self {
        Self {
            mac,
            pubkey,
            signature: [0u8; SIG_SIZE],
        }
    }

    /// Lay out mac ‖ pubkey, then sign those bytes in place.
    pub fn encode(&mut self, dst: &mut [u8], key: &SigningKey) -> Result<(), SudpError> {
        if dst.len() < HANDSHAKE_SIZE {
            return Err(SudpError::MalformedPacket("handshake buffer too small"));
        }
        dst[..MAC_SIZE].copy_from_slice(&self.mac);
        dst[MAC_SIZE..SIGNED_LEN].copy_from_slice(&self.pubkey);
        self.signature = crypto::sign(key, &dst[..SIGNED_LEN]);
        dst[SIGNED_LEN..HANDSHAKE_SIZE].copy_from_slice(&self.signature);
        Ok(())
    }

    /// Parse and verify the signature under the peer's long-term key.
    pub fn decode(src: &[u8], key: &VerifyingKey) -> Result<Self, SudpError> {
        if src.len() < HANDSHAKE_SIZE {
            return Err(SudpError::MalformedPacket("short handshake body"));
        }
        let mut signature = [0u8; SIG_SIZE];
        signature.copy_from_slice(&src[SIGNED_LEN..HANDSHAKE_SIZE]);
        if !crypto::verify(key, &src[..SIGNED_LEN], &signature) {
            return Err(SudpError::AuthFailure);
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&src[..MAC_SIZE]);
        let mut pubkey = [0u8; PUBKEY_SIZE];
        pubkey.copy_from_slice(&src[MAC_SIZE..SIGNED_LEN]);
        Ok(Self {
            mac,
            pubkey,
            signature,
        })
    }
}

/// Retained outbound client handshake, kept until the server answers so the
/// retry timer can re-emit it. Each retransmission re-serializes with a
/// fresh timestamp and recomputed MAC and signature; stale signatures are
/// never reused.
pub(crate) struct HandshakeRetry {
    pub tries: u32,
    pub sent_at: Instant,
    pub header: Header,
    pub body: Handshake,
}

impl HandshakeRetry {
    pub fn new(header: Header, body: Handshake) -> Self {
        Self {
            tries: 1,
            sent_at: Instant::now(),
            header,
            body,
        }
    }

    pub fn due(&self, retry_after: Duration) -> bool {
        self.sent_at.elapsed() > retry_after
    }

    /// Re-serialize the retained handshake with a fresh timestamp.
    pub fn repack(&mut self, key: &SigningKey, hmac_key: &[u8]) -> Result<PktBuff, SudpError> {
        let mut pkt = PktBuff::alloc();
        self.header.time = crate::tsync::now_ms();
        self.header.encode(pkt.tail(HDR_SIZE)?, hmac_key)?;
        self.body.mac = self.header.mac;
        self.body.encode(pkt.tail(HANDSHAKE_SIZE)?, key)?;
        self.sent_at = Instant::now();
        self.tries += 1;
        Ok(pkt)
    }
}
