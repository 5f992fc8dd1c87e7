//! The fixed 20-byte packet header and its keyed MAC.

use crate::crypto::{self, MAC_SIZE};
use crate::error::SudpError;
use crate::tsync::now_ms;

/// Protocol version carried in byte 0. Any other version is dropped.
pub const PROTOCOL_VERSION: u8 = 0x03;

/// Header size on the wire.
pub const HDR_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    ClientHandshake = 0x01,
    ServerHandshake = 0x02,
    Ctrl = 0x03,
    Data = 0x04,
}

impl PacketKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::ClientHandshake),
            0x02 => Some(Self::ServerHandshake),
            0x03 => Some(Self::Ctrl),
            0x04 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Decoded header. `mac` is the BLAKE2b-192 tag over the 20 wire bytes. It
/// is never serialized here; bodies carry it as their first field and the
/// receiver cross-checks the two.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub kind: PacketKind,
    /// Total packet length including this header.
    pub len: u16,
    pub src: u16,
    pub dst: u16,
    pub epoch: u32,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub time: u64,
    pub mac: [u8; MAC_SIZE],
}

impl Header {
    /// Fresh header stamped with the current wall clock.
    pub fn new(kind: PacketKind, epoch: u32, src: u16, dst: u16, len: u16) -> Self {
        Self {
            kind,
            len,
            src,
            dst,
            epoch,
            time: now_ms(),
            mac: [0u8; MAC_SIZE],
        }
    }

    /// Read only the source and destination virtual addresses (bytes 4..8),
    /// for peer lookup before any crypto work.
    pub fn peek_src_dst(b: &[u8]) -> Option<(u16, u16)> {
        if b.len() < HDR_SIZE {
            return None;
        }
        let src = u16::from_be_bytes([b[4], b[5]]);
        let dst = u16::from_be_bytes([b[6], b[7]]);
        Some((src, dst))
    }

    /// Serialize into `dst` (exactly [`HDR_SIZE`] bytes) and compute the
    /// keyed MAC over the written bytes.
    pub fn encode(&mut self, dst: &mut [u8], hmac_key: &[u8]) -> Result<(), SudpError> {
        if dst.len() < HDR_SIZE {
            return Err(SudpError::MalformedPacket("header buffer too small"));
        }
        dst[0] = PROTOCOL_VERSION;
        dst[1] = self.kind as u8;
        dst[2..4].copy_from_slice(&self.len.to_be_bytes());
        dst[4..6].copy_from_slice(&self.src.to_be_bytes());
        dst[6..8].copy_from_slice(&self.dst.to_be_bytes());
        dst[8..12].copy_from_slice(&self.epoch.to_be_bytes());
        dst[12..20].copy_from_slice(&self.time.to_be_bytes());
        self.mac = crypto::header_mac(&dst[..HDR_SIZE], hmac_key)?;
        Ok(())
    }

    /// Parse `src`, recomputing the MAC over the received bytes for the
    /// body cross-check.
    pub fn decode(src: &[u8], hmac_key: &[u8]) -> Result<Self, SudpError> {
        if src.len() < HDR_SIZE {
            return Err(SudpError::MalformedPacket("short header"));
        }
        if src[0] != PROTOCOL_VERSION {
            return Err(SudpError::MalformedPacket("invalid protocol version"));
        }
        let kind = PacketKind::from_u8(src[1])
            .ok_or(SudpError::MalformedPacket("unknown packet kind"))?;
        let mac = crypto::header_mac(&src[..HDR_SIZE], hmac_key)?;
        Ok(Self {
            kind,
            len: u16::from_be_bytes([src[2], src[3]]),
            src: u16::from_be_bytes([src[4], src[5]]),
            dst: u16::from_be_bytes([src[6], src[7]]),
            epoch: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
            time: u64::from_be_bytes([
                src[12], src[13], src[14], src[15], src[16], src[17], src[18], src[19],
            ]),
            mac,
        })
    }
}
