//! Control bodies (kind 0x03): keep-alives, their acks, and epoch acks.

use crate::crypto::{self, MAC_SIZE, SIG_SIZE};
use crate::error::SudpError;
use p256::ecdsa::{SigningKey, VerifyingKey};

pub const CTRL_SIZE: usize = MAC_SIZE + 4 + 8 + SIG_SIZE;

const SIGNED_LEN: usize = MAC_SIZE + 4 + 8;

pub const KEEP_ALIVE: u32 = 1 << 0;
pub const RTT: u32 = 1 << 1;
pub const KEEP_ALIVE_ACK: u32 = 1 << 2;
pub const EPOCH_ACK: u32 = 1 << 3;

/// mac ‖ flag bitset ‖ auxiliary data ‖ signature over the first 36 bytes.
/// The auxiliary field is carried and signed but not consumed by any
/// handler.
pub(crate) struct CtrlMessage {
    pub mac: [u8; MAC_SIZE],
    ctrl: u32,
    pub data: u64,
    pub signature: [u8; SIG_SIZE],
}

impl CtrlMessage {
    pub fn new(mac: [u8; MAC_SIZE]) -> Self {
        Self {
            mac,
            ctrl: 0,
            data: 0,
            signature: [0u8; SIG_SIZE],
        }
    }

    pub fn set(&mut self, flag: u32) {
        self.ctrl |= flag;
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.ctrl & flag != 0
    }

    pub fn encode(&mut self, dst: &mut [u8], key: &SigningKey) -> Result<(), SudpError> {
        if dst.len() < CTRL_SIZE {
            return Err(SudpError::MalformedPacket("ctrl buffer too small"));
        }
        dst[..MAC_SIZE].copy_from_slice(&self.mac);
        dst[MAC_SIZE..MAC_SIZE + 4].copy_from_slice(&self.ctrl.to_be_bytes());
        dst[MAC_SIZE + 4..SIGNED_LEN].copy_from_slice(&self.data.to_be_bytes());
        self.signature = crypto::sign(key, &dst[..SIGNED_LEN]);
        dst[SIGNED_LEN..CTRL_SIZE].copy_from_slice(&self.signature);
        Ok(())
    }

    pub fn decode(src: &[u8], key: &VerifyingKey) -> Result<Self, SudpError> {
        if src.len() < CTRL_SIZE {
            return Err(SudpError::MalformedPacket("short ctrl body"));
        }
        let mut signature = [0u8; SIG_SIZE];
        signature.copy_from_slice(&src[SIGNED_LEN..CTRL_SIZE]);
        if !crypto::verify(key, &src[..SIGNED_LEN], &signature) {
            return Err(SudpError::AuthFailure);
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&src[..MAC_SIZE]);
        let ctrl = u32::from_be_bytes([src[24], src[25], src[26], src[27]]);
        let data = u64::from_be_bytes([
            src[28], src[29], src[30], src[31], src[32], src[33], src[34], src[35],
        ]);
        Ok(Self {
            mac,
            ctrl,
            data,
            signature,
        })
    }
}
