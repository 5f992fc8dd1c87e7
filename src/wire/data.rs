//! Data bodies (kind 0x04): AEAD-sealed user payloads.
//!
//! Plaintext is the 24-byte header MAC followed by the payload; the wire
//! form is nonce ‖ ciphertext+tag. Binding the header MAC into the sealed
//! plaintext ties the encrypted payload to its authenticated header.

use crate::crypto::{EpochCipher, MAC_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::SudpError;

/// Bytes a data body adds on top of the payload.
pub const DATA_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE + MAC_SIZE;

pub(crate) struct DataBody {
    pub mac: [u8; MAC_SIZE],
    pub payload: Vec<u8>,
}

impl DataBody {
    /// Seal into `dst`, which must hold `payload.len() + DATA_OVERHEAD`.
    pub fn encode(&self, cipher: &EpochCipher, dst: &mut [u8]) -> Result<(), SudpError> {
        if dst.len() < self.payload.len() + DATA_OVERHEAD {
            return Err(SudpError::MalformedPacket("data buffer too small"));
        }
        let mut plaintext = Vec::with_capacity(MAC_SIZE + self.payload.len());
        plaintext.extend_from_slice(&self.mac);
        plaintext.extend_from_slice(&self.payload);

        let (nonce, ciphertext) = cipher.encrypt(&plaintext)?;
        dst[..NONCE_SIZE].copy_from_slice(&nonce);
        dst[NONCE_SIZE..NONCE_SIZE + ciphertext.len()].copy_from_slice(&ciphertext);
        Ok(())
    }

    /// Open a sealed body. AEAD failure maps to `AuthFailure`.
    pub fn decode(src: &[u8], cipher: &EpochCipher) -> Result<Self, SudpError> {
        if src.len() < DATA_OVERHEAD {
            return Err(SudpError::MalformedPacket("short data body"));
        }
        let plaintext = cipher.decrypt(&src[..NONCE_SIZE], &src[NONCE_SIZE..])?;
        if plaintext.len() < MAC_SIZE {
            return Err(SudpError::MalformedPacket("short data plaintext"));
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&plaintext[..MAC_SIZE]);
        Ok(Self {
            mac,
            payload: plaintext[MAC_SIZE..].to_vec(),
        })
    }
}
