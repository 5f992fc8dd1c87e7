//! Three-slot epoch ring: previous / current / pending generations of
//! ephemeral AEAD keying material.
//!
//! Only `current` and `prev` may decrypt data; only `pending` may be
//! promoted, and only once its shared secret is derived. The three slot ids
//! are pairwise distinct whenever set. Keeping `prev` alive covers data
//! packets still in flight across a promotion.

use crate::crypto::EpochCipher;
use crate::error::SudpError;

/// One key generation, identified by the 32-bit id carried in headers.
pub(crate) struct Epoch {
    pub id: u32,
    pub cipher: EpochCipher,
}

#[derive(Default)]
pub(crate) struct EpochRing {
    prev: Option<Epoch>,
    current: Option<Epoch>,
    pending: Option<Epoch>,
}

impl EpochRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `pending` holds `id` with a fresh ECDH keypair. A pending
    /// entry for a different id is discarded.
    pub fn new_pending(&mut self, id: u32) -> &mut Epoch {
        if !self.is_pending(id) {
            self.pending = None;
        }
        self.pending.get_or_insert_with(|| Epoch {
            id,
            cipher: EpochCipher::generate(),
        })
    }

    /// Complete ECDH on the pending entry.
    pub fn derive(&mut self, remote: &[u8]) -> Result<(), SudpError> {
        match self.pending.as_mut() {
            Some(e) => e.cipher.derive(remote),
            None => Err(SudpError::UnexpectedEpoch),
        }
    }

    /// Shift `prev ← current ← pending`. Requires `pending` to hold `id`
    /// with its shared secret derived.
    pub fn promote(&mut self, id: u32) -> Result<(), SudpError> {
        match &self.pending {
            Some(e) if e.id == id && e.cipher.is_ready() => {}
            _ => return Err(SudpError::UnexpectedEpoch),
        }
        self.prev = self.current.take();
        self.current = self.pending.take();
        Ok(())
    }

    pub fn current(&self) -> Option<&Epoch> {
        self.current.as_ref()
    }

    pub fn prev(&self) -> Option<&Epoch> {
        self.prev.as_ref()
    }

    pub fn pending(&self) -> Option<&Epoch> {
        self.pending.as_ref()
    }

    pub fn is_current(&self, id: u32) -> bool {
        self.current.as_ref().is_some_and(|e| e.id == id)
    }

    pub fn is_prev(&self, id: u32) -> bool {
        self.prev.as_ref().is_some_and(|e| e.id == id)
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.as_ref().is_some_and(|e| e.id == id)
    }

    /// Drop every generation. Used on liveness expiry.
    pub fn reset(&mut self) {
        self.prev = None;
        self.current = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived(ring: &mut EpochRing, id: u32) {
        let remote = EpochCipher::generate().public_bytes();
        ring.new_pending(id);
        ring.derive(&remote).unwrap();
    }

    #[test]
    fn promote_requires_pending_and_secret() {
        let mut ring = EpochRing::new();
        assert!(matches!(ring.promote(7), Err(SudpError::UnexpectedEpoch)));

        ring.new_pending(7);
        // keypair generated but no shared secret yet
        assert!(matches!(ring.promote(7), Err(SudpError::UnexpectedEpoch)));

        let remote = EpochCipher::generate().public_bytes();
        ring.derive(&remote).unwrap();
        assert!(matches!(ring.promote(8), Err(SudpError::UnexpectedEpoch)));
        ring.promote(7).unwrap();

        assert!(ring.is_current(7));
        assert!(ring.pending().is_none());
        assert!(ring.prev().is_none());
    }

    #[test]
    fn promotion_shifts_slots() {
        let mut ring = EpochRing::new();
        derived(&mut ring, 7);
        ring.promote(7).unwrap();
        derived(&mut ring, 8);
        ring.promote(8).unwrap();

        assert!(ring.is_current(8));
        assert!(ring.is_prev(7));
        assert!(ring.pending().is_none());

        // the old prev is discarded on the next promotion
        derived(&mut ring, 9);
        ring.promote(9).unwrap();
        assert!(ring.is_current(9));
        assert!(ring.is_prev(8));
        assert!(!ring.is_prev(7) && !ring.is_current(7) && !ring.is_pending(7));
    }

    #[test]
    fn slot_ids_pairwise_distinct() {
        let mut ring = EpochRing::new();
        derived(&mut ring, 1);
        ring.promote(1).unwrap();
        derived(&mut ring, 2);
        ring.promote(2).unwrap();
        derived(&mut ring, 3);

        let ids = [
            ring.prev().map(|e| e.id),
            ring.current().map(|e| e.id),
            ring.pending().map(|e| e.id),
        ];
        assert_eq!(ids, [Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn new_pending_displaces_different_id() {
        let mut ring = EpochRing::new();
        derived(&mut ring, 5);
        // replacing with a new id discards the derived secret
        ring.new_pending(6);
        assert!(ring.is_pending(6));
        assert!(!ring.pending().unwrap().cipher.is_ready());
        // re-requesting the same id keeps the entry
        derived(&mut ring, 6);
        ring.new_pending(6);
        assert!(ring.pending().unwrap().cipher.is_ready());
    }

    #[test]
    fn reset_clears_all_slots() {
        let mut ring = EpochRing::new();
        derived(&mut ring, 1);
        ring.promote(1).unwrap();
        derived(&mut ring, 2);
        ring.reset();
        assert!(ring.current().is_none() && ring.prev().is_none() && ring.pending().is_none());
    }
}
