//! Pool of accepted-but-not-yet-mined transactions.
//!
//! Pending entries live here from acceptance until they appear in a canonical
//! block, at which point they move to the archived set. Archived hashes stay
//! around so an already-mined transaction is never accepted again.

use crate::core::block::Block;
use crate::core::tx::SignedTx;
use crate::types::address::Address;
use crate::types::hash::Hash;
use dashmap::DashMap;
use std::sync::RwLock;

/// Cap on pending transactions; the oldest entry is dropped on overflow.
pub const MEMPOOL_CAPACITY: usize = 10_000;

/// Thread-safe mempool with arrival ordering.
///
/// Hash-indexed maps give O(1) duplicate checks; the separate order vector
/// keeps block construction deterministic.
pub struct Mempool {
    pending: DashMap<Hash, SignedTx>,
    archived: DashMap<Hash, SignedTx>,
    order: RwLock<Vec<Hash>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            archived: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_pending(&self, hash: Hash) -> bool {
        self.pending.contains_key(&hash)
    }

    pub fn is_archived(&self, hash: Hash) -> bool {
        self.archived.contains_key(&hash)
    }

    /// True when some pending tx from `from` already carries `nonce`.
    pub fn has_sender_nonce(&self, from: Address, nonce: u64) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.tx.from == from && entry.tx.nonce == nonce)
    }

    /// Inserts a screened transaction, evicting the oldest entry when full.
    pub fn insert(&self, tx: SignedTx) {
        let mut order = self.order.write().unwrap();

        if self.pending.len() >= MEMPOOL_CAPACITY {
            if let Some(oldest) = order.first().copied() {
                order.remove(0);
                self.pending.remove(&oldest);
            }
        }

        let hash = tx.hash();
        if self.pending.insert(hash, tx).is_none() {
            order.push(hash);
        }
    }

    /// Moves every tx mined in `block` from pending to archived. Returns how
    /// many entries were purged.
    pub fn archive_mined(&self, block: &Block) -> usize {
        let mut purged = 0;
        for tx in &block.txs {
            let hash = tx.hash();
            match self.pending.remove(&hash) {
                Some((_, tx)) => {
                    self.archived.insert(hash, tx);
                    purged += 1;
                }
                // A synced block carries txs this node never saw; archive
                // them anyway so a later gossip copy is rejected.
                None => {
                    self.archived.insert(hash, tx.clone());
                }
            }
        }

        if purged > 0 {
            let mut order = self.order.write().unwrap();
            order.retain(|h| self.pending.contains_key(h));
        }
        purged
    }

    /// Snapshot for block construction: ascending by nonce, stable by arrival
    /// between equal nonces.
    pub fn pending_sorted(&self) -> Vec<SignedTx> {
        let order = self.order.read().unwrap();
        let mut txs: Vec<SignedTx> = order
            .iter()
            .filter_map(|h| self.pending.get(h).map(|e| e.clone()))
            .collect();
        txs.sort_by_key(|tx| tx.tx.nonce);
        txs
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::utils::test_utils::utils::{signed_transfer, test_key};

    #[test]
    fn insert_and_lookup() {
        let pool = Mempool::new();
        let tx = signed_transfer(&test_key(1), Address([9u8; 20]), 10, 1);
        let hash = tx.hash();

        assert!(pool.is_empty());
        pool.insert(tx);
        assert_eq!(pool.len(), 1);
        assert!(pool.is_pending(hash));
        assert!(!pool.is_archived(hash));
    }

    #[test]
    fn duplicate_insert_is_a_noop() {
        let pool = Mempool::new();
        let tx = signed_transfer(&test_key(1), Address([9u8; 20]), 10, 1);
        pool.insert(tx.clone());
        pool.insert(tx);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.pending_sorted().len(), 1);
    }

    #[test]
    fn sender_nonce_lookup() {
        let pool = Mempool::new();
        let key = test_key(1);
        pool.insert(signed_transfer(&key, Address([9u8; 20]), 10, 1));

        assert!(pool.has_sender_nonce(key.address(), 1));
        assert!(!pool.has_sender_nonce(key.address(), 2));
        assert!(!pool.has_sender_nonce(Address([8u8; 20]), 1));
    }

    #[test]
    fn pending_sorted_orders_by_nonce_then_arrival() {
        let pool = Mempool::new();
        let a = test_key(1);
        let b = test_key(2);

        pool.insert(signed_transfer(&a, Address([9u8; 20]), 10, 2));
        pool.insert(signed_transfer(&b, Address([9u8; 20]), 10, 1));
        pool.insert(signed_transfer(&a, Address([9u8; 20]), 10, 1));

        let sorted = pool.pending_sorted();
        let nonces: Vec<u64> = sorted.iter().map(|t| t.tx.nonce).collect();
        assert_eq!(nonces, vec![1, 1, 2]);
        // b's nonce-1 tx arrived before a's, so it stays first.
        assert_eq!(sorted[0].tx.from, b.address());
        assert_eq!(sorted[1].tx.from, a.address());
    }

    #[test]
    fn archive_mined_moves_txs_out_of_pending() {
        let pool = Mempool::new();
        let key = test_key(1);
        let mined = signed_transfer(&key, Address([9u8; 20]), 10, 1);
        let waiting = signed_transfer(&key, Address([9u8; 20]), 10, 2);
        pool.insert(mined.clone());
        pool.insert(waiting.clone());

        let block = Block::new(
            Hash::zero(),
            0,
            0,
            1_700_000_000,
            Address::zero(),
            0,
            vec![mined.clone()],
        );
        let purged = pool.archive_mined(&block);

        assert_eq!(purged, 1);
        assert!(!pool.is_pending(mined.hash()));
        assert!(pool.is_archived(mined.hash()));
        assert!(pool.is_pending(waiting.hash()));
        assert_eq!(pool.pending_sorted(), vec![waiting]);
    }

    #[test]
    fn archive_mined_records_foreign_txs() {
        let pool = Mempool::new();
        let foreign = signed_transfer(&test_key(3), Address([9u8; 20]), 10, 1);
        let block = Block::new(
            Hash::zero(),
            0,
            0,
            1_700_000_000,
            Address::zero(),
            0,
            vec![foreign.clone()],
        );

        assert_eq!(pool.archive_mined(&block), 0);
        assert!(pool.is_archived(foreign.hash()));
    }
}
