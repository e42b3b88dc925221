//! Proof-of-work search over the 32-bit header nonce.

use crate::core::block::{Block, is_valid_block_hash};
use crate::core::tx::SignedTx;
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::utils::unix_now;
use crate::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tinychain_derive::Error;

#[derive(Debug, Error)]
pub enum MineError {
    /// The attempt was cancelled; the mining loop treats this as routine.
    #[error("mining cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag for one mining attempt.
///
/// The search is a tight CPU loop with no suspension points, so it polls this
/// flag on every iteration instead of awaiting anything.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a mining attempt needs, snapshotted before the search starts.
///
/// `time` is captured once here and stays constant for the attempt, so every
/// candidate hash differs only in the nonce.
#[derive(Clone, Debug)]
pub struct PendingBlock {
    pub parent: Hash,
    pub number: u64,
    pub time: u64,
    pub miner: Address,
    pub difficulty: u64,
    pub txs: Vec<SignedTx>,
}

impl PendingBlock {
    pub fn new(
        parent: Hash,
        number: u64,
        miner: Address,
        difficulty: u64,
        txs: Vec<SignedTx>,
    ) -> Self {
        Self {
            parent,
            number,
            time: unix_now(),
            miner,
            difficulty,
            txs,
        }
    }
}

/// Searches nonces until the block hash satisfies the difficulty or the
/// attempt is cancelled.
///
/// Should the 32-bit nonce space ever run dry, the search restarts with a
/// fresh timestamp, which reshuffles the whole hash space.
pub fn mine(pending: PendingBlock, cancel: &CancelSignal) -> Result<Block, MineError> {
    let started = Instant::now();
    let tx_count = pending.txs.len();
    let mut block = Block::new(
        pending.parent,
        pending.number,
        0,
        pending.time,
        pending.miner,
        pending.difficulty,
        pending.txs,
    );

    let mut attempt: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(MineError::Cancelled);
        }

        if attempt > 0 && attempt % (1 << 32) == 0 {
            warn!("nonce space exhausted, restarting attempt with a fresh timestamp");
            block.header.time = unix_now();
        }
        if attempt % 1_000_000 == 0 {
            info!("mining {tx_count} pending txs, attempt {attempt}");
        }

        block.header.nonce = attempt as u32;
        let hash = block.hash();
        if is_valid_block_hash(&hash, block.header.difficulty) {
            info!(
                "mined block {}: hash={} nonce={} attempts={} elapsed={:?}",
                block.header.number,
                hash,
                block.header.nonce,
                attempt + 1,
                started.elapsed()
            );
            return Ok(block);
        }

        attempt += 1;
    }
}
