//! Blocks, headers, and the proof-of-work predicate.

use crate::core::tx::SignedTx;
use crate::types::address::Address;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};
use tinychain_derive::Codec;

/// Block metadata.
///
/// `parent` is the hash of the preceding block (all-zero for the first block).
/// `nonce` is the 32-bit value the miner varies; `time` is captured once per
/// mining attempt; `difficulty` is the number of leading zero hex characters
/// the block hash must carry.
#[derive(Clone, Debug, PartialEq, Eq, Codec, Serialize, Deserialize)]
pub struct BlockHeader {
    pub parent: Hash,
    pub number: u64,
    pub nonce: u32,
    pub time: u64,
    pub miner: Address,
    pub difficulty: u64,
}

/// A header plus the ordered transactions it commits.
#[derive(Clone, Debug, PartialEq, Eq, Codec, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<SignedTx>,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: Hash,
        number: u64,
        nonce: u32,
        time: u64,
        miner: Address,
        difficulty: u64,
        txs: Vec<SignedTx>,
    ) -> Self {
        Self {
            header: BlockHeader {
                parent,
                number,
                nonce,
                time,
                miner,
                difficulty,
            },
            txs,
        }
    }

    /// Content hash over the canonical encoding of the whole block.
    ///
    /// Recomputed on every call; the miner changes the header nonce between
    /// calls, so caching would be wrong exactly where hashing is hottest.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::keccak();
        self.encode(&mut h);
        h.finalize()
    }
}

/// Proof-of-work check: the hex rendering of `hash` starts with exactly
/// `difficulty` zero characters.
///
/// "Exactly" keeps difficulty classes disjoint - a hash with more leading
/// zeros than asked belongs to a higher difficulty and is rejected here.
pub fn is_valid_block_hash(hash: &Hash, difficulty: u64) -> bool {
    hash.leading_zero_nibbles() == difficulty
}

/// One persisted entry of the block log: the block keyed by its hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: Hash,
    pub value: Block,
}

impl BlockRecord {
    pub fn new(block: Block) -> Self {
        Self {
            hash: block.hash(),
            value: block,
        }
    }
}
