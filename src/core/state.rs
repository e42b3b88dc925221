//! The account-ledger state machine.
//!
//! `State` is the replicated monetary state: balances, per-sender nonces, and
//! the chain tip. It is advanced only by applying blocks; a clone of it
//! screens incoming mempool transactions. On restart the whole state is
//! rebuilt by replaying genesis and every persisted block through the same
//! validation path that accepted them the first time.

use crate::core::block::{Block, BlockRecord, is_valid_block_hash};
use crate::core::genesis::{GenesisError, load_genesis};
use crate::core::tx::SignedTx;
use crate::storage::block_store::{BlockStore, BlockStoreError};
use crate::types::address::Address;
use crate::types::hash::Hash;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tinychain_derive::Error;

#[derive(Debug, Error)]
pub enum TxError {
    /// The signature does not recover to the declared sender.
    #[error("tx signature does not recover to the sender address")]
    BadSignature,
    /// The nonce is not the sender's next one.
    #[error("invalid tx nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    /// The sender cannot cover value plus fee.
    #[error("insufficient funds: balance {balance} is below cost {cost}")]
    InsufficientFunds { balance: u64, cost: u64 },
}

#[derive(Debug, Error)]
pub enum BlockError {
    /// The block does not extend the current tip.
    #[error("block parent {got} does not match latest hash {expected}")]
    BadParent { expected: Hash, got: Hash },
    /// The block number is not the next height.
    #[error("invalid block number: expected {expected}, got {got}")]
    BadNumber { expected: u64, got: u64 },
    /// The block hash does not satisfy the header difficulty.
    #[error("block hash {0} does not satisfy difficulty {1}")]
    BadPow(Hash, u64),
    /// The block time does not advance past its parent.
    #[error("block time {block} is not after parent time {parent}")]
    NonMonotoneTime { parent: u64, block: u64 },
    /// A transaction inside the block failed validation.
    #[error("block rejected: {0}")]
    TxRejected(TxError),
    /// Persisting the block failed.
    #[error("{0}")]
    Store(BlockStoreError),
}

/// Fatal startup failures while rebuilding state from disk.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("{0}")]
    Genesis(GenesisError),
    #[error("{0}")]
    Store(BlockStoreError),
    #[error("replay of block {number} failed: {error}")]
    Replay { number: u64, error: BlockError },
}

/// In-memory ledger plus the handle that persists its blocks.
///
/// `Clone` produces a fully independent state - that clone is what the node
/// uses as its throwaway pending state for mempool screening.
#[derive(Clone, Debug)]
pub struct State {
    balances: HashMap<Address, u64>,
    account2nonce: HashMap<Address, u64>,
    latest_block: Option<Block>,
    latest_hash: Hash,
    has_genesis: bool,
    mining_difficulty: u64,
    datadir: PathBuf,
    store: BlockStore,
}

impl State {
    /// Rebuilds the state for a data directory: seed from genesis, then
    /// replay every persisted block in order. The first invariant violation
    /// aborts, as would any corrupt record.
    pub fn new_from_disk(datadir: &Path, mining_difficulty: u64) -> Result<State, StateError> {
        let genesis = load_genesis(datadir).map_err(StateError::Genesis)?;

        let mut state = State {
            balances: genesis.balances.into_iter().collect(),
            account2nonce: HashMap::new(),
            latest_block: None,
            latest_hash: Hash::zero(),
            has_genesis: false,
            mining_difficulty,
            datadir: datadir.to_path_buf(),
            store: BlockStore::new(datadir),
        };

        let records = state
            .store
            .get_blocks_after(Hash::zero(), usize::MAX)
            .map_err(StateError::Store)?;

        for record in records {
            let number = record.value.header.number;
            state
                .replay_record(&record)
                .map_err(|error| StateError::Replay { number, error })?;
        }

        Ok(state)
    }

    /// Validates and applies one signed transaction.
    ///
    /// Checks run in a fixed order - signature, nonce, funds - and nothing is
    /// mutated until all of them pass, so a rejected transaction leaves the
    /// state untouched.
    pub fn apply_tx(&mut self, tx: &SignedTx) -> Result<(), TxError> {
        if !tx.is_authentic() {
            return Err(TxError::BadSignature);
        }

        let expected = self.next_account_nonce(tx.tx.from);
        if tx.tx.nonce != expected {
            return Err(TxError::BadNonce {
                expected,
                got: tx.tx.nonce,
            });
        }

        if tx.tx.is_reward() {
            self.account2nonce.insert(tx.tx.from, tx.tx.nonce);
            let to = self.balances.entry(tx.tx.to).or_insert(0);
            *to = to.saturating_add(tx.tx.value);
            return Ok(());
        }

        let balance = self.balances.get(&tx.tx.from).copied().unwrap_or(0);
        let cost = tx.tx.cost().ok_or(TxError::InsufficientFunds {
            balance,
            cost: u64::MAX,
        })?;
        if balance < cost {
            return Err(TxError::InsufficientFunds { balance, cost });
        }

        self.account2nonce.insert(tx.tx.from, tx.tx.nonce);
        self.balances.insert(tx.tx.from, balance - cost);
        let to = self.balances.entry(tx.tx.to).or_insert(0);
        *to = to.saturating_add(tx.tx.value);
        Ok(())
    }

    /// Validates a block against the current tip and applies its
    /// transactions. Does not persist; callers use [`State::add_block`] for
    /// the atomic commit-and-persist path.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), BlockError> {
        let header = &block.header;

        // The tip hash starts at zero, so the first block's zero parent
        // passes the same check as every later block.
        if header.parent != self.latest_hash {
            return Err(BlockError::BadParent {
                expected: self.latest_hash,
                got: header.parent,
            });
        }

        let expected_number = self.next_block_number();
        if header.number != expected_number {
            return Err(BlockError::BadNumber {
                expected: expected_number,
                got: header.number,
            });
        }

        if let Some(latest) = &self.latest_block {
            if header.time <= latest.header.time {
                return Err(BlockError::NonMonotoneTime {
                    parent: latest.header.time,
                    block: header.time,
                });
            }
        }

        let hash = block.hash();
        if !is_valid_block_hash(&hash, header.difficulty) {
            return Err(BlockError::BadPow(hash, header.difficulty));
        }

        for tx in &block.txs {
            self.apply_tx(tx).map_err(BlockError::TxRejected)?;
        }

        self.latest_block = Some(block.clone());
        self.latest_hash = hash;
        self.has_genesis = true;
        Ok(())
    }

    /// Applies a block atomically and persists it.
    ///
    /// The block is applied to a clone first; the canonical state only
    /// observes the block once validation and the disk append both succeed.
    pub fn add_block(&mut self, block: Block) -> Result<Hash, BlockError> {
        let mut candidate = self.clone();
        candidate.apply_block(&block)?;

        let record = BlockRecord::new(block);
        candidate
            .store
            .append(&record)
            .map_err(BlockError::Store)?;

        *self = candidate;
        Ok(record.hash)
    }

    /// Deep copy with no shared mutability; the node's pending state.
    pub fn copy(&self) -> State {
        self.clone()
    }

    /// Sets the difficulty future mined blocks will carry.
    pub fn change_difficulty(&mut self, difficulty: u64) {
        self.mining_difficulty = difficulty;
    }

    /// The nonce the next transaction from `addr` must carry. Accounts start
    /// at an implicit zero, so a fresh account's first nonce is 1.
    pub fn next_account_nonce(&self, addr: Address) -> u64 {
        self.account2nonce.get(&addr).copied().unwrap_or(0) + 1
    }

    /// Height the next block must carry; 0 before any block exists.
    pub fn next_block_number(&self) -> u64 {
        if !self.has_genesis {
            return 0;
        }
        match &self.latest_block {
            Some(block) => block.header.number + 1,
            None => 0,
        }
    }

    pub fn latest_hash(&self) -> Hash {
        self.latest_hash
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.latest_block.as_ref()
    }

    pub fn mining_difficulty(&self) -> u64 {
        self.mining_difficulty
    }

    pub fn balances(&self) -> &HashMap<Address, u64> {
        &self.balances
    }

    pub fn account2nonce(&self) -> &HashMap<Address, u64> {
        &self.account2nonce
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.store
    }

    /// Truncates the block log and re-seeds the ledger from genesis.
    pub fn reset_chain(&mut self) -> Result<(), StateError> {
        self.store.reset().map_err(StateError::Store)?;

        let genesis = load_genesis(&self.datadir).map_err(StateError::Genesis)?;
        self.balances = genesis.balances.into_iter().collect();
        self.account2nonce.clear();
        self.latest_block = None;
        self.latest_hash = Hash::zero();
        self.has_genesis = false;
        Ok(())
    }

    /// Replays one persisted record, checking its stored key against the
    /// recomputed block hash.
    fn replay_record(&mut self, record: &BlockRecord) -> Result<(), BlockError> {
        self.apply_block(&record.value)?;
        if record.hash != self.latest_hash {
            return Err(BlockError::Store(BlockStoreError::CorruptRecord {
                line: record.value.header.number as usize + 1,
                reason: format!(
                    "stored key {} does not match block hash {}",
                    record.hash, self.latest_hash
                ),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tx::{REWARD_DATA, TX_FEE, Tx};
    use crate::utils::test_utils::utils::{mine_next, signed_transfer, test_key, temp_state};

    #[test]
    fn genesis_bootstrap_seeds_balances() {
        let key = test_key(1);
        let (_dir, state) = temp_state(&[(key.address(), 1_000_000)]);

        assert_eq!(state.balances().get(&key.address()), Some(&1_000_000));
        assert_eq!(state.latest_hash(), Hash::zero());
        assert_eq!(state.next_block_number(), 0);
        assert_eq!(state.next_account_nonce(key.address()), 1);
    }

    #[test]
    fn apply_tx_moves_value_and_burns_the_fee() {
        let key = test_key(1);
        let to = Address([0xAA; 20]);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        state.apply_tx(&signed_transfer(&key, to, 100, 1)).unwrap();

        assert_eq!(state.balances().get(&key.address()), Some(&(900 - TX_FEE)));
        assert_eq!(state.balances().get(&to), Some(&100));
        assert_eq!(state.next_account_nonce(key.address()), 2);
    }

    #[test]
    fn apply_tx_rejects_bad_signature_untouched() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        let mut tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        tx.tx.value = 500;

        assert!(matches!(state.apply_tx(&tx), Err(TxError::BadSignature)));
        assert_eq!(state.balances().get(&key.address()), Some(&1_000));
    }

    #[test]
    fn apply_tx_rejects_wrong_nonce() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 2);
        assert!(matches!(
            state.apply_tx(&tx),
            Err(TxError::BadNonce { expected: 1, got: 2 })
        ));
    }

    #[test]
    fn apply_tx_rejects_insufficient_funds_atomically() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 100)]);

        // value alone fits, value + fee does not
        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        assert!(matches!(
            state.apply_tx(&tx),
            Err(TxError::InsufficientFunds { balance: 100, cost }) if cost == 100 + TX_FEE
        ));
        assert_eq!(state.balances().get(&key.address()), Some(&100));
        assert_eq!(state.next_account_nonce(key.address()), 1);
    }

    #[test]
    fn reward_tx_mints_without_fee_or_funds_check() {
        let key = test_key(1);
        let me = key.address();
        let (_dir, mut state) = temp_state(&[(me, 0)]);

        let reward = Tx::new(me, me, 500, 1, REWARD_DATA).sign(&key).unwrap();
        state.apply_tx(&reward).unwrap();

        assert_eq!(state.balances().get(&me), Some(&500));
        assert_eq!(state.next_account_nonce(me), 2);
    }

    #[test]
    fn add_block_advances_the_tip() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        let block = mine_next(&state, Address([0xBB; 20]), vec![tx]);
        let hash = state.add_block(block.clone()).unwrap();

        assert_eq!(hash, block.hash());
        assert_eq!(state.latest_hash(), hash);
        assert_eq!(state.next_block_number(), 1);
        assert_eq!(state.balances().get(&key.address()), Some(&(850)));
    }

    #[test]
    fn sum_of_balances_drops_by_fee_per_transfer() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);
        let total_before: u64 = state.balances().values().sum();

        let txs = vec![
            signed_transfer(&key, Address([0xAA; 20]), 100, 1),
            signed_transfer(&key, Address([0xAB; 20]), 200, 2),
        ];
        let block = mine_next(&state, Address([0xBB; 20]), txs);
        state.add_block(block).unwrap();

        let total_after: u64 = state.balances().values().sum();
        assert_eq!(total_after, total_before - 2 * TX_FEE);
    }

    #[test]
    fn applying_the_same_block_twice_is_rejected() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        let block = mine_next(&state, Address([0xBB; 20]), vec![tx]);
        state.add_block(block.clone()).unwrap();

        assert!(matches!(
            state.add_block(block),
            Err(BlockError::BadParent { .. })
        ));
    }

    #[test]
    fn block_with_wrong_parent_is_rejected() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);
        let first = mine_next(
            &state,
            Address([0xBB; 20]),
            vec![signed_transfer(&key, Address([0xAA; 20]), 10, 1)],
        );
        state.add_block(first).unwrap();

        // Same height, wrong parent.
        let mut forged = mine_next(
            &state,
            Address([0xBB; 20]),
            vec![signed_transfer(&key, Address([0xAA; 20]), 10, 2)],
        );
        forged.header.parent = Hash([0xCC; 32]);

        assert!(matches!(
            state.add_block(forged),
            Err(BlockError::BadParent { .. })
        ));
    }

    #[test]
    fn block_time_must_advance() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);
        let first = mine_next(
            &state,
            Address([0xBB; 20]),
            vec![signed_transfer(&key, Address([0xAA; 20]), 10, 1)],
        );
        let first_time = first.header.time;
        state.add_block(first).unwrap();

        let mut stale = crate::core::miner::PendingBlock::new(
            state.latest_hash(),
            state.next_block_number(),
            Address([0xBB; 20]),
            state.mining_difficulty(),
            vec![signed_transfer(&key, Address([0xAA; 20]), 10, 2)],
        );
        stale.time = first_time;
        let block = crate::core::miner::mine(stale, &crate::core::miner::CancelSignal::new())
            .unwrap();

        assert!(matches!(
            state.add_block(block),
            Err(BlockError::NonMonotoneTime { .. })
        ));
    }

    #[test]
    fn failed_block_leaves_canonical_state_unchanged() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 120)]);

        // First tx drains the funds the second one needs: the block must be
        // rejected as a whole, with no partial application.
        let txs = vec![
            signed_transfer(&key, Address([0xAA; 20]), 50, 1),
            signed_transfer(&key, Address([0xAA; 20]), 50, 2),
        ];
        let block = mine_next(&state, Address([0xBB; 20]), txs);

        assert!(matches!(
            state.add_block(block),
            Err(BlockError::TxRejected(TxError::InsufficientFunds { .. }))
        ));
        assert_eq!(state.balances().get(&key.address()), Some(&120));
        assert_eq!(state.next_block_number(), 0);
        assert_eq!(state.next_account_nonce(key.address()), 1);
    }

    #[test]
    fn restart_replays_to_the_same_state() {
        let key = test_key(1);
        let (dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        for nonce in 1..=3u64 {
            let tx = signed_transfer(&key, Address([0xAA; 20]), 10, nonce);
            let block = mine_next(&state, Address([0xBB; 20]), vec![tx]);
            state.add_block(block).unwrap();
        }

        let reloaded = State::new_from_disk(dir.path(), 1).unwrap();
        assert_eq!(reloaded.latest_hash(), state.latest_hash());
        assert_eq!(reloaded.balances(), state.balances());
        assert_eq!(reloaded.account2nonce(), state.account2nonce());
        assert_eq!(reloaded.next_block_number(), 4);
    }

    #[test]
    fn pending_copy_does_not_leak_into_canonical() {
        let key = test_key(1);
        let (_dir, state) = temp_state(&[(key.address(), 1_000)]);

        let mut pending = state.copy();
        pending
            .apply_tx(&signed_transfer(&key, Address([0xAA; 20]), 100, 1))
            .unwrap();

        assert_eq!(state.balances().get(&key.address()), Some(&1_000));
        assert_eq!(state.next_account_nonce(key.address()), 1);
    }

    #[test]
    fn reset_chain_reseeds_from_genesis() {
        let key = test_key(1);
        let (_dir, mut state) = temp_state(&[(key.address(), 1_000)]);

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        let block = mine_next(&state, Address([0xBB; 20]), vec![tx]);
        state.add_block(block).unwrap();

        state.reset_chain().unwrap();

        assert_eq!(state.balances().get(&key.address()), Some(&1_000));
        assert_eq!(state.latest_hash(), Hash::zero());
        assert_eq!(state.next_block_number(), 0);
        assert!(
            state
                .block_store()
                .get_blocks_after(Hash::zero(), 10)
                .unwrap()
                .is_empty()
        );
    }
}
