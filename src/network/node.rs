//! The node orchestrator.
//!
//! One owner task holds the canonical state, the pending screening state, the
//! mempool, and the peer table, and processes `NodeCommand`s from a channel.
//! It is the sole writer: the mining loop, sync loop, and HTTP handlers all
//! talk to it through a [`NodeHandle`] and read immutable [`StateView`]
//! snapshots, so readers never race the writer and blocks apply in a single
//! serialized order.

use crate::core::block::Block;
use crate::core::miner::{CancelSignal, MineError, PendingBlock, mine};
use crate::core::state::{BlockError, State, StateError, TxError};
use crate::core::tx::SignedTx;
use crate::network::http::{self, AppState};
use crate::network::mempool::Mempool;
use crate::network::sync::sync_loop;
use crate::types::address::Address;
use crate::types::hash::Hash;
use crate::utils::log::Logger;
use crate::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tinychain_derive::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Version string peers see in status responses.
pub const NODE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Difficulty used when none is configured.
pub const DEFAULT_MINING_DIFFICULTY: u64 = 2;

/// Cadence of the mining loop's tick.
pub const MINING_INTERVAL_SECONDS: u64 = 3;

/// Every this many blocks the node re-evaluates its difficulty.
pub const BLOCK_NUMBER_TO_CHECK_DIFFICULTY: u64 = 10;

/// Target average inter-block time the difficulty adjustment steers toward.
pub const MINING_APPROX_TIME_SECONDS: u64 = 15;

/// Buffer of the accepted-tx wake-up channel.
const PENDING_TX_BUFFER: usize = 10_000;

/// Buffer of the owner task's command channel.
const COMMAND_BUFFER: usize = 1_024;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The tx is already waiting in the mempool.
    #[error("tx already pending")]
    AlreadyPending,
    /// The tx was already mined into a block.
    #[error("tx already archived in a mined block")]
    AlreadyArchived,
    /// Another pending tx from the same sender carries this nonce.
    #[error("tx with the same sender and nonce already pending")]
    DuplicateNonce,
    /// The tx failed screening against pending state.
    #[error("{0}")]
    Tx(TxError),
    /// The block failed validation against canonical state.
    #[error("{0}")]
    Block(BlockError),
    /// The owner task is gone; the node is shutting down.
    #[error("node command channel closed")]
    ChannelClosed,
}

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("{0}")]
    State(StateError),
    #[error("http server failure: {0}")]
    Http(String),
}

/// A peer as tracked in the peer table and exchanged in status responses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub ip: String,
    pub port: u16,
    pub is_bootstrap: bool,
    pub account: Address,
    pub node_version: String,
    /// Whether this node has introduced itself to the peer yet; local
    /// bookkeeping, never serialized.
    #[serde(skip)]
    pub connected: bool,
}

impl PeerNode {
    pub fn new(ip: &str, port: u16, is_bootstrap: bool, account: Address) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            is_bootstrap,
            account,
            node_version: NODE_VERSION.to_string(),
            connected: false,
        }
    }

    /// Peer-table key.
    pub fn tcp_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

/// Immutable snapshot of everything readers need.
#[derive(Clone, Debug)]
pub struct StateView {
    pub latest_hash: Hash,
    pub block_number: u64,
    pub balances: HashMap<Address, u64>,
    pub account2nonce: HashMap<Address, u64>,
    pub difficulty: u64,
    pub known_peers: HashMap<String, PeerNode>,
    pub pending_txs: Vec<SignedTx>,
    pub account: Address,
    pub node_version: String,
}

/// Commands processed by the owner task.
enum NodeCommand {
    AddPendingTx {
        tx: SignedTx,
        from_peer: Option<String>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    SubmitPeerBlock {
        block: Block,
        reply: oneshot::Sender<Result<Hash, NodeError>>,
    },
    SubmitMinedBlock {
        block: Block,
        reply: oneshot::Sender<Result<Hash, NodeError>>,
    },
    BeginMining {
        cancel: CancelSignal,
        reply: oneshot::Sender<Option<PendingBlock>>,
    },
    FinishMining,
    View {
        reply: oneshot::Sender<StateView>,
    },
    NextNonce {
        account: Address,
        reply: oneshot::Sender<u64>,
    },
    AddPeer {
        peer: PeerNode,
        reply: oneshot::Sender<bool>,
    },
    RemovePeer {
        addr: String,
    },
    IsKnownPeer {
        addr: String,
        reply: oneshot::Sender<bool>,
    },
    MarkPeerConnected {
        addr: String,
    },
    MarkPeerDisconnected {
        addr: String,
    },
}

/// Clone-able front door to the owner task.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    info: PeerNode,
}

impl NodeHandle {
    /// The node's own identity (ip, port, miner account).
    pub fn info(&self) -> &PeerNode {
        &self.info
    }

    pub async fn add_pending_tx(
        &self,
        tx: SignedTx,
        from_peer: Option<String>,
    ) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::AddPendingTx { tx, from_peer, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    pub async fn submit_peer_block(&self, block: Block) -> Result<Hash, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::SubmitPeerBlock { block, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    pub async fn submit_mined_block(&self, block: Block) -> Result<Hash, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::SubmitMinedBlock { block, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Claims the miner slot. `None` when a mining attempt is already running
    /// or the mempool is empty.
    pub async fn begin_mining(
        &self,
        cancel: CancelSignal,
    ) -> Result<Option<PendingBlock>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::BeginMining { cancel, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Releases the miner slot after a cancelled or failed attempt.
    pub async fn finish_mining(&self) -> Result<(), NodeError> {
        self.send(NodeCommand::FinishMining).await
    }

    pub async fn state_view(&self) -> Result<StateView, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::View { reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Next nonce for `account`, counting txs already pending.
    pub async fn next_nonce(&self, account: Address) -> Result<u64, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::NextNonce { account, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Adds a peer to the table; returns false when it was already known
    /// (the node's own address always counts as known).
    pub async fn add_peer(&self, peer: PeerNode) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::AddPeer { peer, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    /// Drops a peer from the table entirely.
    pub async fn remove_peer(&self, addr: String) -> Result<(), NodeError> {
        self.send(NodeCommand::RemovePeer { addr }).await
    }

    /// True for peers in the table and for the node's own address.
    pub async fn is_known_peer(&self, addr: String) -> Result<bool, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::IsKnownPeer { addr, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    pub async fn mark_peer_connected(&self, addr: String) -> Result<(), NodeError> {
        self.send(NodeCommand::MarkPeerConnected { addr }).await
    }

    pub async fn mark_peer_disconnected(&self, addr: String) -> Result<(), NodeError> {
        self.send(NodeCommand::MarkPeerDisconnected { addr }).await
    }

    async fn send(&self, command: NodeCommand) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NodeError::ChannelClosed)
    }
}

/// Startup configuration assembled by the CLI.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub datadir: PathBuf,
    pub ip: String,
    pub port: u16,
    pub miner: Address,
    pub bootstrap: Option<PeerNode>,
    pub mining_difficulty: u64,
}

/// The owner task: sole writer of canonical state, pending state, mempool,
/// and the peer table.
pub struct Node {
    info: PeerNode,
    state: State,
    pending_state: State,
    mempool: Mempool,
    known_peers: HashMap<String, PeerNode>,
    is_mining: bool,
    miner_cancel: Option<CancelSignal>,
    new_pending_txs: mpsc::Sender<SignedTx>,
    commands: mpsc::Receiver<NodeCommand>,
    logger: Logger,
}

impl Node {
    /// Loads state from disk and wires the command plumbing.
    ///
    /// Returns the owner, its handle, and the receiving side of the
    /// accepted-tx wake-up channel consumed by the mining loop.
    pub fn new(
        config: &NodeConfig,
    ) -> Result<(Node, NodeHandle, mpsc::Receiver<SignedTx>), StateError> {
        let difficulty = config.mining_difficulty.max(1);
        let state = State::new_from_disk(&config.datadir, difficulty)?;
        let pending_state = state.copy();

        let mut info = PeerNode::new(&config.ip, config.port, false, config.miner);
        info.connected = true;

        let mut known_peers = HashMap::new();
        if let Some(bootstrap) = &config.bootstrap {
            known_peers.insert(bootstrap.tcp_address(), bootstrap.clone());
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (wake_tx, wake_rx) = mpsc::channel(PENDING_TX_BUFFER);

        let node = Node {
            logger: Logger::new(info.tcp_address()),
            info: info.clone(),
            state,
            pending_state,
            mempool: Mempool::new(),
            known_peers,
            is_mining: false,
            miner_cancel: None,
            new_pending_txs: wake_tx,
            commands: command_rx,
        };
        let handle = NodeHandle {
            commands: command_tx,
            info,
        };
        Ok((node, handle, wake_rx))
    }

    /// Command loop; returns once every handle is dropped.
    pub async fn run(mut self) {
        self.logger.info(&format!(
            "state loaded: height={} tip={} difficulty={}",
            self.state.next_block_number(),
            self.state.latest_hash(),
            self.state.mining_difficulty()
        ));
        // The configured difficulty may be stale relative to the replayed
        // chain; re-evaluate once before mining starts.
        self.check_difficulty();

        while let Some(command) = self.commands.recv().await {
            self.handle(command);
        }
        self.logger.info("owner task stopped");
    }

    fn handle(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::AddPendingTx { tx, from_peer, reply } => {
                let _ = reply.send(self.add_pending_tx(tx, from_peer.as_deref()));
            }
            NodeCommand::SubmitPeerBlock { block, reply } => {
                let _ = reply.send(self.add_block(block, true));
            }
            NodeCommand::SubmitMinedBlock { block, reply } => {
                self.is_mining = false;
                self.miner_cancel = None;
                let _ = reply.send(self.add_block(block, false));
            }
            NodeCommand::BeginMining { cancel, reply } => {
                let _ = reply.send(self.begin_mining(cancel));
            }
            NodeCommand::FinishMining => {
                self.is_mining = false;
                self.miner_cancel = None;
            }
            NodeCommand::View { reply } => {
                let _ = reply.send(self.state_view());
            }
            NodeCommand::NextNonce { account, reply } => {
                let _ = reply.send(self.pending_state.next_account_nonce(account));
            }
            NodeCommand::AddPeer { peer, reply } => {
                let _ = reply.send(self.add_peer(peer));
            }
            NodeCommand::RemovePeer { addr } => {
                if self.known_peers.remove(&addr).is_some() {
                    self.logger.info(&format!("peer {addr} removed from the table"));
                }
            }
            NodeCommand::IsKnownPeer { addr, reply } => {
                let known =
                    addr == self.info.tcp_address() || self.known_peers.contains_key(&addr);
                let _ = reply.send(known);
            }
            NodeCommand::MarkPeerConnected { addr } => {
                if let Some(peer) = self.known_peers.get_mut(&addr) {
                    peer.connected = true;
                }
            }
            NodeCommand::MarkPeerDisconnected { addr } => {
                if let Some(peer) = self.known_peers.get_mut(&addr) {
                    peer.connected = false;
                }
            }
        }
    }

    /// Screens a tx against pending state and buffers it in the mempool.
    fn add_pending_tx(&mut self, tx: SignedTx, from_peer: Option<&str>) -> Result<(), NodeError> {
        let hash = tx.hash();
        if self.mempool.is_pending(hash) {
            return Err(NodeError::AlreadyPending);
        }
        if self.mempool.is_archived(hash) {
            return Err(NodeError::AlreadyArchived);
        }
        if self.mempool.has_sender_nonce(tx.tx.from, tx.tx.nonce) {
            return Err(NodeError::DuplicateNonce);
        }

        self.pending_state.apply_tx(&tx).map_err(NodeError::Tx)?;

        self.logger.info(&format!(
            "accepted pending tx {hash} from {}",
            from_peer.unwrap_or("local submitter")
        ));
        self.mempool.insert(tx.clone());
        // Wake-up only; a full buffer just means the miner is already busy.
        let _ = self.new_pending_txs.try_send(tx);
        Ok(())
    }

    /// Applies a block to canonical state and re-syncs everything hanging off
    /// it: pending state, mempool, difficulty.
    fn add_block(&mut self, block: Block, from_peer: bool) -> Result<Hash, NodeError> {
        if from_peer {
            if let Some(cancel) = self.miner_cancel.take() {
                self.logger
                    .info("a peer mined the next block first, cancelling the local attempt");
                cancel.cancel();
                self.is_mining = false;
            }
        }

        let hash = self
            .state
            .add_block(block.clone())
            .map_err(NodeError::Block)?;

        self.pending_state = self.state.copy();
        let purged = self.mempool.archive_mined(&block);

        self.logger.info(&format!(
            "added block {}: hash={hash} txs={} purged={purged} source={}",
            block.header.number,
            block.txs.len(),
            if from_peer { "peer" } else { "miner" },
        ));

        self.check_difficulty();
        Ok(hash)
    }

    /// Claims the miner slot and snapshots a pending block.
    fn begin_mining(&mut self, cancel: CancelSignal) -> Option<PendingBlock> {
        if self.is_mining || self.mempool.is_empty() {
            return None;
        }

        let mut pending = PendingBlock::new(
            self.state.latest_hash(),
            self.state.next_block_number(),
            self.info.account,
            self.state.mining_difficulty(),
            self.mempool.pending_sorted(),
        );
        // Block times are strictly increasing; step past the parent when
        // blocks land faster than the one-second clock.
        if let Some(latest) = self.state.latest_block() {
            if pending.time <= latest.header.time {
                pending.time = latest.header.time + 1;
            }
        }

        self.is_mining = true;
        self.miner_cancel = Some(cancel);
        Some(pending)
    }

    /// Periodic difficulty adjustment from observed block header times.
    fn check_difficulty(&mut self) {
        let Some(latest) = self.state.latest_block() else {
            return;
        };
        if latest.header.number % BLOCK_NUMBER_TO_CHECK_DIFFICULTY != 0 {
            return;
        }

        let window = match self.state.block_store().get_blocks_before(
            self.state.latest_hash(),
            BLOCK_NUMBER_TO_CHECK_DIFFICULTY as usize,
        ) {
            Ok(window) => window,
            Err(e) => {
                self.logger.error(&format!("difficulty check failed: {e}"));
                return;
            }
        };
        if window.is_empty() {
            return;
        }

        let first = window[0].value.header.time;
        let last = window[window.len() - 1].value.header.time;
        let average = last.saturating_sub(first) / window.len() as u64;
        if average == 0 {
            return;
        }

        let current = self.state.mining_difficulty();
        let adjusted = if average < MINING_APPROX_TIME_SECONDS {
            current + 1
        } else if average > MINING_APPROX_TIME_SECONDS {
            current.saturating_sub(1).max(1)
        } else {
            current
        };

        if adjusted != current {
            self.logger.info(&format!(
                "difficulty adjusted {current} -> {adjusted} (average block time {average}s)"
            ));
            self.state.change_difficulty(adjusted);
            self.pending_state.change_difficulty(adjusted);
        }
    }

    fn state_view(&self) -> StateView {
        StateView {
            latest_hash: self.state.latest_hash(),
            block_number: self
                .state
                .latest_block()
                .map(|b| b.header.number)
                .unwrap_or(0),
            balances: self.state.balances().clone(),
            account2nonce: self.state.account2nonce().clone(),
            difficulty: self.state.mining_difficulty(),
            known_peers: self.known_peers.clone(),
            pending_txs: self.mempool.pending_sorted(),
            account: self.info.account,
            node_version: self.info.node_version.clone(),
        }
    }

    fn add_peer(&mut self, peer: PeerNode) -> bool {
        let addr = peer.tcp_address();
        if addr == self.info.tcp_address() || self.known_peers.contains_key(&addr) {
            return false;
        }
        self.logger.info(&format!("peer {addr} added to the table"));
        self.known_peers.insert(addr, peer);
        true
    }
}

/// The mining loop: tick or tx-arrival wakes it, the owner hands out one
/// attempt at a time, and a losing race simply surfaces as a rejected block.
pub async fn mining_loop(
    handle: NodeHandle,
    mut wake: mpsc::Receiver<SignedTx>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(MINING_INTERVAL_SECONDS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wake.recv() => {}
            _ = shutdown.changed() => return,
        }

        let cancel = CancelSignal::new();
        let pending = match handle.begin_mining(cancel.clone()).await {
            Ok(Some(pending)) => pending,
            Ok(None) => continue,
            Err(NodeError::ChannelClosed) => return,
            Err(_) => continue,
        };

        let mined = tokio::task::spawn_blocking(move || mine(pending, &cancel)).await;
        match mined {
            Ok(Ok(block)) => match handle.submit_mined_block(block).await {
                Ok(_) => {}
                Err(NodeError::ChannelClosed) => return,
                // Typically BadParent: a peer block landed between the
                // snapshot and the submit. The mempool still holds our txs.
                Err(e) => info!("mined block discarded: {e}"),
            },
            Ok(Err(MineError::Cancelled)) => {
                let _ = handle.finish_mining().await;
            }
            Err(e) => {
                error!("mining task failed: {e}");
                let _ = handle.finish_mining().await;
            }
        }
    }
}

/// Starts the owner task, the mining and sync loops, and the HTTP server,
/// then waits for shutdown.
pub async fn run(config: NodeConfig, shutdown: watch::Receiver<bool>) -> Result<(), StartError> {
    let (node, handle, wake) = Node::new(&config).map_err(StartError::State)?;
    let store = node.state.block_store().clone();

    info!(
        "node {} listening on {}:{}",
        handle.info().account,
        config.ip,
        config.port
    );

    let owner = tokio::spawn(node.run());
    let miner = tokio::spawn(mining_loop(handle.clone(), wake, shutdown.clone()));
    let syncer = tokio::spawn(sync_loop(handle.clone(), shutdown.clone()));

    let app = AppState {
        handle: handle.clone(),
        store,
    };
    let result = http::serve(&config.ip, config.port, app, shutdown).await;
    if result.is_err() {
        // Bind failures happen before any shutdown signal; stop the loops
        // directly instead of waiting for one.
        miner.abort();
        syncer.abort();
    }

    // The loops exit on the shutdown signal; dropping the last handle then
    // stops the owner.
    let _ = miner.await;
    let _ = syncer.await;
    drop(handle);
    let _ = owner.await;

    result.map_err(|e| StartError::Http(e.to_string()))
}
