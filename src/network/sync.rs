//! Periodic peer synchronization.
//!
//! Every cycle the node asks each known peer for its status, pulls blocks it
//! is missing, merges newly learned peers, and forwards unseen mempool txs
//! into its own ingress path. A peer that fails any call is marked
//! disconnected and retried on a later cycle; nothing is ever removed from
//! the table here.

use crate::network::client::{PeerClient, SyncMode};
use crate::network::http::StatusRes;
use crate::network::node::{NodeError, NodeHandle, PeerNode, StateView};
use crate::{info, warn};
use std::time::Duration;
use tokio::sync::watch;

/// Cadence of the sync loop.
pub const SYNC_INTERVAL_SECONDS: u64 = 10;

/// Blocks fetched per request while catching up.
pub const SYNC_BATCH: usize = 50;

pub async fn sync_loop(handle: NodeHandle, mut shutdown: watch::Receiver<bool>) {
    let client = PeerClient::new();
    let mut ticker = tokio::time::interval(Duration::from_secs(SYNC_INTERVAL_SECONDS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }

        if sync_cycle(&handle, &client).await.is_err() {
            // The owner is gone; shutdown is in progress.
            return;
        }
    }
}

/// One pass over the peer table.
async fn sync_cycle(handle: &NodeHandle, client: &PeerClient) -> Result<(), NodeError> {
    let view = handle.state_view().await?;

    for (addr, peer) in &view.known_peers {
        if peer.ip.is_empty() {
            continue;
        }

        let status = match client.status(peer).await {
            Ok(status) => status,
            Err(e) => {
                warn!("peer {addr} unreachable, skipping this cycle: {e}");
                handle.mark_peer_disconnected(addr.clone()).await?;
                continue;
            }
        };

        join_peer(handle, client, addr, peer).await?;
        sync_blocks(handle, client, peer, &view, &status).await?;
        merge_known_peers(handle, &status).await?;
        sync_pending_txs(handle, &status, addr).await?;
    }
    Ok(())
}

/// Introduces this node to a peer it has not greeted yet.
async fn join_peer(
    handle: &NodeHandle,
    client: &PeerClient,
    addr: &str,
    peer: &PeerNode,
) -> Result<(), NodeError> {
    if peer.connected {
        return Ok(());
    }

    match client.add_peer(peer, handle.info()).await {
        Ok(res) if res.success => {
            info!("introduced ourselves to peer {addr}");
            handle.mark_peer_connected(addr.to_string()).await?;
        }
        Ok(res) => warn!("peer {addr} refused us: {}", res.error),
        Err(e) => warn!("introduction to peer {addr} failed: {e}"),
    }
    Ok(())
}

/// Pulls missing blocks in batches and feeds them to the owner task.
async fn sync_blocks(
    handle: &NodeHandle,
    client: &PeerClient,
    peer: &PeerNode,
    view: &StateView,
    status: &StatusRes,
) -> Result<(), NodeError> {
    let behind = status.block_number > view.block_number
        || (view.latest_hash.is_zero() && !status.block_hash.is_zero());
    if !behind {
        return Ok(());
    }

    info!(
        "peer {} is at block {}, we are at {}; catching up",
        peer.tcp_address(),
        status.block_number,
        view.block_number
    );

    let mut from = view.latest_hash;
    loop {
        let records = match client.sync(peer, from, SyncMode::After, SYNC_BATCH).await {
            Ok(records) => records,
            Err(e) => {
                warn!("block fetch from {} failed: {e}", peer.tcp_address());
                handle.mark_peer_disconnected(peer.tcp_address()).await?;
                return Ok(());
            }
        };
        if records.is_empty() {
            return Ok(());
        }

        for record in records {
            from = record.hash;
            match handle.submit_peer_block(record.value).await {
                Ok(_) => {}
                Err(NodeError::ChannelClosed) => return Err(NodeError::ChannelClosed),
                // An invalid block poisons the rest of the batch; stop
                // pulling from this peer until the next cycle.
                Err(e) => {
                    warn!("peer {} sent an invalid block: {e}", peer.tcp_address());
                    return Ok(());
                }
            }
        }
    }
}

/// Adds peers this peer knows and we do not, as not-yet-connected entries.
async fn merge_known_peers(handle: &NodeHandle, status: &StatusRes) -> Result<(), NodeError> {
    for peer in status.peers_known.values() {
        let mut peer = peer.clone();
        peer.connected = false;
        if handle.add_peer(peer.clone()).await? {
            info!("learned about peer {} from gossip", peer.tcp_address());
        }
    }
    Ok(())
}

/// Feeds the peer's mempool through our own ingress screening.
async fn sync_pending_txs(
    handle: &NodeHandle,
    status: &StatusRes,
    addr: &str,
) -> Result<(), NodeError> {
    for tx in &status.pending_txs {
        match handle
            .add_pending_tx(tx.clone(), Some(addr.to_string()))
            .await
        {
            Ok(()) => {}
            Err(NodeError::ChannelClosed) => return Err(NodeError::ChannelClosed),
            // Duplicates and already-mined txs are the common case here.
            Err(_) => {}
        }
    }
    Ok(())
}
