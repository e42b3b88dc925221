//! HTTP client for the peer protocol.
//!
//! Thin wrappers over the peer endpoints with a per-call timeout. Retry and
//! ordering policy live in the sync loop, not here.

use crate::core::block::BlockRecord;
use crate::core::tx::SignedTx;
use crate::network::http::{AddPeerRes, StatusRes, SyncRes, TxAddReq, TxAddRes, encode_tx};
use crate::network::node::PeerNode;
use crate::types::hash::Hash;
use reqwest::Client;
use std::time::Duration;

/// Per-request timeout; a slow peer is skipped for the cycle.
const REQUEST_TIMEOUT_SECONDS: u64 = 5;

/// Sync mode selecting records after or before the given hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    After,
    Before,
}

impl SyncMode {
    fn as_str(self) -> &'static str {
        match self {
            SyncMode::After => "after",
            SyncMode::Before => "before",
        }
    }
}

#[derive(Clone)]
pub struct PeerClient {
    http: Client,
}

impl PeerClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// `GET /node/status`: the peer's tip, mempool, and known peers.
    pub async fn status(&self, peer: &PeerNode) -> Result<StatusRes, reqwest::Error> {
        self.http
            .get(format!("{}/node/status", peer.base_url()))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// `GET /node/sync`: up to `last` block records around `from`.
    pub async fn sync(
        &self,
        peer: &PeerNode,
        from: Hash,
        mode: SyncMode,
        last: usize,
    ) -> Result<Vec<BlockRecord>, reqwest::Error> {
        let res: SyncRes = self
            .http
            .get(format!("{}/node/sync", peer.base_url()))
            .query(&[
                ("fromBlock", from.to_string()),
                ("mode", mode.as_str().to_string()),
                ("last", last.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(res.blocks)
    }

    /// `GET /node/peer`: introduces `me` to the peer.
    pub async fn add_peer(
        &self,
        peer: &PeerNode,
        me: &PeerNode,
    ) -> Result<AddPeerRes, reqwest::Error> {
        self.http
            .get(format!("{}/node/peer", peer.base_url()))
            .query(&[
                ("ip", me.ip.clone()),
                ("port", me.port.to_string()),
                ("miner", me.account.to_string()),
                ("version", me.node_version.clone()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    /// `POST /tx/add`: forwards a signed tx to the peer's mempool.
    pub async fn tx_add(
        &self,
        peer: &PeerNode,
        tx: &SignedTx,
    ) -> Result<TxAddRes, reqwest::Error> {
        self.http
            .post(format!("{}/tx/add", peer.base_url()))
            .json(&TxAddReq { tx: encode_tx(tx) })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}
