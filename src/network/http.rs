//! HTTP surface: a thin adapter mapping routes onto node operations.
//!
//! Handlers do no validation of their own beyond decoding; every decision
//! belongs to the owner task behind the [`NodeHandle`]. Sync reads go
//! straight to a read-only [`BlockStore`] clone, which opens its own file
//! handles and therefore never touches the owner.

use crate::core::block::BlockRecord;
use crate::core::tx::SignedTx;
use crate::network::node::{NodeHandle, PeerNode};
use crate::storage::block_store::BlockStore;
use crate::types::address::Address;
use crate::types::encoding::Decode;
use crate::types::hash::Hash;
use crate::types::{decode_hex, encode_hex};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;

/// Default window for sync requests that omit `last`.
const SYNC_DEFAULT_LAST: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub handle: NodeHandle,
    pub store: BlockStore,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrRes {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalancesRes {
    pub block_hash: Hash,
    pub balances: HashMap<Address, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxAddReq {
    /// Hex of the canonical signed-tx encoding.
    pub tx: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TxAddRes {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusRes {
    pub block_hash: Hash,
    pub block_number: u64,
    pub peers_known: HashMap<String, PeerNode>,
    pub pending_txs: Vec<SignedTx>,
    pub node_version: String,
    pub account: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncRes {
    pub blocks: Vec<BlockRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddPeerRes {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextNonceReq {
    pub account: Address,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextNonceRes {
    pub nonce: u64,
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(rename = "fromBlock")]
    pub from_block: String,
    pub mode: Option<String>,
    pub last: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddPeerQuery {
    pub ip: String,
    pub port: String,
    pub miner: String,
    pub version: Option<String>,
}

/// Client errors map to 400, node rejections and internal failures to 500;
/// both carry `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn internal(message: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrRes {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/balances/list", get(balances_list))
        .route("/tx/add", post(tx_add))
        .route("/node/status", get(node_status))
        .route("/node/sync", get(node_sync))
        .route("/node/peer", get(node_peer))
        .route("/address/nonce/next", post(next_nonce))
        .with_state(app)
}

/// Binds and serves until the shutdown signal fires; in-flight requests
/// drain before the call returns.
pub async fn serve(
    ip: &str,
    port: u16,
    app: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{ip}:{port}")).await?;
    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn balances_list(State(app): State<AppState>) -> Result<Json<BalancesRes>, ApiError> {
    let view = app.handle.state_view().await.map_err(ApiError::internal)?;
    Ok(Json(BalancesRes {
        block_hash: view.latest_hash,
        balances: view.balances,
    }))
}

async fn tx_add(
    State(app): State<AppState>,
    Json(req): Json<TxAddReq>,
) -> Result<Json<TxAddRes>, ApiError> {
    let raw = decode_hex(&req.tx).map_err(ApiError::bad_request)?;
    let tx = SignedTx::from_bytes(&raw)
        .map_err(|_| ApiError::bad_request("malformed signed tx encoding"))?;

    app.handle
        .add_pending_tx(tx, None)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(TxAddRes { success: true }))
}

async fn node_status(State(app): State<AppState>) -> Result<Json<StatusRes>, ApiError> {
    let view = app.handle.state_view().await.map_err(ApiError::internal)?;
    Ok(Json(StatusRes {
        block_hash: view.latest_hash,
        block_number: view.block_number,
        peers_known: view.known_peers,
        pending_txs: view.pending_txs,
        node_version: view.node_version,
        account: view.account,
    }))
}

async fn node_sync(
    State(app): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncRes>, ApiError> {
    let from: Hash = query.from_block.parse().map_err(ApiError::bad_request)?;
    let last = query
        .last
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(SYNC_DEFAULT_LAST);

    let blocks = match query.mode.as_deref() {
        Some("after") => app.store.get_blocks_after(from, last),
        // The original wire protocol treats anything else as "before".
        _ => app.store.get_blocks_before(from, last),
    }
    .map_err(ApiError::internal)?;

    Ok(Json(SyncRes { blocks }))
}

async fn node_peer(
    State(app): State<AppState>,
    Query(query): Query<AddPeerQuery>,
) -> Result<Json<AddPeerRes>, ApiError> {
    let port: u16 = match query.port.parse() {
        Ok(port) => port,
        Err(e) => {
            return Ok(Json(AddPeerRes {
                success: false,
                error: e.to_string(),
            }));
        }
    };
    let account: Address = match query.miner.parse() {
        Ok(account) => account,
        Err(e) => {
            return Ok(Json(AddPeerRes {
                success: false,
                error: format!("bad miner address: {e}"),
            }));
        }
    };

    let mut peer = PeerNode::new(&query.ip, port, false, account);
    peer.node_version = query.version.unwrap_or_default();
    // The caller just reached us, so it is connected from our point of view.
    peer.connected = true;

    app.handle.add_peer(peer).await.map_err(ApiError::internal)?;
    Ok(Json(AddPeerRes {
        success: true,
        error: String::new(),
    }))
}

async fn next_nonce(
    State(app): State<AppState>,
    Json(req): Json<NextNonceReq>,
) -> Result<Json<NextNonceRes>, ApiError> {
    let nonce = app
        .handle
        .next_nonce(req.account)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(NextNonceRes { nonce }))
}

/// Hex form of a signed tx for `/tx/add` bodies.
pub fn encode_tx(tx: &SignedTx) -> String {
    use crate::types::encoding::Encode;
    encode_hex(&tx.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::node::{Node, NodeConfig};
    use crate::utils::test_utils::utils::{signed_transfer, temp_state, test_key};

    async fn test_app(funded: &[(Address, u64)]) -> (tempfile::TempDir, AppState) {
        let (dir, state) = temp_state(funded);
        let store = state.block_store().clone();
        drop(state);

        let config = NodeConfig {
            datadir: dir.path().to_path_buf(),
            ip: "127.0.0.1".to_string(),
            port: 9000,
            miner: Address([0xBB; 20]),
            bootstrap: None,
            mining_difficulty: 1,
        };
        let (node, handle, _wake) = Node::new(&config).unwrap();
        tokio::spawn(node.run());
        (dir, AppState { handle, store })
    }

    #[tokio::test]
    async fn balances_list_reports_genesis() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000_000)]).await;

        let Json(res) = balances_list(State(app)).await.unwrap();
        assert_eq!(res.block_hash, Hash::zero());
        assert_eq!(res.balances.get(&key.address()), Some(&1_000_000));
    }

    #[tokio::test]
    async fn tx_add_accepts_hex_encoded_txs() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        let req = TxAddReq { tx: encode_tx(&tx) };
        let Json(res) = tx_add(State(app.clone()), Json(req)).await.unwrap();
        assert!(res.success);

        let Json(status) = node_status(State(app)).await.unwrap();
        assert_eq!(status.pending_txs, vec![tx]);
    }

    #[tokio::test]
    async fn tx_add_rejects_garbage_hex() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let req = TxAddReq {
            tx: "0xzz".to_string(),
        };
        let err = tx_add(State(app), Json(req)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tx_add_surfaces_node_rejections() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 10)]).await;

        let tx = signed_transfer(&key, Address([0xAA; 20]), 100, 1);
        let req = TxAddReq { tx: encode_tx(&tx) };
        let err = tx_add(State(app), Json(req)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("insufficient funds"));
    }

    #[tokio::test]
    async fn next_nonce_for_a_fresh_account_is_one() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let Json(res) = next_nonce(
            State(app),
            Json(NextNonceReq {
                account: key.address(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(res.nonce, 1);
    }

    #[tokio::test]
    async fn sync_defaults_to_before_mode() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let query = SyncQuery {
            from_block: Hash::zero().to_string(),
            mode: None,
            last: None,
        };
        let Json(res) = node_sync(State(app), Query(query)).await.unwrap();
        assert!(res.blocks.is_empty());
    }

    #[tokio::test]
    async fn node_peer_reports_bad_input_in_body() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let query = AddPeerQuery {
            ip: "127.0.0.1".to_string(),
            port: "not-a-port".to_string(),
            miner: Address::zero().to_string(),
            version: None,
        };
        let Json(res) = node_peer(State(app), Query(query)).await.unwrap();
        assert!(!res.success);
        assert!(!res.error.is_empty());
    }

    #[tokio::test]
    async fn node_peer_registers_the_caller() {
        let key = test_key(1);
        let (_dir, app) = test_app(&[(key.address(), 1_000)]).await;

        let query = AddPeerQuery {
            ip: "127.0.0.1".to_string(),
            port: "9001".to_string(),
            miner: Address::zero().to_string(),
            version: Some("0.1.0".to_string()),
        };
        let Json(res) = node_peer(State(app.clone()), Query(query)).await.unwrap();
        assert!(res.success);

        let Json(status) = node_status(State(app)).await.unwrap();
        assert!(status.peers_known.contains_key("127.0.0.1:9001"));
    }
}
