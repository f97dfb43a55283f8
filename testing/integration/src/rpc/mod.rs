// File: testing/integration/src/rpc/mod.rs
//
// Node RPC surface
//
// The harness only needs a handful of calls from a node. `NodeRpc` exposes
// them as typed helpers on top of a single raw `call`, so a real HTTP client
// and an in-memory test double implement the same one method.

pub mod client;

use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

pub use client::{HttpConnector, HttpRpcClient};

/// Log target used for RPC tracing (`--tracerpc`)
pub const RPC_LOG_TARGET: &str = "NodeRpc";

/// Method names of the node RPC surface used by the harness
pub mod methods {
    pub const GET_VERSION: &str = "get_version";
    pub const GET_NODE_ID: &str = "get_node_id";
    pub const GET_SYNC_PHASE: &str = "get_sync_phase";
    pub const GENERATE_BLOCKS: &str = "generate_blocks";
    pub const STOP_NODE: &str = "stop_node";
    pub const ADD_PEER: &str = "add_peer";
    pub const GET_PEERS: &str = "get_peers";
    pub const SET_MOCK_TIME: &str = "set_mock_time";
    pub const GET_TOP_BLOCK_HASH: &str = "get_top_block_hash";
    pub const GET_MEMPOOL: &str = "get_mempool";
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> RpcResult<T> {
    serde_json::from_value(value).map_err(|e| RpcError::InvalidResponse {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// RPC interface of a single node.
///
/// Implementations only provide `call`; the typed helpers decode results and
/// report undecodable payloads as `RpcError::InvalidResponse` (fatal while
/// polling).
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Invoke `method` with `params` and return the raw `result` value
    async fn call(&self, method: &str, params: Value) -> RpcResult<Value>;

    /// Trivial liveness probe
    async fn get_version(&self) -> RpcResult<String> {
        let value = self.call(methods::GET_VERSION, Value::Null).await?;
        decode(methods::GET_VERSION, value)
    }

    /// Stable identity of the node (its P2P key)
    async fn get_node_id(&self) -> RpcResult<String> {
        let value = self.call(methods::GET_NODE_ID, Value::Null).await?;
        decode(methods::GET_NODE_ID, value)
    }

    /// Self-reported recovery/sync phase
    async fn get_sync_phase(&self) -> RpcResult<String> {
        let value = self.call(methods::GET_SYNC_PHASE, Value::Null).await?;
        decode(methods::GET_SYNC_PHASE, value)
    }

    /// Mine `count` blocks, returning their hashes
    async fn generate_blocks(&self, count: u64) -> RpcResult<Vec<String>> {
        let value = self
            .call(methods::GENERATE_BLOCKS, json!({ "count": count }))
            .await?;
        decode(methods::GENERATE_BLOCKS, value)
    }

    /// Ask the node to shut down; returns as soon as the request is accepted
    async fn stop_node(&self) -> RpcResult<()> {
        self.call(methods::STOP_NODE, Value::Null).await?;
        Ok(())
    }

    /// Connect to the peer `node_id` listening on `address`
    async fn add_peer(&self, node_id: &str, address: &str) -> RpcResult<()> {
        self.call(
            methods::ADD_PEER,
            json!({ "node_id": node_id, "address": address }),
        )
        .await?;
        Ok(())
    }

    /// Node ids of currently connected peers
    async fn get_peers(&self) -> RpcResult<Vec<String>> {
        let value = self.call(methods::GET_PEERS, Value::Null).await?;
        decode(methods::GET_PEERS, value)
    }

    /// Pin the node's clock to `timestamp` (seconds)
    async fn set_mock_time(&self, timestamp: u64) -> RpcResult<()> {
        self.call(methods::SET_MOCK_TIME, json!({ "timestamp": timestamp }))
            .await?;
        Ok(())
    }

    /// Hash of the node's best block
    async fn get_top_block_hash(&self) -> RpcResult<String> {
        let value = self.call(methods::GET_TOP_BLOCK_HASH, Value::Null).await?;
        decode(methods::GET_TOP_BLOCK_HASH, value)
    }

    /// Transaction hashes currently in the mempool
    async fn get_mempool(&self) -> RpcResult<Vec<String>> {
        let value = self.call(methods::GET_MEMPOOL, Value::Null).await?;
        decode(methods::GET_MEMPOOL, value)
    }
}

/// Where a node's RPC lives, handed to a connector
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
    pub index: usize,
    pub url: String,
    pub datadir: PathBuf,
}

/// Creates RPC clients for nodes as they are materialized
pub trait RpcConnector: Send + Sync {
    fn connect(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeRpc>;
}
