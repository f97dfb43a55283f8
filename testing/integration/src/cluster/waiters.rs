// File: testing/integration/src/cluster/waiters.rs
//
// Cross-node convergence barriers
//
// All waiters poll every node in index order, compare the observations and
// sleep between rounds. They never retry around RPC errors: by the time a
// barrier runs every node has already passed its readiness checks.

use crate::config::POLL_INTERVAL;
use crate::error::{HarnessError, HarnessResult};
use crate::rpc::NodeRpc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Wait until every node reports the same best block hash
pub async fn sync_blocks(nodes: &[Arc<dyn NodeRpc>], timeout: Duration) -> HarnessResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut hashes = Vec::with_capacity(nodes.len());
        for node in nodes {
            hashes.push(node.get_top_block_hash().await?);
        }
        if hashes.windows(2).all(|w| w[0] == w[1]) {
            return Ok(());
        }

        if Instant::now() >= deadline {
            log::warn!("Block sync timed out, best hashes: {:?}", hashes);
            return Err(HarnessError::SyncTimeout {
                what: "best block hashes".to_string(),
                timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait until every node holds the same set of mempool transactions
pub async fn sync_mempools(nodes: &[Arc<dyn NodeRpc>], timeout: Duration) -> HarnessResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let mut pools = Vec::with_capacity(nodes.len());
        for node in nodes {
            let mut pool = node.get_mempool().await?;
            pool.sort();
            pool.dedup();
            pools.push(pool);
        }
        if pools.windows(2).all(|w| w[0] == w[1]) {
            return Ok(());
        }

        if Instant::now() >= deadline {
            log::warn!("Mempool sync timed out, sizes: {:?}", pools.iter().map(Vec::len).collect::<Vec<_>>());
            return Err(HarnessError::SyncTimeout {
                what: "mempools".to_string(),
                timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Wait until `node` lists `peer_id` among its connected peers
pub async fn wait_for_peer(
    node: &dyn NodeRpc,
    peer_id: &str,
    timeout: Duration,
) -> HarnessResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let peers = node.get_peers().await?;
        if peers.iter().any(|p| p == peer_id) {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(HarnessError::SyncTimeout {
                what: format!("connection to peer {peer_id}"),
                timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Pin every node's clock to `timestamp`
pub async fn set_node_times(nodes: &[Arc<dyn NodeRpc>], timestamp: u64) -> HarnessResult<()> {
    for node in nodes {
        node.set_mock_time(timestamp).await?;
    }
    Ok(())
}
