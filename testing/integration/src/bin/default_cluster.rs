// File: testing/integration/src/bin/default_cluster.rs
//
// Default eight node cluster: clean chain, debug node logs, nodes wired into
// a random sample topology and synced. Handy as a smoke test of a fresh
// node build and as a starting point for ad-hoc experiments (--noshutdown).

use log::info;
use tos_cluster::prelude::*;
use tos_cluster::MAX_NODES;

/// Peers each node dials in the sample topology
const SAMPLE_PEERS: usize = 3;

struct DefaultCluster;

#[async_trait]
impl NetworkTest for DefaultCluster {
    fn set_test_params(&self, params: &mut TestParams) {
        params.setup_clean_chain = true;
        params.num_nodes = MAX_NODES;
        params
            .conf_parameters
            .insert("log_level".to_string(), "\"debug\"".to_string());
    }

    async fn setup_network(&mut self, fw: &mut TestFramework) -> HarnessResult<()> {
        info!("setup nodes ...");
        fw.setup_nodes().await?;
        info!("connect peers ...");
        fw.connect(&Topology::Sample {
            peers: SAMPLE_PEERS,
        })
        .await?;
        info!("sync up with blocks among nodes ...");
        fw.sync_blocks().await
    }

    async fn run_test(&mut self, fw: &mut TestFramework) -> HarnessResult<()> {
        let hash = fw.node(0)?.best_block_hash().await?;
        for node in fw.nodes() {
            ensure_eq!(node.best_block_hash().await?, hash);
        }
        info!("All {} nodes agree on {}", fw.nodes().len(), hash);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let status = run_from_args(&mut DefaultCluster).await;
    std::process::exit(status.exit_code());
}
