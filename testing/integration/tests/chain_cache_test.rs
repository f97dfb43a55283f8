// Chain cache construction against scripted node processes

mod common;

use common::*;
use std::collections::BTreeMap;
use std::fs;
use tempfile::TempDir;
use tos_cluster::cache::{
    first_block_time, BLOCKS_PER_BATCH, BLOCK_SPACING_SECS, CACHE_MINERS, CACHE_MOCKTIME,
    MINING_PASSES,
};
use tos_cluster::config::MAX_NODES;
use tos_cluster::datadir::{datadir_path, read_conf, CONF_FILE, STDERR_FILE};
use tos_cluster::rpc::methods;
use tos_cluster::{ChainCache, ClusterController, HarnessError};

#[tokio::test]
async fn test_rebuild_mines_fixed_chain() {
    init_test_logger();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new();
    let binary = write_script(dir.path(), "node.sh", PARKED_NODE);
    let cache = ChainCache::new(dir.path().join("cache"));

    let rebuilt = cache
        .ensure(&test_config(2, &binary), network.connector())
        .await
        .unwrap();
    assert!(rebuilt);
    assert!(cache.is_valid());

    let chain = network.chain();
    assert_eq!(chain.len(), MINING_PASSES * CACHE_MINERS * BLOCKS_PER_BATCH);
    assert_eq!(chain.len(), 200);

    let mut per_miner = BTreeMap::new();
    for block in &chain {
        *per_miner.entry(block.miner).or_insert(0) += 1;
    }
    assert_eq!(per_miner.len(), 4);
    assert!(per_miner.values().all(|count| *count == 50));

    // batches of 25 rotate over the first four nodes, twice
    for (i, block) in chain.iter().enumerate() {
        assert_eq!(block.miner, (i / BLOCKS_PER_BATCH) % CACHE_MINERS);
    }

    assert_eq!(chain[0].timestamp, Some(CACHE_MOCKTIME - 120_600));
    assert_eq!(chain[0].timestamp, Some(first_block_time()));
    for pair in chain.windows(2) {
        assert_eq!(
            pair[1].timestamp.unwrap() - pair[0].timestamp.unwrap(),
            BLOCK_SPACING_SECS
        );
    }

    // every bootstrap node was connected to node 0 and then stopped
    assert_eq!(network.calls_of(methods::ADD_PEER), (1..MAX_NODES).collect::<Vec<_>>());
    assert_eq!(network.calls_of(methods::STOP_NODE).len(), MAX_NODES);
}

#[tokio::test]
async fn test_cache_keeps_only_chain_data() {
    init_test_logger();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new();
    let binary = write_script(dir.path(), "node.sh", PARKED_NODE);
    let cache = ChainCache::new(dir.path().join("cache"));

    cache
        .ensure(&test_config(1, &binary), network.connector())
        .await
        .unwrap();

    for n in 0..MAX_NODES {
        let mut entries: Vec<String> = fs::read_dir(cache.entry(n))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        assert_eq!(entries, vec!["blocks", "chainstate", "wallets"]);
    }
}

#[tokio::test]
async fn test_complete_cache_is_reused_and_partial_cache_rebuilt() {
    init_test_logger();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new();
    let binary = write_script(dir.path(), "node.sh", PARKED_NODE);
    let cache = ChainCache::new(dir.path().join("cache"));
    let config = test_config(2, &binary);

    assert!(cache.ensure(&config, network.connector()).await.unwrap());
    let calls_after_build = network.events().len();

    assert!(!cache.ensure(&config, network.connector()).await.unwrap());
    assert_eq!(network.events().len(), calls_after_build);

    fs::remove_dir_all(cache.entry(5)).unwrap();
    assert!(!cache.is_valid());
    assert!(cache.ensure(&config, network.connector()).await.unwrap());
    assert!(cache.is_valid());
    assert_eq!(network.chain().len(), 400);
}

#[tokio::test]
async fn test_failed_build_keeps_logs_until_next_rebuild() {
    init_test_logger();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new();
    // nodes that crash on boot never answer RPC
    for n in 0..MAX_NODES {
        network.refuse_first_probes(n, usize::MAX);
    }

    let crashing = write_script(dir.path(), "crashing.sh", CRASHING_NODE);
    let cache = ChainCache::new(dir.path().join("cache"));

    let err = cache
        .ensure(&test_config(2, &crashing), network.connector())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::ProcessStart { index: 0, .. }));
    assert!(!cache.is_valid());
    for n in 0..MAX_NODES {
        assert!(!cache.entry(n).exists());
    }
    assert!(network.chain().is_empty());

    // the crash log of the failed build is still around
    let stderr = fs::read_to_string(datadir_path(&cache.staging(), 0).join(STDERR_FILE)).unwrap();
    assert!(stderr.contains("corrupted db"));

    // the next check throws the leftovers away and rebuilds
    let healthy = MockNetwork::new();
    let binary = write_script(dir.path(), "node.sh", PARKED_NODE);
    assert!(cache
        .ensure(&test_config(2, &binary), healthy.connector())
        .await
        .unwrap());
    assert!(cache.is_valid());
    assert!(!cache.staging().exists());
    assert!(!cache.entry(0).join(STDERR_FILE).exists());
    assert_eq!(healthy.chain().len(), 200);
}

#[tokio::test]
async fn test_working_copy_runs_with_test_config() {
    init_test_logger();
    let dir = TempDir::new().unwrap();
    let network = MockNetwork::new();
    let binary = write_script(dir.path(), "node.sh", PARKED_NODE);
    let cache = ChainCache::new(dir.path().join("cache"));
    cache
        .ensure(&test_config(3, &binary), network.connector())
        .await
        .unwrap();

    let workdir = dir.path().join("run");
    let config = test_config(3, &binary)
        .with_port_seed(77)
        .with_conf("log_level", "\"debug\"");
    cache.copy_to(&workdir, &config).unwrap();

    for n in 0..3 {
        let copy = datadir_path(&workdir, n);
        assert!(copy.join("blocks").is_dir());
        let conf = read_conf(&copy.join(CONF_FILE)).unwrap();
        assert_eq!(conf["log_level"], "\"debug\"");
        assert_eq!(
            conf["rpc_bind_address"],
            format!("\"127.0.0.1:{}\"", config.ports.rpc_port(n))
        );
    }
    assert!(!datadir_path(&workdir, 3).exists());

    let mut cluster = ClusterController::new(config, &workdir, network.connector()).unwrap();
    cluster.add_nodes(3, None).unwrap();
    cluster.start_nodes(&[]).await.unwrap();
    cluster.sync_all().await.unwrap();
    cluster.stop_nodes().await.unwrap();

    // the cache itself was not touched by the test run
    assert!(!cache.entry(0).join(CONF_FILE).exists());
}
