// File: testing/integration/src/cache.rs
//
// Pre-mined chain cache
//
// The cache holds one datadir per node index up to MAX_NODES. It is either
// complete or rebuilt from scratch: a 200 block chain mined by the first four
// nodes at fixed timestamps, so the result does not depend on the wall
// clock. Tests copy the entries they need and re-apply their own config on
// top of the copy; the cache itself is never mutated by a test.
//
// The bootstrap cluster runs under <root>/partial and its datadirs are only
// moved into place once the chain is complete. A failed build stays there,
// logs included, until the next rebuild discards it.

use crate::cluster::ClusterController;
use crate::config::{ClusterConfig, MAX_NODES};
use crate::datadir::{
    copy_tree, datadir_path, initialize_datadir, prune_datadir, CACHE_RETAINED_ENTRIES,
};
use crate::error::{HarnessError, HarnessResult, IoResultExt};
use crate::rpc::RpcConnector;
use indexmap::IndexMap;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Genesis timestamp of the test network
pub const GENESIS_TIMESTAMP: u64 = 1_296_688_602;

/// Seconds between two cached blocks
pub const BLOCK_SPACING_SECS: u64 = 10 * 60;

/// Mock time the cache is mined against
pub const CACHE_MOCKTIME: u64 = GENESIS_TIMESTAMP + 201 * BLOCK_SPACING_SECS;

/// Number of nodes that mine into the cache
pub const CACHE_MINERS: usize = 4;

/// Blocks each miner produces per pass
pub const BLOCKS_PER_BATCH: usize = 25;

/// Passes over the miners
pub const MINING_PASSES: usize = 2;

/// Directory the bootstrap cluster runs in until the cache is complete
pub const STAGING_DIR: &str = "partial";

/// Timestamp of the first cached block
pub fn first_block_time() -> u64 {
    CACHE_MOCKTIME - 201 * BLOCK_SPACING_SECS
}

#[derive(Debug, Clone)]
pub struct ChainCache {
    root: PathBuf,
}

impl ChainCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cached datadir of node `n`
    pub fn entry(&self, n: usize) -> PathBuf {
        datadir_path(&self.root, n)
    }

    /// Working directory of the bootstrap cluster
    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Complete iff every index below MAX_NODES has a datadir
    pub fn is_valid(&self) -> bool {
        (0..MAX_NODES).all(|n| self.entry(n).is_dir())
    }

    /// Delete every cached datadir that exists, and any leftover build
    pub fn invalidate(&self) -> HarnessResult<()> {
        for n in 0..MAX_NODES {
            let entry = self.entry(n);
            if entry.is_dir() {
                fs::remove_dir_all(&entry).with_path(&entry)?;
            }
        }
        let staging = self.staging();
        if staging.is_dir() {
            fs::remove_dir_all(&staging).with_path(&staging)?;
        }
        Ok(())
    }

    /// Rebuild the cache unless it is already complete.
    ///
    /// Returns whether a rebuild happened. `config` supplies the binary,
    /// timeouts and port seed of the bootstrap cluster; its node count and
    /// per-test overrides are ignored.
    pub async fn ensure(
        &self,
        config: &ClusterConfig,
        connector: Arc<dyn RpcConnector>,
    ) -> HarnessResult<bool> {
        if self.is_valid() {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("Chain cache at {:?} is complete", self.root);
            }
            return Ok(false);
        }

        info!("Chain cache at {:?} is incomplete, rebuilding", self.root);
        self.invalidate()?;
        fs::create_dir_all(&self.root).with_path(&self.root)?;

        if let Err(e) = self.build(config, connector).await {
            warn!(
                "Chain cache construction failed ({}), node logs kept under {:?}",
                e,
                self.staging()
            );
            return Err(e);
        }
        Ok(true)
    }

    async fn build(&self, config: &ClusterConfig, connector: Arc<dyn RpcConnector>) -> HarnessResult<()> {
        let bootstrap = ClusterConfig {
            num_nodes: MAX_NODES,
            binaries: None,
            conf_overrides: IndexMap::new(),
            clean_chain: true,
            remote: None,
            ..config.clone()
        };

        let staging = self.staging();
        let mut cluster = ClusterController::new(bootstrap, &staging, connector)?;
        cluster.initialize_chain_clean()?;
        cluster.add_nodes(MAX_NODES, None)?;

        let mined = Self::mine(&mut cluster).await;
        let stopped = cluster.stop_nodes().await;
        mined?;
        stopped?;
        drop(cluster);

        let removed = prune_entries(&staging)?;
        for n in 0..MAX_NODES {
            let (from, to) = (datadir_path(&staging, n), self.entry(n));
            fs::rename(&from, &to).with_path(&to)?;
        }
        fs::remove_dir_all(&staging).with_path(&staging)?;

        info!("Chain cache built, {} transient entries pruned", removed);
        Ok(())
    }

    /// Start the bootstrap cluster and mine the fixed chain
    async fn mine(cluster: &mut ClusterController) -> HarnessResult<()> {
        cluster.start_nodes(&[]).await?;
        for n in 1..cluster.len() {
            cluster.connect_nodes(n, 0).await?;
        }

        let mut block_time = first_block_time();
        for pass in 0..MINING_PASSES {
            for miner in 0..CACHE_MINERS {
                for _ in 0..BLOCKS_PER_BATCH {
                    cluster.set_node_times(block_time).await?;
                    cluster.node(miner)?.generate(1).await?;
                    block_time += BLOCK_SPACING_SECS;
                }
                // the next miner must build on the same chain
                cluster.sync_blocks().await?;
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Cache pass {} miner {} done", pass, miner);
                }
            }
        }
        Ok(())
    }

    /// Strip every cached datadir down to its chain data, returning the
    /// number of removed entries
    pub fn prune(&self) -> HarnessResult<usize> {
        prune_entries(&self.root)
    }

    /// Copy the first `config.num_nodes` entries into `workdir` and write the
    /// test's own config over each copy
    pub fn copy_to(&self, workdir: &Path, config: &ClusterConfig) -> HarnessResult<()> {
        if !self.is_valid() {
            return Err(HarnessError::Config(format!(
                "chain cache at {:?} is incomplete",
                self.root
            )));
        }

        for n in 0..config.num_nodes {
            copy_tree(&self.entry(n), &datadir_path(workdir, n))?;
            initialize_datadir(
                workdir,
                n,
                &config.ports,
                config.bind_host(),
                &config.conf_overrides,
            )?;
        }
        Ok(())
    }
}

fn prune_entries(root: &Path) -> HarnessResult<usize> {
    let mut removed = 0;
    for n in 0..MAX_NODES {
        removed += prune_datadir(&datadir_path(root, n), &CACHE_RETAINED_ENTRIES)?;
    }
    Ok(removed)
}
