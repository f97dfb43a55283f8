// File: testing/integration/src/cluster/mod.rs
//
// ClusterController - owns the node handles of one test run
//
// Start order is fixed: every process is launched before any readiness wait,
// then nodes are waited on one by one in index order. Topology wiring and
// sync barriers only run once every node reported ready. Any failure while
// starting stops the whole cluster before the error is returned.

mod topology;
pub mod waiters;

pub use topology::Topology;

use crate::config::{
    ClusterConfig, RemoteHost, DEFAULT_READY_PHASES, MAX_NODES, START_NODE_RECOVERY_TIMEOUT,
};
use crate::datadir::{datadir_path, initialize_datadir};
use crate::error::{HarnessError, HarnessResult};
use crate::node::NodeHandle;
use crate::rpc::{NodeRpc, RpcConnector};
use log::{info, warn};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct ClusterController {
    config: Arc<ClusterConfig>,
    workdir: PathBuf,
    connector: Arc<dyn RpcConnector>,
    nodes: Vec<NodeHandle>,
}

impl ClusterController {
    /// Create an empty controller whose datadirs live under `workdir`
    pub fn new(
        config: ClusterConfig,
        workdir: impl Into<PathBuf>,
        connector: Arc<dyn RpcConnector>,
    ) -> HarnessResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            workdir: workdir.into(),
            connector,
            nodes: Vec::new(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, i: usize) -> HarnessResult<&NodeHandle> {
        let count = self.nodes.len();
        self.nodes
            .get(i)
            .ok_or_else(|| HarnessError::Config(format!("no node {i} in a cluster of {count}")))
    }

    pub fn node_mut(&mut self, i: usize) -> HarnessResult<&mut NodeHandle> {
        let count = self.nodes.len();
        self.nodes
            .get_mut(i)
            .ok_or_else(|| HarnessError::Config(format!("no node {i} in a cluster of {count}")))
    }

    /// RPC proxies of every node with a live process, in index order
    pub fn active_rpcs(&self) -> Vec<Arc<dyn NodeRpc>> {
        self.nodes
            .iter()
            .filter(|n| n.is_running())
            .map(|n| n.rpc().clone())
            .collect()
    }

    /// Write a fresh config into every datadir, without any chain data
    pub fn initialize_chain_clean(&self) -> HarnessResult<()> {
        for i in 0..self.config.num_nodes {
            initialize_datadir(
                &self.workdir,
                i,
                &self.config.ports,
                self.config.bind_host(),
                &self.config.conf_overrides,
            )?;
        }
        Ok(())
    }

    /// Register `n` unstarted nodes after the existing ones
    pub fn add_nodes(&mut self, n: usize, binaries: Option<Vec<PathBuf>>) -> HarnessResult<()> {
        self.push_nodes(n, binaries, None)
    }

    /// Register `n` unstarted nodes that run on `remote` over ssh
    pub fn add_remote_nodes(
        &mut self,
        n: usize,
        remote: RemoteHost,
        binaries: Option<Vec<PathBuf>>,
    ) -> HarnessResult<()> {
        self.push_nodes(n, binaries, Some(remote))
    }

    fn push_nodes(
        &mut self,
        n: usize,
        binaries: Option<Vec<PathBuf>>,
        remote: Option<RemoteHost>,
    ) -> HarnessResult<()> {
        let binaries = match binaries.or_else(|| self.config.binaries.clone()) {
            Some(list) if list.len() != n => {
                return Err(HarnessError::Config(format!(
                    "{} binaries given for {} nodes",
                    list.len(),
                    n
                )))
            }
            Some(list) => list,
            None => vec![self.config.node_binary.clone(); n],
        };

        let first = self.nodes.len();
        if first + n > MAX_NODES {
            return Err(HarnessError::Config(format!(
                "cannot add {n} nodes to a cluster of {first}, limit is {MAX_NODES}"
            )));
        }

        let remote = remote.or_else(|| self.config.remote.clone());
        for (offset, binary) in binaries.into_iter().enumerate() {
            let index = first + offset;
            let handle = NodeHandle::new(
                index,
                datadir_path(&self.workdir, index),
                binary,
                &self.config,
                remote.clone(),
                self.connector.as_ref(),
            );
            self.nodes.push(handle);
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Cluster now has {} nodes under {:?}", self.nodes.len(), self.workdir);
        }
        Ok(())
    }

    /// Start node `i` and wait for it.
    ///
    /// `phases` of `None` skips the recovery wait; `timeout` defaults to the
    /// single-node recovery timeout.
    pub async fn start_node(
        &mut self,
        i: usize,
        extra_args: &[String],
        phases: Option<&[&str]>,
        timeout: Option<Duration>,
    ) -> HarnessResult<()> {
        let rpc_timeout = self.config.rpc_timeout;
        let node = self.node_mut(i)?;
        node.start(extra_args)?;
        node.wait_for_rpc_connection(rpc_timeout).await?;
        node.wait_for_nodeid(rpc_timeout).await?;
        if let Some(phases) = phases {
            node.wait_for_recovery(phases, timeout.unwrap_or(START_NODE_RECOVERY_TIMEOUT))
                .await?;
        }
        Ok(())
    }

    /// Start every node, then wait for each of them in index order.
    ///
    /// If any node fails to come up, the whole cluster is stopped before the
    /// error is returned.
    pub async fn start_nodes(&mut self, extra_args: &[String]) -> HarnessResult<()> {
        if let Err(e) = self.launch_and_wait(extra_args).await {
            warn!("Cluster start failed ({}), stopping all nodes", e);
            if let Err(stop_err) = self.stop_nodes().await {
                warn!("Error while stopping nodes after failed start: {}", stop_err);
            }
            return Err(e);
        }

        info!("All {} nodes are ready", self.nodes.len());
        Ok(())
    }

    async fn launch_and_wait(&mut self, extra_args: &[String]) -> HarnessResult<()> {
        for node in self.nodes.iter_mut() {
            node.start(extra_args)?;
        }

        let rpc_timeout = self.config.rpc_timeout;
        let recovery_timeout = self.config.recovery_timeout;
        for node in self.nodes.iter_mut() {
            node.wait_for_rpc_connection(rpc_timeout).await?;
            node.wait_for_nodeid(rpc_timeout).await?;
            node.wait_for_recovery(&DEFAULT_READY_PHASES, recovery_timeout)
                .await?;
        }
        Ok(())
    }

    /// Stop node `i` and wait until its process exits
    pub async fn stop_node(
        &mut self,
        i: usize,
        expected_stderr: Option<String>,
        kill: bool,
    ) -> HarnessResult<()> {
        let shutdown_timeout = self.config.shutdown_timeout;
        let node = self.node_mut(i)?;
        node.stop(expected_stderr, kill).await?;
        node.wait_until_stopped(shutdown_timeout).await
    }

    /// Stop every node, then wait for every node.
    ///
    /// All nodes are attempted even when one of them fails; the first error
    /// is returned.
    pub async fn stop_nodes(&mut self) -> HarnessResult<()> {
        let mut first_error = None;

        for node in self.nodes.iter_mut() {
            if let Err(e) = node.stop(None, false).await {
                warn!("Node {} rejected stop request ({}), terminating it", node.index(), e);
                if let Err(e) = node.stop(None, true).await {
                    first_error.get_or_insert(e);
                }
            }
        }

        let shutdown_timeout = self.config.shutdown_timeout;
        for node in self.nodes.iter_mut() {
            if let Err(e) = node.wait_until_stopped(shutdown_timeout).await {
                warn!("Node {} did not stop cleanly: {}", node.index(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Wait for node `i` to exit on its own
    pub async fn wait_for_node_exit(&mut self, i: usize, timeout: Duration) -> HarnessResult<()> {
        self.node_mut(i)?.wait_until_stopped(timeout).await
    }

    /// Ask node `a` to dial node `b`, then wait until `a` lists `b` as a peer
    pub async fn connect_nodes(&self, a: usize, b: usize) -> HarnessResult<()> {
        if a == b {
            return Err(HarnessError::Config(format!("cannot connect node {a} to itself")));
        }
        let from = self.node(a)?;
        let to = self.node(b)?;
        from.add_peer(to).await?;

        let peer_id = to.node_id().unwrap_or_default();
        waiters::wait_for_peer(from.rpc().as_ref(), peer_id, self.config.sync_timeout).await?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Connected node {} -> node {}", a, b);
        }
        Ok(())
    }

    /// Wire the cluster into `topology`
    pub async fn setup_topology<R: Rng + ?Sized>(
        &self,
        topology: &Topology,
        rng: &mut R,
    ) -> HarnessResult<()> {
        let edges = topology.edges(self.nodes.len(), rng);
        info!("Connecting {} nodes with {} links ({:?})", self.nodes.len(), edges.len(), topology);
        for (a, b) in edges {
            self.connect_nodes(a, b).await?;
        }
        Ok(())
    }

    pub async fn sync_blocks(&self) -> HarnessResult<()> {
        waiters::sync_blocks(&self.active_rpcs(), self.config.sync_timeout).await
    }

    pub async fn sync_mempools(&self) -> HarnessResult<()> {
        waiters::sync_mempools(&self.active_rpcs(), self.config.sync_timeout).await
    }

    /// Blocks first, then mempools
    pub async fn sync_all(&self) -> HarnessResult<()> {
        self.sync_blocks().await?;
        self.sync_mempools().await
    }

    pub async fn set_node_times(&self, timestamp: u64) -> HarnessResult<()> {
        waiters::set_node_times(&self.active_rpcs(), timestamp).await
    }

    /// Leave node processes running when the controller is dropped
    pub fn set_cleanup_on_exit(&mut self, cleanup: bool) {
        for node in self.nodes.iter_mut() {
            node.set_cleanup_on_exit(cleanup);
        }
    }
}

impl std::fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterController")
            .field("workdir", &self.workdir)
            .field("nodes", &self.nodes)
            .finish()
    }
}
