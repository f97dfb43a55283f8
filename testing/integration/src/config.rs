// File: testing/integration/src/config.rs
//
// Cluster configuration
//
// ClusterConfig is assembled once, before the first node is created, and is
// shared read-only (behind Arc) by the controller and every node handle.

use crate::error::{HarnessError, HarnessResult};
use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of nodes a single test may run, and the cache width
pub const MAX_NODES: usize = 8;

/// Lowest port handed out by the allocator
pub const PORT_MIN: u16 = 11000;

/// Width of each port range (P2P range followed by RPC range)
pub const PORT_RANGE: u16 = 5000;

/// Default RPC timeout used for readiness polling
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for a node process to exit after a stop request
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for peers/blocks/mempools to converge
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Recovery timeout used by `start_nodes`
pub const START_NODES_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Recovery timeout used by `start_node`
pub const START_NODE_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness probes
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Phases in which a node is considered recovered
pub const DEFAULT_READY_PHASES: [&str; 2] = ["NormalSyncPhase", "CatchUpSyncBlockPhase"];

/// Environment variable overriding the node binary
pub const NODE_BIN_ENV: &str = "TOS_NODE_BIN";

/// Environment variable overriding the temp root when `--tmpdir` is absent
pub const TESTS_LOG_DIR_ENV: &str = "TOS_TESTS_LOG_DIR";

/// Node binary used when neither the test nor the environment names one
pub const DEFAULT_NODE_BIN: &str = "../target/release/tos_daemon";

/// Resolve the node binary from the environment or the default build path
pub fn resolve_node_binary() -> PathBuf {
    match std::env::var(NODE_BIN_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_NODE_BIN),
    }
}

/// Deterministic port assignment derived from a seed.
///
/// Two harness runs on the same machine stay clear of each other as long as
/// they use different seeds (the CLI defaults to the process id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    seed: u64,
}

impl PortAllocator {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn offset(&self) -> u16 {
        let span = (PORT_RANGE - 1) as u64 - MAX_NODES as u64;
        ((MAX_NODES as u64).wrapping_mul(self.seed) % span) as u16
    }

    /// P2P listening port of node `n`
    pub fn p2p_port(&self, n: usize) -> u16 {
        PORT_MIN + n as u16 + self.offset()
    }

    /// JSON-RPC port of node `n`
    pub fn rpc_port(&self, n: usize) -> u16 {
        self.p2p_port(n) + PORT_RANGE
    }
}

/// Credentials for launching a node on another machine over ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    pub host: String,
    pub user: String,
}

impl RemoteHost {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
        }
    }

    /// `user@host` destination for ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Immutable description of the cluster a test wants
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of nodes (1..=MAX_NODES)
    pub num_nodes: usize,
    /// Binary used when no per-node override is given
    pub node_binary: PathBuf,
    /// Per-node binary overrides (must match `num_nodes` when set)
    pub binaries: Option<Vec<PathBuf>>,
    /// Arguments appended to every node's command line
    pub extra_args: Vec<String>,
    /// Config keys written on top of the base node config
    pub conf_overrides: IndexMap<String, String>,
    /// Timeout for every readiness/RPC wait
    pub rpc_timeout: Duration,
    /// Timeout for a node to exit after a stop request
    pub shutdown_timeout: Duration,
    /// Timeout for sync barriers
    pub sync_timeout: Duration,
    /// Timeout for the recovery-phase wait in `start_nodes`
    pub recovery_timeout: Duration,
    /// Start from empty datadirs instead of the pre-mined cache
    pub clean_chain: bool,
    /// Port allocation seed
    pub ports: PortAllocator,
    /// Run nodes through ssh on this host
    pub remote: Option<RemoteHost>,
}

impl ClusterConfig {
    /// Create a configuration for `num_nodes` nodes with default timeouts
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            node_binary: resolve_node_binary(),
            binaries: None,
            extra_args: Vec::new(),
            conf_overrides: IndexMap::new(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            recovery_timeout: START_NODES_RECOVERY_TIMEOUT,
            clean_chain: false,
            ports: PortAllocator::new(std::process::id() as u64),
            remote: None,
        }
    }

    pub fn with_node_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.node_binary = binary.into();
        self
    }

    pub fn with_binaries(mut self, binaries: Vec<PathBuf>) -> Self {
        self.binaries = Some(binaries);
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_conf(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conf_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_clean_chain(mut self, clean: bool) -> Self {
        self.clean_chain = clean;
        self
    }

    pub fn with_port_seed(mut self, seed: u64) -> Self {
        self.ports = PortAllocator::new(seed);
        self
    }

    pub fn with_remote(mut self, remote: RemoteHost) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Address nodes bind to: loopback locally, every interface when remote
    pub fn bind_host(&self) -> &'static str {
        if self.remote.is_some() {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }

    /// Check the invariants that must hold before any node is created
    pub fn validate(&self) -> HarnessResult<()> {
        if self.num_nodes == 0 || self.num_nodes > MAX_NODES {
            return Err(HarnessError::Config(format!(
                "num_nodes must be within 1..={MAX_NODES}, got {}",
                self.num_nodes
            )));
        }
        if let Some(binaries) = &self.binaries {
            if binaries.len() != self.num_nodes {
                return Err(HarnessError::Config(format!(
                    "{} binaries given for {} nodes",
                    binaries.len(),
                    self.num_nodes
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_are_disjoint_per_node() {
        let ports = PortAllocator::new(42);
        let mut seen = std::collections::HashSet::new();
        for n in 0..MAX_NODES {
            assert!(seen.insert(ports.p2p_port(n)));
            assert!(seen.insert(ports.rpc_port(n)));
        }
        assert_eq!(ports.rpc_port(3) - ports.p2p_port(3), PORT_RANGE);
    }

    #[test]
    fn test_ports_stay_in_range() {
        for seed in [0u64, 1, 999, u32::MAX as u64, u64::MAX] {
            let ports = PortAllocator::new(seed);
            assert!(ports.p2p_port(0) >= PORT_MIN);
            assert!(ports.p2p_port(MAX_NODES - 1) < PORT_MIN + PORT_RANGE);
            assert!(ports.rpc_port(MAX_NODES - 1) < PORT_MIN + 2 * PORT_RANGE);
        }
    }

    #[test]
    fn test_validate_node_count() {
        assert!(ClusterConfig::new(1).validate().is_ok());
        assert!(ClusterConfig::new(MAX_NODES).validate().is_ok());
        assert!(matches!(
            ClusterConfig::new(0).validate(),
            Err(HarnessError::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::new(MAX_NODES + 1).validate(),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_validate_binary_list_length() {
        let config = ClusterConfig::new(2).with_binaries(vec![PathBuf::from("a")]);
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_conf_overrides_keep_insertion_order() {
        let config = ClusterConfig::new(1)
            .with_conf("log_level", "\"debug\"")
            .with_conf("metrics_enabled", "true")
            .with_conf("log_level", "\"trace\"");
        let keys: Vec<_> = config.conf_overrides.keys().cloned().collect();
        assert_eq!(keys, vec!["log_level", "metrics_enabled"]);
        assert_eq!(config.conf_overrides["log_level"], "\"trace\"");
    }

    #[test]
    fn test_remote_destination() {
        let remote = RemoteHost::new("10.0.0.5", "tos");
        assert_eq!(remote.destination(), "tos@10.0.0.5");
    }
}
