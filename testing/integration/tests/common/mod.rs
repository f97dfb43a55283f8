// Common test utilities for cluster harness tests
//
// Nodes are real child processes: tiny shell scripts that park in their
// datadir until a `stop.flag` file shows up. Their RPC side is an in-memory
// MockNetwork shared by every node of a test. It records every call, keeps
// one canonical chain (so block sync always converges) and writes the stop
// flag when asked to stop a node.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tos_cluster::config::MAX_NODES;
use tos_cluster::error::{RpcError, RpcResult};
use tos_cluster::rpc::{methods, NodeEndpoint, NodeRpc, RpcConnector};
use tos_cluster::ClusterConfig;

pub const STOP_FLAG: &str = "stop.flag";

/// Node that creates its chain dirs and a log file, then waits to be stopped
pub const PARKED_NODE: &str = r#"mkdir -p wallets chainstate blocks
echo "booted" > debug.log
while [ ! -f stop.flag ]; do sleep 0.05; done
rm -f stop.flag
"#;

/// Node that dies during initialization
pub const CRASHING_NODE: &str = "echo 'fatal: corrupted db' >&2\nexit 3\n";

/// Node that ignores both the stop flag and SIGTERM
pub const STUBBORN_NODE: &str = "trap '' TERM\nexec sleep 30\n";

/// Node that writes a warning to stderr, then behaves
pub const NOISY_NODE: &str = r#"echo "warning: low disk space" >&2
while [ ! -f stop.flag ]; do sleep 0.05; done
rm -f stop.flag
"#;

/// Write an executable `/bin/sh` script
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Config suited to scripted nodes: short timeouts, fixed ports
pub fn test_config(num_nodes: usize, binary: &Path) -> ClusterConfig {
    ClusterConfig::new(num_nodes)
        .with_node_binary(binary)
        .with_port_seed(1)
        .with_rpc_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_sync_timeout(Duration::from_secs(5))
        .with_recovery_timeout(Duration::from_secs(5))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub index: usize,
    pub method: String,
}

#[derive(Debug, Clone)]
pub struct MinedBlock {
    pub miner: usize,
    pub timestamp: Option<u64>,
    pub hash: String,
}

#[derive(Debug, Default)]
struct MockNode {
    datadir: PathBuf,
    mock_time: Option<u64>,
    peers: Vec<String>,
    phases: VecDeque<String>,
    unreachable_probes: usize,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<usize, MockNode>,
    chain: Vec<MinedBlock>,
    events: Vec<CallEvent>,
    phase_scripts: HashMap<usize, Vec<String>>,
    unreachable: HashMap<usize, usize>,
    stuck_phase: HashMap<usize, String>,
}

/// In-memory RPC side of a scripted cluster
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report these phases (in order) before settling on NormalSyncPhase
    pub fn script_phases(&self, index: usize, phases: &[&str]) {
        self.state
            .lock()
            .phase_scripts
            .insert(index, phases.iter().map(|p| p.to_string()).collect());
    }

    /// Never leave `phase`
    pub fn stick_in_phase(&self, index: usize, phase: &str) {
        self.state.lock().stuck_phase.insert(index, phase.to_string());
    }

    /// Refuse the first `probes` liveness probes
    pub fn refuse_first_probes(&self, index: usize, probes: usize) {
        self.state.lock().unreachable.insert(index, probes);
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.state.lock().events.clone()
    }

    pub fn calls_of(&self, method: &str) -> Vec<usize> {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| e.method == method)
            .map(|e| e.index)
            .collect()
    }

    pub fn chain(&self) -> Vec<MinedBlock> {
        self.state.lock().chain.clone()
    }

    /// Mock time last set on node `index`
    pub fn mock_time(&self, index: usize) -> Option<u64> {
        self.state
            .lock()
            .nodes
            .get(&index)
            .and_then(|node| node.mock_time)
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn RpcConnector> {
        Arc::new(MockConnector {
            network: self.clone(),
        })
    }

    fn handle(&self, index: usize, method: &str, params: &Value) -> RpcResult<Value> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.events.push(CallEvent {
            index,
            method: method.to_string(),
        });

        let Some(node) = state.nodes.get_mut(&index) else {
            return Err(RpcError::Unreachable {
                url: format!("mock://node{index}"),
                reason: "unknown node".to_string(),
            });
        };

        match method {
            methods::GET_VERSION => {
                if node.unreachable_probes > 0 {
                    node.unreachable_probes -= 1;
                    return Err(RpcError::Unreachable {
                        url: format!("mock://node{index}"),
                        reason: "connection refused".to_string(),
                    });
                }
                Ok(json!("mock-1.0.0"))
            }
            methods::GET_NODE_ID => Ok(json!(format!("node-{index}"))),
            methods::GET_SYNC_PHASE => {
                if let Some(phase) = state.stuck_phase.get(&index) {
                    return Ok(json!(phase));
                }
                Ok(json!(node
                    .phases
                    .pop_front()
                    .unwrap_or_else(|| "NormalSyncPhase".to_string())))
            }
            methods::GENERATE_BLOCKS => {
                let count = params["count"].as_u64().unwrap_or(0);
                let timestamp = node.mock_time;
                let mut hashes = Vec::new();
                for _ in 0..count {
                    let hash = format!("{:064x}", state.chain.len() + 1);
                    state.chain.push(MinedBlock {
                        miner: index,
                        timestamp,
                        hash: hash.clone(),
                    });
                    hashes.push(hash);
                }
                Ok(json!(hashes))
            }
            methods::STOP_NODE => {
                fs::write(node.datadir.join(STOP_FLAG), b"").map_err(|e| RpcError::Transport {
                    method: method.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Value::Null)
            }
            methods::ADD_PEER => {
                let peer_id = params["node_id"].as_str().unwrap_or_default().to_string();
                if !node.peers.contains(&peer_id) {
                    node.peers.push(peer_id.clone());
                }
                let own_id = format!("node-{index}");
                let peer_index = peer_id
                    .strip_prefix("node-")
                    .and_then(|n| n.parse::<usize>().ok());
                if let Some(peer) = peer_index.and_then(|i| state.nodes.get_mut(&i)) {
                    if !peer.peers.contains(&own_id) {
                        peer.peers.push(own_id);
                    }
                }
                Ok(Value::Null)
            }
            methods::GET_PEERS => Ok(json!(node.peers)),
            methods::SET_MOCK_TIME => {
                node.mock_time = params["timestamp"].as_u64();
                Ok(Value::Null)
            }
            methods::GET_TOP_BLOCK_HASH => Ok(json!(state
                .chain
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| "genesis".to_string()))),
            methods::GET_MEMPOOL => Ok(json!(Vec::<String>::new())),
            "get_block_count" => Ok(json!(state.chain.len())),
            _ => Err(RpcError::Response {
                code: -32601,
                message: format!("Method '{method}' in request was not found"),
            }),
        }
    }
}

pub struct MockConnector {
    network: Arc<MockNetwork>,
}

impl RpcConnector for MockConnector {
    fn connect(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeRpc> {
        {
            let mut state = self.network.state.lock();
            assert!(endpoint.index < MAX_NODES);
            let phases = state
                .phase_scripts
                .get(&endpoint.index)
                .cloned()
                .unwrap_or_default();
            let unreachable_probes = state
                .unreachable
                .get(&endpoint.index)
                .copied()
                .unwrap_or(0);
            state.nodes.insert(
                endpoint.index,
                MockNode {
                    datadir: endpoint.datadir.clone(),
                    phases: phases.into(),
                    unreachable_probes,
                    ..MockNode::default()
                },
            );
        }

        Arc::new(MockRpc {
            network: self.network.clone(),
            index: endpoint.index,
        })
    }
}

struct MockRpc {
    network: Arc<MockNetwork>,
    index: usize,
}

#[async_trait]
impl NodeRpc for MockRpc {
    async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        self.network.handle(self.index, method, &params)
    }
}

/// Whether process `pid` still exists
pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// SIGKILL a process the harness left running
pub fn kill_process(pid: u32) {
    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    );
}

pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
