//! # TOS Cluster Harness
//!
//! Drives a cluster of real node processes through a test:
//! prepares datadirs (empty, or copied from a pre-mined chain cache), starts
//! the nodes, waits until each one answers RPC and reports a synced phase,
//! wires them into a topology and hands control to the test body.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tos_cluster::prelude::*;
//!
//! struct MineAndSync;
//!
//! #[async_trait]
//! impl NetworkTest for MineAndSync {
//!     fn set_test_params(&self, params: &mut TestParams) {
//!         params.num_nodes = 3;
//!         params.setup_clean_chain = true;
//!     }
//!
//!     async fn run_test(&mut self, fw: &mut TestFramework) -> HarnessResult<()> {
//!         fw.node(0)?.generate(5).await?;
//!         fw.sync_blocks().await
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let status = run_from_args(&mut MineAndSync).await;
//!     std::process::exit(status.exit_code());
//! }
//! ```
//!
//! Exit codes: 0 passed, 1 failed, 77 skipped.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod datadir;
pub mod error;
pub mod framework;
pub mod logger;
pub mod node;
pub mod options;
pub mod predicates;
pub mod rpc;

pub use cache::ChainCache;
pub use cluster::{ClusterController, Topology};
pub use config::{ClusterConfig, PortAllocator, RemoteHost, MAX_NODES};
pub use error::{HarnessError, HarnessResult, RpcError, RpcResult};
pub use framework::{run_from_args, run_test, NetworkTest, TestFramework, TestStatus};
pub use node::NodeHandle;
pub use options::{Options, TestParams};
pub use predicates::PredicateEngine;
pub use rpc::{NodeEndpoint, NodeRpc, RpcConnector};

/// Everything a test binary usually needs
pub mod prelude {
    pub use crate::ensure_eq;
    pub use crate::{
        run_from_args, run_test, ClusterConfig, HarnessError, HarnessResult, NetworkTest,
        NodeHandle, Options, TestFramework, TestParams, TestStatus, Topology,
    };
    pub use async_trait::async_trait;
}
