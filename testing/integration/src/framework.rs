// File: testing/integration/src/framework.rs
//
// Test runner
//
// A test implements `NetworkTest`; the runner drives it through
//
//   INIT -> CHAIN_SETUP -> NETWORK_SETUP -> RUNNING
//        -> {PASSED, FAILED, SKIPPED} -> TEARDOWN -> EXIT
//
// Teardown is a single routine run on every way out of the test body: a
// returned error, a skip, a panic or Ctrl-C. Temp directories are only
// removed after a pass.

use crate::cache::{ChainCache, CACHE_MOCKTIME};
use crate::cluster::{ClusterController, Topology};
use crate::config::ClusterConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::logger::{init_logging, parse_level, LOG_FILE};
use crate::node::NodeHandle;
use crate::options::{Options, TestParams};
use crate::predicates::PredicateEngine;
use crate::rpc::{HttpConnector, RpcConnector};
use async_trait::async_trait;
use clap::Parser;
use futures::FutureExt;
use log::{error, info, warn, LevelFilter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

pub const TEST_EXIT_PASSED: i32 = 0;
pub const TEST_EXIT_FAILED: i32 = 1;
pub const TEST_EXIT_SKIPPED: i32 = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Passed => TEST_EXIT_PASSED,
            Self::Failed => TEST_EXIT_FAILED,
            Self::Skipped => TEST_EXIT_SKIPPED,
        }
    }
}

/// A multi-node test.
///
/// Only `set_test_params` and `run_test` are required; the setup hooks
/// default to the framework's chain and network setup.
#[async_trait]
pub trait NetworkTest: Send {
    /// Declare node count, chain mode and node config
    fn set_test_params(&self, params: &mut TestParams);

    async fn setup_chain(&mut self, framework: &mut TestFramework) -> HarnessResult<()> {
        framework.setup_chain().await
    }

    async fn setup_network(&mut self, framework: &mut TestFramework) -> HarnessResult<()> {
        framework.setup_network().await
    }

    async fn run_test(&mut self, framework: &mut TestFramework) -> HarnessResult<()>;
}

/// State shared by the setup hooks and the test body
pub struct TestFramework {
    options: Options,
    params: TestParams,
    config: ClusterConfig,
    tmpdir: PathBuf,
    connector: Arc<dyn RpcConnector>,
    cluster: ClusterController,
    predicates: PredicateEngine,
    rng: StdRng,
    random_seed: u64,
    mocktime: u64,
}

impl TestFramework {
    pub fn new(
        options: Options,
        params: TestParams,
        tmpdir: PathBuf,
        connector: Arc<dyn RpcConnector>,
    ) -> HarnessResult<Self> {
        let config = options.cluster_config(&params);
        let cluster = ClusterController::new(config.clone(), &tmpdir, connector.clone())?;

        let random_seed = options.randomseed.unwrap_or_else(|| rand::thread_rng().gen());
        info!("Random seed: {} (replay with --randomseed {})", random_seed, random_seed);

        Ok(Self {
            rng: StdRng::seed_from_u64(random_seed),
            options,
            params,
            config,
            tmpdir,
            connector,
            cluster,
            predicates: PredicateEngine::new(),
            random_seed,
            mocktime: 0,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn params(&self) -> &TestParams {
        &self.params
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    pub fn cluster(&self) -> &ClusterController {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut ClusterController {
        &mut self.cluster
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        self.cluster.nodes()
    }

    pub fn node(&self, i: usize) -> HarnessResult<&NodeHandle> {
        self.cluster.node(i)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    /// Clock the nodes are pinned to, 0 when they follow the wall clock
    pub fn mocktime(&self) -> u64 {
        self.mocktime
    }

    /// Pin node clocks to the time the chain cache was mined at
    pub fn enable_mocktime(&mut self) {
        self.mocktime = CACHE_MOCKTIME;
    }

    /// Populate the datadirs: empty ones, or copies of the chain cache
    pub async fn setup_chain(&mut self) -> HarnessResult<()> {
        info!("Initializing test directory {:?}", self.tmpdir);
        if self.config.clean_chain {
            return self.cluster.initialize_chain_clean();
        }

        let cache = ChainCache::new(self.options.resolve_cachedir()?);
        cache.ensure(&self.config, self.connector.clone()).await?;
        cache.copy_to(&self.tmpdir, &self.config)?;
        self.enable_mocktime();
        Ok(())
    }

    /// Register and start the test's nodes, pinning their clocks when mock
    /// time is enabled
    pub async fn setup_nodes(&mut self) -> HarnessResult<()> {
        self.cluster.add_nodes(self.params.num_nodes, None)?;
        self.cluster.start_nodes(&[]).await?;
        if self.mocktime != 0 {
            self.cluster.set_node_times(self.mocktime).await?;
        }
        Ok(())
    }

    /// Start the nodes, chain them together and wait for them to agree
    pub async fn setup_network(&mut self) -> HarnessResult<()> {
        self.setup_nodes().await?;
        self.connect(&Topology::Chain).await?;
        self.cluster.sync_all().await
    }

    /// Wire the running nodes into `topology` using the test's RNG
    pub async fn connect(&mut self, topology: &Topology) -> HarnessResult<()> {
        self.cluster.setup_topology(topology, &mut self.rng).await
    }

    pub async fn sync_all(&self) -> HarnessResult<()> {
        self.cluster.sync_all().await
    }

    pub async fn sync_blocks(&self) -> HarnessResult<()> {
        self.cluster.sync_blocks().await
    }

    pub async fn stop_nodes(&mut self) -> HarnessResult<()> {
        self.cluster.stop_nodes().await
    }

    pub fn add_predicate<F>(&mut self, dependency: impl Into<String>, predicate: F)
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.predicates.add_predicate(dependency, predicate);
    }

    pub async fn make_snapshot(&mut self) -> HarnessResult<()> {
        self.predicates.make_snapshot(self.cluster.nodes()).await
    }

    pub fn verify(&self) -> bool {
        let failed = self.predicates.failed_predicates();
        if !failed.is_empty() {
            warn!("Predicates failed: {:?}", failed);
        }
        failed.is_empty()
    }

    pub fn predicates(&self) -> &PredicateEngine {
        &self.predicates
    }

    async fn drive<T: NetworkTest + ?Sized>(&mut self, test: &mut T) -> HarnessResult<()> {
        if self.options.usecli && !self.params.supports_cli {
            return Err(HarnessError::skip(
                "--usecli specified but test does not support using CLI",
            ));
        }
        test.setup_chain(self).await?;
        test.setup_network(self).await?;
        test.run_test(self).await
    }

    /// Run the test body and classify the outcome
    async fn execute<T: NetworkTest + ?Sized>(&mut self, test: &mut T) -> TestStatus {
        let body = AssertUnwindSafe(self.drive(test)).catch_unwind();
        let result = tokio::select! {
            result = body => match result {
                Ok(result) => result,
                Err(panic) => {
                    error!("Test panicked: {}", panic_message(panic.as_ref()));
                    return TestStatus::Failed;
                }
            },
            _ = tokio::signal::ctrl_c() => Err(HarnessError::Interrupted),
        };

        classify(result)
    }

    /// Stop (or release) the nodes; a pass turns into a failure when the
    /// cluster does not shut down cleanly
    async fn teardown(&mut self, status: TestStatus) -> TestStatus {
        if self.options.noshutdown {
            self.cluster.set_cleanup_on_exit(false);
            info!("Note: nodes were not stopped and may still be running");
            return status;
        }

        info!("Stopping nodes");
        if self.cluster.is_empty() {
            return status;
        }
        match self.cluster.stop_nodes().await {
            Ok(()) => status,
            Err(e) => {
                error!("Error while stopping nodes: {}", e);
                if status == TestStatus::Passed {
                    TestStatus::Failed
                } else {
                    status
                }
            }
        }
    }
}

impl std::fmt::Debug for TestFramework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestFramework")
            .field("tmpdir", &self.tmpdir)
            .field("params", &self.params)
            .field("cluster", &self.cluster)
            .field("random_seed", &self.random_seed)
            .finish()
    }
}

fn classify(result: HarnessResult<()>) -> TestStatus {
    match result {
        Ok(()) => TestStatus::Passed,
        Err(HarnessError::Skip(reason)) => {
            warn!("Test skipped: {}", reason);
            TestStatus::Skipped
        }
        Err(HarnessError::Interrupted) => {
            warn!("Exiting after keyboard interrupt");
            TestStatus::Failed
        }
        Err(HarnessError::Rpc(e)) => {
            error!("JSON-RPC error: {}", e);
            TestStatus::Failed
        }
        Err(HarnessError::Assertion(message)) => {
            error!("Assertion failed: {}", message);
            TestStatus::Failed
        }
        Err(e) => {
            error!("Unexpected error caught during testing: {}", e);
            TestStatus::Failed
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

async fn wait_for_enter() {
    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = stdin.read_line(&mut line).await {
        warn!("Could not read from stdin: {}", e);
    }
}

/// Parse the command line, run `test` over HTTP RPC and return its status
pub async fn run_from_args<T: NetworkTest + ?Sized>(test: &mut T) -> TestStatus {
    run_test(Options::parse(), test, None).await
}

/// Run `test` with `options`.
///
/// `connector` replaces the HTTP RPC client, mainly for in-process tests.
pub async fn run_test<T: NetworkTest + ?Sized>(
    options: Options,
    test: &mut T,
    connector: Option<Arc<dyn RpcConnector>>,
) -> TestStatus {
    let tmpdir = match options.resolve_tmpdir() {
        Ok(dir) => dir,
        Err(e) => {
            error!("Cannot create test directory: {}", e);
            return TestStatus::Failed;
        }
    };

    let console_level = parse_level(&options.loglevel).unwrap_or_else(|e| {
        warn!("{}, logging at INFO", e);
        LevelFilter::Info
    });
    if let Err(e) = init_logging(&tmpdir, console_level, options.tracerpc) {
        warn!("Cannot open the log file: {}", e);
    }
    info!("Port seed: {}", options.port_seed());

    let mut params = TestParams::default();
    test.set_test_params(&mut params);

    let connector = connector.unwrap_or_else(|| {
        Arc::new(
            HttpConnector::new(params.rpc_timeout).with_coverage_dir(options.coveragedir.clone()),
        )
    });

    let nocleanup = options.nocleanup || options.noshutdown;
    let pause_on_failure = options.pause_on_failure;

    let status = match TestFramework::new(options, params, tmpdir.clone(), connector) {
        Ok(mut framework) => {
            let status = framework.execute(test).await;
            if status == TestStatus::Failed && pause_on_failure {
                warn!(
                    "Test failed, nodes under {:?} are left as they are. Press Enter to continue",
                    tmpdir
                );
                wait_for_enter().await;
            }
            framework.teardown(status).await
        }
        Err(e) => {
            error!("Cannot set up the test: {}", e);
            TestStatus::Failed
        }
    };

    let cleanup = status == TestStatus::Passed && !nocleanup;
    match status {
        TestStatus::Passed => info!("Tests successful"),
        TestStatus::Skipped => info!("Test skipped"),
        TestStatus::Failed => {
            error!(
                "Test failed. Test logging available at {}",
                tmpdir.join(LOG_FILE).display()
            );
        }
    }

    if cleanup {
        info!("Cleaning up {:?} on exit", tmpdir);
        if let Err(e) = std::fs::remove_dir_all(&tmpdir) {
            warn!("Could not remove {:?}: {}", tmpdir, e);
        }
    } else {
        warn!("Not cleaning up dir {:?}", tmpdir);
    }
    status
}
