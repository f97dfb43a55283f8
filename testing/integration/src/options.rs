// File: testing/integration/src/options.rs
//
// Command line of a test binary, and the parameters a test sets for itself

use crate::config::{resolve_node_binary, ClusterConfig, DEFAULT_RPC_TIMEOUT, TESTS_LOG_DIR_ENV};
use crate::error::{HarnessResult, IoResultExt};
use clap::Parser;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of temp directories created when no `--tmpdir` is given
pub const TMPDIR_PREFIX: &str = "tos_test_";

#[derive(Parser, Debug, Clone, Default)]
#[command(about = "Run a multi-node TOS integration test")]
pub struct Options {
    /// Leave nodes and the test directory on exit or error
    #[arg(long)]
    pub nocleanup: bool,

    /// Don't stop nodes after the test execution
    #[arg(long)]
    pub noshutdown: bool,

    /// Directory for caching pre-mined datadirs
    #[arg(long, default_value = "cache")]
    pub cachedir: PathBuf,

    /// Root directory for datadirs
    #[arg(long)]
    pub tmpdir: Option<PathBuf>,

    /// Console log level (name or 0-5). The log file always receives Debug
    #[arg(short = 'l', long, default_value = "INFO")]
    pub loglevel: String,

    /// Print out all RPC calls as they are made
    #[arg(long)]
    pub tracerpc: bool,

    /// Seed for port assignment (default: current process id)
    #[arg(long)]
    pub portseed: Option<u64>,

    /// Write invoked RPC methods into this directory
    #[arg(long)]
    pub coveragedir: Option<PathBuf>,

    /// Keep the cluster up on failure until Enter is pressed
    #[arg(long)]
    pub pause_on_failure: bool,

    /// Drive nodes through the CLI instead of RPC
    #[arg(long)]
    pub usecli: bool,

    /// Seed of the test's random number generator
    #[arg(long)]
    pub randomseed: Option<u64>,

    /// Enable node metrics reporting at this interval
    #[arg(long = "metrics-report-interval-ms", default_value_t = 0)]
    pub metrics_report_interval_ms: u64,
}

impl Options {
    pub fn port_seed(&self) -> u64 {
        self.portseed.unwrap_or_else(|| std::process::id() as u64)
    }

    /// Resolve and create the test's root directory.
    ///
    /// `--tmpdir` wins, then the environment, then a fresh temp directory.
    pub fn resolve_tmpdir(&self) -> HarnessResult<PathBuf> {
        let dir = match &self.tmpdir {
            Some(dir) => absolute(dir)?,
            None => match std::env::var(TESTS_LOG_DIR_ENV) {
                Ok(dir) if !dir.is_empty() => absolute(Path::new(&dir))?,
                _ => {
                    let tmp = tempfile::Builder::new()
                        .prefix(TMPDIR_PREFIX)
                        .tempdir()
                        .with_path(std::env::temp_dir())?;
                    tmp.keep()
                }
            },
        };
        std::fs::create_dir_all(&dir).with_path(&dir)?;
        Ok(dir)
    }

    /// Absolute cache directory
    pub fn resolve_cachedir(&self) -> HarnessResult<PathBuf> {
        absolute(&self.cachedir)
    }

    /// Node config keys implied by the command line, layered over the test's
    pub fn conf_parameters(&self, params: &TestParams) -> IndexMap<String, String> {
        let mut conf = params.conf_parameters.clone();
        if self.metrics_report_interval_ms > 0 {
            conf.insert("metrics_enabled".to_string(), "true".to_string());
            conf.insert(
                "metrics_report_interval_ms".to_string(),
                self.metrics_report_interval_ms.to_string(),
            );
        }
        conf
    }

    /// Cluster configuration for a test declaring `params`
    pub fn cluster_config(&self, params: &TestParams) -> ClusterConfig {
        let mut config = ClusterConfig::new(params.num_nodes)
            .with_node_binary(resolve_node_binary())
            .with_clean_chain(params.setup_clean_chain)
            .with_rpc_timeout(params.rpc_timeout)
            .with_port_seed(self.port_seed())
            .with_extra_args(params.extra_args.iter().cloned());
        for (key, value) in self.conf_parameters(params) {
            config = config.with_conf(key, value);
        }
        if let Some(binaries) = &params.binaries {
            config = config.with_binaries(binaries.clone());
        }
        config
    }
}

fn absolute(path: &Path) -> HarnessResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().with_path(path)?;
    Ok(cwd.join(path))
}

/// What a test declares about itself in `set_test_params`
#[derive(Debug, Clone)]
pub struct TestParams {
    pub num_nodes: usize,
    /// Start from empty datadirs instead of the chain cache
    pub setup_clean_chain: bool,
    /// Config keys written into every node's config
    pub conf_parameters: IndexMap<String, String>,
    /// Whether the test can run with `--usecli`
    pub supports_cli: bool,
    pub rpc_timeout: Duration,
    pub extra_args: Vec<String>,
    pub binaries: Option<Vec<PathBuf>>,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            setup_clean_chain: false,
            conf_parameters: IndexMap::new(),
            supports_cli: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            extra_args: Vec::new(),
            binaries: None,
        }
    }
}
