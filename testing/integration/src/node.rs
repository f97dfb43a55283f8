// File: testing/integration/src/node.rs
//
// NodeHandle - one node process driven by the harness
//
// Lifecycle:
//   created (not started) -> start() -> wait_for_rpc_connection()
//   -> wait_for_nodeid() -> wait_for_recovery() -> ready
//   -> stop() -> wait_until_stopped() -> reaped
//
// Readiness waits are sleep-based retry loops. Connection failures and
// JSON-RPC error responses are retried until the deadline; anything else
// aborts the wait immediately. Every probe first checks that the process is
// still alive, so a node that crashes on boot fails fast with ProcessStart.

use crate::config::{ClusterConfig, RemoteHost, POLL_INTERVAL};
use crate::datadir::{CONF_FILE, STDERR_FILE, STDOUT_FILE};
use crate::error::{HarnessError, HarnessResult, IoResultExt, RpcResult};
use crate::rpc::{NodeEndpoint, NodeRpc, RpcConnector};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

/// Result of a polling loop that did not hit a fatal error
enum PollOutcome<T> {
    Ready(T),
    /// Deadline passed; carries the last observation or error for reporting
    TimedOut(Option<String>),
}

/// Quote `word` for a POSIX shell unless it is made of safe characters only
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Command line run by the remote shell: enter `datadir`, exec `binary`
fn remote_command<'a>(
    datadir: &Path,
    binary: &Path,
    args: impl IntoIterator<Item = &'a String>,
) -> String {
    let mut command = format!(
        "cd {} && exec {}",
        shell_quote(&datadir.to_string_lossy()),
        shell_quote(&binary.to_string_lossy())
    );
    for arg in args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    command
}

/// A single node process plus its RPC proxy
pub struct NodeHandle {
    index: usize,
    datadir: PathBuf,
    binary: PathBuf,
    base_args: Vec<String>,
    rpc_url: String,
    p2p_address: String,
    remote: Option<RemoteHost>,
    rpc: Arc<dyn NodeRpc>,
    process: Option<Child>,
    running: bool,
    phase: Option<String>,
    node_id: Option<String>,
    expected_stderr: Option<String>,
    cleanup_on_exit: bool,
}

impl NodeHandle {
    /// Bind a (not yet started) node to `datadir`.
    ///
    /// Ports come from the config's allocator; the RPC client is created
    /// eagerly but nothing is contacted until `start`.
    pub fn new(
        index: usize,
        datadir: PathBuf,
        binary: PathBuf,
        config: &ClusterConfig,
        remote: Option<RemoteHost>,
        connector: &dyn RpcConnector,
    ) -> Self {
        let host = remote
            .as_ref()
            .map(|r| r.host.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let rpc_url = format!("http://{}:{}", host, config.ports.rpc_port(index));
        let p2p_address = format!("{}:{}", host, config.ports.p2p_port(index));

        let mut base_args = vec![
            "--config".to_string(),
            datadir.join(CONF_FILE).to_string_lossy().into_owned(),
        ];
        base_args.extend(config.extra_args.iter().cloned());

        let rpc = connector.connect(&NodeEndpoint {
            index,
            url: rpc_url.clone(),
            datadir: datadir.clone(),
        });

        Self {
            index,
            datadir,
            binary,
            base_args,
            rpc_url,
            p2p_address,
            remote,
            rpc,
            process: None,
            running: false,
            phase: None,
            node_id: None,
            expected_stderr: None,
            cleanup_on_exit: true,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn datadir(&self) -> &Path {
        &self.datadir
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn p2p_address(&self) -> &str {
        &self.p2p_address
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Process started and not yet reaped
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Last phase reported by `wait_for_recovery`
    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    /// Identity reported by `wait_for_nodeid`
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// RPC proxy for this node
    pub fn rpc(&self) -> &Arc<dyn NodeRpc> {
        &self.rpc
    }

    /// Kill the process on drop if it was never stopped
    pub fn set_cleanup_on_exit(&mut self, cleanup: bool) {
        self.cleanup_on_exit = cleanup;
    }

    /// Launch the node with the base arguments followed by `extra_args`
    pub fn start(&mut self, extra_args: &[String]) -> HarnessResult<()> {
        if self.running {
            return Err(HarnessError::ProcessStart {
                index: self.index,
                reason: "node is already running".to_string(),
            });
        }

        let stdout_path = self.datadir.join(STDOUT_FILE);
        let stderr_path = self.datadir.join(STDERR_FILE);
        let stdout = File::create(&stdout_path).with_path(&stdout_path)?;
        let stderr = File::create(&stderr_path).with_path(&stderr_path)?;

        let mut command = match &self.remote {
            None => {
                let mut command = Command::new(&self.binary);
                command
                    .args(&self.base_args)
                    .args(extra_args)
                    .current_dir(&self.datadir);
                command
            }
            Some(remote) => {
                let remote_cmd = remote_command(
                    &self.datadir,
                    &self.binary,
                    self.base_args.iter().chain(extra_args),
                );
                let mut command = Command::new("ssh");
                command
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(remote.destination())
                    .arg(remote_cmd);
                command
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = command.spawn().map_err(|e| HarnessError::ProcessStart {
            index: self.index,
            reason: format!("cannot spawn {:?}: {}", self.binary, e),
        })?;

        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "Node {} spawned (pid {:?}) with {:?} {:?}",
                self.index,
                child.id(),
                self.base_args,
                extra_args
            );
        }

        self.process = Some(child);
        self.running = true;
        self.phase = None;
        self.node_id = None;
        self.expected_stderr = None;
        info!("Node {} started, waiting for RPC at {}", self.index, self.rpc_url);
        Ok(())
    }

    /// Fail with `ProcessStart` if the process has exited
    fn ensure_alive(&mut self) -> HarnessResult<()> {
        let Some(child) = self.process.as_mut() else {
            return Err(HarnessError::ProcessStart {
                index: self.index,
                reason: "node was not started".to_string(),
            });
        };

        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                self.process = None;
                self.running = false;
                Err(HarnessError::ProcessStart {
                    index: self.index,
                    reason: format!("exited with {status} during initialization"),
                })
            }
            Err(e) => Err(HarnessError::io(&self.datadir, e)),
        }
    }

    /// Poll `probe` until it reports ready or `timeout` elapses.
    ///
    /// `probe` yields `Ok(Ok(value))` when ready, `Ok(Err(note))` when the
    /// node answered but is not there yet. Retryable RPC errors keep the loop
    /// going; fatal ones are returned as is.
    async fn poll<T, F, Fut>(&mut self, timeout: Duration, mut probe: F) -> HarnessResult<PollOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RpcResult<Result<T, String>>>,
    {
        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            self.ensure_alive()?;
            match probe().await {
                Ok(Ok(value)) => return Ok(PollOutcome::Ready(value)),
                Ok(Err(note)) => last = Some(note),
                Err(e) if e.is_retryable() => last = Some(e.to_string()),
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Ok(PollOutcome::TimedOut(last));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the liveness RPC answers
    pub async fn wait_for_rpc_connection(&mut self, timeout: Duration) -> HarnessResult<()> {
        let rpc = self.rpc.clone();
        let outcome = self
            .poll(timeout, || {
                let rpc = rpc.clone();
                async move { rpc.get_version().await.map(Ok) }
            })
            .await?;

        match outcome {
            PollOutcome::Ready(version) => {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Node {} RPC up (version {})", self.index, version);
                }
                Ok(())
            }
            PollOutcome::TimedOut(last) => Err(HarnessError::RpcUnavailable {
                index: self.index,
                timeout,
                last_error: last.unwrap_or_else(|| "no response".to_string()),
            }),
        }
    }

    /// Wait until the node reports a non-empty identity
    pub async fn wait_for_nodeid(&mut self, timeout: Duration) -> HarnessResult<()> {
        let rpc = self.rpc.clone();
        let outcome = self
            .poll(timeout, || {
                let rpc = rpc.clone();
                async move {
                    rpc.get_node_id().await.map(|id| {
                        if id.is_empty() {
                            Err("empty node id".to_string())
                        } else {
                            Ok(id)
                        }
                    })
                }
            })
            .await?;

        match outcome {
            PollOutcome::Ready(id) => {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("Node {} identity {}", self.index, id);
                }
                self.node_id = Some(id);
                Ok(())
            }
            PollOutcome::TimedOut(last) => Err(HarnessError::RpcUnavailable {
                index: self.index,
                timeout,
                last_error: last.unwrap_or_else(|| "node id not reported".to_string()),
            }),
        }
    }

    /// Wait until the node's sync phase is one of `expected_phases`
    pub async fn wait_for_recovery(
        &mut self,
        expected_phases: &[&str],
        timeout: Duration,
    ) -> HarnessResult<()> {
        let rpc = self.rpc.clone();
        let expected: Vec<String> = expected_phases.iter().map(|p| p.to_string()).collect();
        let wanted = expected.clone();
        let outcome = self
            .poll(timeout, || {
                let rpc = rpc.clone();
                let wanted = wanted.clone();
                async move {
                    rpc.get_sync_phase().await.map(|phase| {
                        if wanted.contains(&phase) {
                            Ok(phase)
                        } else {
                            Err(phase)
                        }
                    })
                }
            })
            .await?;

        match outcome {
            PollOutcome::Ready(phase) => {
                info!("Node {} recovered in phase {}", self.index, phase);
                self.phase = Some(phase);
                Ok(())
            }
            PollOutcome::TimedOut(last) => {
                self.phase = last.clone();
                Err(HarnessError::RecoveryTimeout {
                    index: self.index,
                    expected,
                    timeout,
                    last_phase: last,
                })
            }
        }
    }

    /// Deliver SIGTERM to the local process, or drop the ssh session for a
    /// remote one
    fn terminate(&mut self) -> HarnessResult<()> {
        let Some(child) = self.process.as_mut() else {
            return Ok(());
        };

        if self.remote.is_some() {
            return child
                .start_kill()
                .map_err(|e| HarnessError::io(&self.datadir, e));
        }

        if let Some(pid) = child.id() {
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| anyhow::anyhow!("SIGTERM to node {} (pid {pid}): {e}", self.index))?;
        }
        Ok(())
    }

    /// Request shutdown without waiting for the process to exit.
    ///
    /// `expected_stderr`, when set, is checked by `wait_until_stopped`.
    pub async fn stop(&mut self, expected_stderr: Option<String>, kill: bool) -> HarnessResult<()> {
        let Some(child) = self.process.as_mut() else {
            return Ok(());
        };
        self.expected_stderr = expected_stderr;

        if let Ok(Some(status)) = child.try_wait() {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("Node {} already exited with {}", self.index, status);
            }
            return Ok(());
        }

        info!("Stopping node {}", self.index);
        if kill {
            return self.terminate();
        }

        match self.rpc.stop_node().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_unreachable() => {
                warn!(
                    "Node {} did not accept stop request ({}), sending SIGTERM",
                    self.index, e
                );
                self.terminate()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the process has exited, then check its stderr
    pub async fn wait_until_stopped(&mut self, timeout: Duration) -> HarnessResult<()> {
        let Some(child) = self.process.as_mut() else {
            self.running = false;
            return Ok(());
        };

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(result) => result.with_path(&self.datadir)?,
            Err(_) => {
                return Err(HarnessError::ShutdownTimeout {
                    index: self.index,
                    timeout,
                })
            }
        };

        self.process = None;
        self.running = false;
        self.phase = None;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Node {} exited with {}", self.index, status);
        }

        if let Some(expected) = self.expected_stderr.take() {
            let stderr_path = self.datadir.join(STDERR_FILE);
            let actual = match std::fs::read_to_string(&stderr_path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(HarnessError::io(stderr_path, e)),
            };
            if actual.trim() != expected.trim() {
                return Err(HarnessError::UnexpectedStderr {
                    index: self.index,
                    expected,
                    actual: actual.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Mine `count` blocks on this node
    pub async fn generate(&self, count: u64) -> HarnessResult<Vec<String>> {
        Ok(self.rpc.generate_blocks(count).await?)
    }

    pub async fn set_mock_time(&self, timestamp: u64) -> HarnessResult<()> {
        Ok(self.rpc.set_mock_time(timestamp).await?)
    }

    pub async fn best_block_hash(&self) -> HarnessResult<String> {
        Ok(self.rpc.get_top_block_hash().await?)
    }

    pub async fn mempool(&self) -> HarnessResult<Vec<String>> {
        Ok(self.rpc.get_mempool().await?)
    }

    pub async fn peers(&self) -> HarnessResult<Vec<String>> {
        Ok(self.rpc.get_peers().await?)
    }

    /// Ask this node to dial `peer`; the peer must have reported its id
    pub async fn add_peer(&self, peer: &NodeHandle) -> HarnessResult<()> {
        let Some(peer_id) = peer.node_id() else {
            return Err(HarnessError::Config(format!(
                "node {} has no known id, wait for it before connecting",
                peer.index
            )));
        };
        Ok(self.rpc.add_peer(peer_id, peer.p2p_address()).await?)
    }

    /// Call the observation method `name` with no parameters
    pub async fn observe(&self, name: &str) -> HarnessResult<Value> {
        Ok(self.rpc.call(name, Value::Null).await?)
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        if !self.cleanup_on_exit {
            return;
        }
        if let Some(child) = self.process.as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!("Node {} still running on drop, killing it", self.index);
                let _ = child.start_kill();
            }
        }
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("index", &self.index)
            .field("datadir", &self.datadir)
            .field("rpc_url", &self.rpc_url)
            .field("running", &self.running)
            .field("phase", &self.phase)
            .field("node_id", &self.node_id)
            .field("remote", &self.remote)
            .finish()
    }
}
