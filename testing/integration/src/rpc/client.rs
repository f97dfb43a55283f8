// File: testing/integration/src/rpc/client.rs
//
// JSON-RPC 2.0 over HTTP client for a single node

use super::{NodeEndpoint, NodeRpc, RpcConnector, RPC_LOG_TARGET};
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error as _;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Value::is_null")]
    params: Value,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Appends every invoked method name to a per-node file
struct CoverageLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CoverageLog {
    fn new(dir: &Path, index: usize) -> Self {
        Self {
            path: dir.join(format!("coverage.node{index}.txt")),
            lock: Mutex::new(()),
        }
    }

    fn record(&self, method: &str) {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{method}"));
        if let Err(e) = result {
            log::warn!("Failed to write RPC coverage to {:?}: {}", self.path, e);
        }
    }
}

/// HTTP JSON-RPC client bound to one node
pub struct HttpRpcClient {
    url: String,
    client: reqwest::Client,
    request_id: AtomicU64,
    coverage: Option<CoverageLog>,
}

impl HttpRpcClient {
    /// Create a client for `url`; `timeout` bounds every individual request
    pub fn new(url: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport {
                method: "<client>".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            url,
            client,
            request_id: AtomicU64::new(1),
            coverage: None,
        })
    }

    /// Record every invoked method under `dir`
    pub fn with_coverage(mut self, dir: &Path, index: usize) -> Self {
        self.coverage = Some(CoverageLog::new(dir, index));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn classify(&self, method: &str, error: reqwest::Error) -> RpcError {
        if is_connection_error(&error) {
            RpcError::Unreachable {
                url: self.url.clone(),
                reason: error.to_string(),
            }
        } else if error.is_decode() {
            RpcError::InvalidResponse {
                method: method.to_string(),
                reason: error.to_string(),
            }
        } else {
            RpcError::Transport {
                method: method.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

/// Whether `error` means the node could not be talked to at all: refused,
/// reset or dropped before a response, or timed out. A booting node
/// produces all of these.
fn is_connection_error(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() || error.is_request() {
        return true;
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

#[async_trait]
impl NodeRpc for HttpRpcClient {
    async fn call(&self, method: &str, params: Value) -> RpcResult<Value> {
        if let Some(coverage) = &self.coverage {
            coverage.record(method);
        }

        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id(),
            method,
            params,
        };

        if log::log_enabled!(target: RPC_LOG_TARGET, log::Level::Debug) {
            log::debug!(target: RPC_LOG_TARGET, "-> {} {} {}", self.url, method, request.params);
        }

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(method, e))?;

        let rpc_response: RpcResponse = response
            .json()
            .await
            .map_err(|e| self.classify(method, e))?;

        if let Some(error) = rpc_response.error {
            if log::log_enabled!(target: RPC_LOG_TARGET, log::Level::Debug) {
                log::debug!(target: RPC_LOG_TARGET, "<- {} error {}: {}", method, error.code, error.message);
            }
            return Err(RpcError::Response {
                code: error.code,
                message: error.message,
            });
        }

        let result = rpc_response.result.unwrap_or(Value::Null);
        if log::log_enabled!(target: RPC_LOG_TARGET, log::Level::Debug) {
            log::debug!(target: RPC_LOG_TARGET, "<- {} {}", method, result);
        }
        Ok(result)
    }
}

/// Connector producing `HttpRpcClient`s
pub struct HttpConnector {
    timeout: Duration,
    coverage_dir: Option<PathBuf>,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            coverage_dir: None,
        }
    }

    pub fn with_coverage_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.coverage_dir = dir;
        self
    }
}

/// Client used when the HTTP stack itself cannot be initialized; every call
/// reports the construction failure.
struct BrokenClient {
    reason: String,
}

#[async_trait]
impl NodeRpc for BrokenClient {
    async fn call(&self, method: &str, _params: Value) -> RpcResult<Value> {
        Err(RpcError::Transport {
            method: method.to_string(),
            reason: self.reason.clone(),
        })
    }
}

impl RpcConnector for HttpConnector {
    fn connect(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeRpc> {
        match HttpRpcClient::new(endpoint.url.clone(), self.timeout) {
            Ok(client) => match &self.coverage_dir {
                Some(dir) => Arc::new(client.with_coverage(dir, endpoint.index)),
                None => Arc::new(client),
            },
            Err(e) => {
                log::error!("Cannot build RPC client for node {}: {}", endpoint.index, e);
                Arc::new(BrokenClient {
                    reason: e.to_string(),
                })
            }
        }
    }
}
