// File: testing/integration/src/error.rs
//
// Harness error taxonomy
//
// Every failure the harness can observe while driving a cluster maps onto one
// of these variants. The runner classifies outcomes by variant: `Skip` is the
// only non-failure path out of a test.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the harness
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Result alias for node RPC calls
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors raised by the JSON-RPC layer
#[derive(Error, Debug)]
pub enum RpcError {
    /// The endpoint could not be reached (connection refused, reset, timed out)
    #[error("node at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    /// The node answered with a JSON-RPC error object
    #[error("RPC error {code}: {message}")]
    Response { code: i64, message: String },

    /// HTTP-level failure that is not a connection problem
    #[error("transport error calling '{method}': {reason}")]
    Transport { method: String, reason: String },

    /// The node answered but the payload was not what we expected
    #[error("invalid response to '{method}': {reason}")]
    InvalidResponse { method: String, reason: String },
}

impl RpcError {
    /// Whether a polling loop may retry after this error.
    ///
    /// A node that is still booting refuses connections or answers with
    /// "warming up" style JSON-RPC errors; both are expected. Anything else
    /// means the endpoint is not speaking our protocol.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Response { .. })
    }

    /// Whether the endpoint itself could not be reached
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Errors raised while provisioning, driving or tearing down a cluster
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("node {index} failed to start: {reason}")]
    ProcessStart { index: usize, reason: String },

    #[error("node {index} RPC not available after {timeout:?}: {last_error}")]
    RpcUnavailable {
        index: usize,
        timeout: Duration,
        last_error: String,
    },

    #[error("node {index} did not reach any of {expected:?} within {timeout:?} (last phase: {last_phase:?})")]
    RecoveryTimeout {
        index: usize,
        expected: Vec<String>,
        timeout: Duration,
        last_phase: Option<String>,
    },

    #[error("node {index} did not exit within {timeout:?}")]
    ShutdownTimeout { index: usize, timeout: Duration },

    #[error("node {index} stderr mismatch: expected {expected:?}, got {actual:?}")]
    UnexpectedStderr {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{what} did not converge within {timeout:?}")]
    SyncTimeout { what: String, timeout: Duration },

    /// Deliberate short-circuit: the environment does not support this test
    #[error("{0}")]
    Skip(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl HarnessError {
    /// Build a `Skip` signal
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Build an `Assertion` failure
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    /// Attach a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

/// Extension trait to attach paths to `std::io::Result`
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> HarnessResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> HarnessResult<T> {
        self.map_err(|e| HarnessError::io(path, e))
    }
}

/// Fail the current test with an `Assertion` error unless `left == right`
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let (left, right) = (&$left, &$right);
        if left != right {
            return Err($crate::HarnessError::assertion(format!(
                "{} != {} ({:?} vs {:?})",
                stringify!($left),
                stringify!($right),
                left,
                right
            )));
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unreachable = RpcError::Unreachable {
            url: "http://127.0.0.1:1".to_string(),
            reason: "connection refused".to_string(),
        };
        let response = RpcError::Response {
            code: -28,
            message: "Loading block index".to_string(),
        };
        let invalid = RpcError::InvalidResponse {
            method: "get_version".to_string(),
            reason: "missing result".to_string(),
        };

        assert!(unreachable.is_retryable());
        assert!(unreachable.is_unreachable());
        assert!(response.is_retryable());
        assert!(!response.is_unreachable());
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn test_ensure_eq_macro() {
        fn check(a: u64, b: u64) -> HarnessResult<()> {
            ensure_eq!(a, b);
            Ok(())
        }

        assert!(check(1, 1).is_ok());
        match check(1, 2) {
            Err(HarnessError::Assertion(msg)) => assert!(msg.contains("a != b")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
