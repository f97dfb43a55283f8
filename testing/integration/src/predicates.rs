// File: testing/integration/src/predicates.rs
//
// Named predicates over per-node observations
//
// A predicate is keyed by the observation method it depends on. A snapshot
// calls every such method on every running node, in index order, and keeps
// the values until the next snapshot. Capture is sequential, so values from
// different nodes are not taken at the same instant.

use crate::error::HarnessResult;
use crate::node::NodeHandle;
use indexmap::IndexMap;
use serde_json::Value;

/// Evaluates the observations of one method, ordered by node index
pub type Predicate = Box<dyn Fn(&[Value]) -> bool + Send + Sync>;

#[derive(Default)]
pub struct PredicateEngine {
    predicates: IndexMap<String, Predicate>,
    snapshot: IndexMap<String, Vec<Value>>,
}

impl PredicateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `predicate` for `dependency`, replacing any previous one
    pub fn add_predicate<F>(&mut self, dependency: impl Into<String>, predicate: F)
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(dependency.into(), Box::new(predicate));
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Observations captured by the last snapshot for `dependency`
    pub fn observations(&self, dependency: &str) -> Option<&[Value]> {
        self.snapshot.get(dependency).map(Vec::as_slice)
    }

    /// Capture every dependency on every running node.
    ///
    /// The previous snapshot is only replaced once every call succeeded.
    pub async fn make_snapshot(&mut self, nodes: &[NodeHandle]) -> HarnessResult<()> {
        let mut snapshot = IndexMap::with_capacity(self.predicates.len());
        for dependency in self.predicates.keys() {
            let mut values = Vec::with_capacity(nodes.len());
            for node in nodes.iter().filter(|n| n.is_running()) {
                values.push(node.observe(dependency).await?);
            }
            snapshot.insert(dependency.clone(), values);
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("Captured snapshot of {} dependencies", snapshot.len());
        }
        self.snapshot = snapshot;
        Ok(())
    }

    /// Store observations directly, bypassing the nodes
    pub fn record(&mut self, dependency: impl Into<String>, values: Vec<Value>) {
        self.snapshot.insert(dependency.into(), values);
    }

    /// True iff every predicate holds on the last snapshot.
    ///
    /// A predicate without captured observations does not hold.
    pub fn verify(&self) -> bool {
        self.failed_predicates().is_empty()
    }

    /// Names of the predicates that do not hold on the last snapshot
    pub fn failed_predicates(&self) -> Vec<&str> {
        self.predicates
            .iter()
            .filter(|(dependency, predicate)| match self.snapshot.get(dependency.as_str()) {
                Some(values) => !predicate(values.as_slice()),
                None => true,
            })
            .map(|(dependency, _)| dependency.as_str())
            .collect()
    }
}

impl std::fmt::Debug for PredicateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateEngine")
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_equal(values: &[Value]) -> bool {
        values.windows(2).all(|w| w[0] == w[1])
    }

    #[test]
    fn test_empty_engine_verifies() {
        let engine = PredicateEngine::new();
        assert!(engine.verify());
    }

    #[test]
    fn test_conjunction() {
        let mut engine = PredicateEngine::new();
        engine.add_predicate("get_top_block_hash", all_equal);
        engine.add_predicate("get_block_count", |values: &[Value]| {
            values.iter().all(|v| v.as_u64().unwrap_or(0) >= 10)
        });

        engine.record("get_top_block_hash", vec![json!("aa"), json!("aa")]);
        engine.record("get_block_count", vec![json!(12), json!(10)]);
        assert!(engine.verify());

        engine.record("get_block_count", vec![json!(12), json!(9)]);
        assert!(!engine.verify());
        assert_eq!(engine.failed_predicates(), vec!["get_block_count"]);
    }

    #[test]
    fn test_missing_observations_fail() {
        let mut engine = PredicateEngine::new();
        engine.add_predicate("get_peers", |_: &[Value]| true);
        assert!(!engine.verify());
        assert_eq!(engine.failed_predicates(), vec!["get_peers"]);
    }

    #[test]
    fn test_verify_is_idempotent() {
        let mut engine = PredicateEngine::new();
        engine.add_predicate("get_top_block_hash", all_equal);
        engine.record("get_top_block_hash", vec![json!("aa"), json!("bb")]);

        let first = engine.verify();
        let second = engine.verify();
        assert_eq!(first, second);
        assert!(!first);
        assert_eq!(engine.observations("get_top_block_hash").unwrap().len(), 2);
    }

    #[test]
    fn test_later_registration_replaces() {
        let mut engine = PredicateEngine::new();
        engine.add_predicate("get_version", |_: &[Value]| false);
        engine.add_predicate("get_version", |_: &[Value]| true);
        engine.record("get_version", vec![json!("1.0.0")]);

        assert_eq!(engine.len(), 1);
        assert!(engine.verify());
    }
}
