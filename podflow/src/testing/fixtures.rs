//! Fixtures for routing and lifecycle tests.

use crate::config::ControlPlaneConfig;
use crate::reduce::{Document, ResultBatch};
use crate::topology::{PodDeclaration, PodSpec, Topology, TopologyBuilder};
use std::time::Duration;

/// Creates a client request of `n` documents with ids `doc-0..doc-{n-1}`.
#[must_use]
pub fn input_docs(n: usize) -> ResultBatch {
    ResultBatch::combined("client", (0..n).map(|i| Document::new(format!("doc-{i}"))).collect())
}

/// An executor that returns its input, tagging each document with the pod
/// name.
#[must_use]
pub fn echo_executor(spec: &PodSpec, shard: usize, _replica: usize, input: &ResultBatch) -> Option<ResultBatch> {
    let docs = input
        .docs
        .iter()
        .cloned()
        .map(|doc| doc.with_tag("name", serde_json::json!(spec.name)))
        .collect();
    Some(ResultBatch::from_shard(spec.name.clone(), shard, docs))
}

/// Builds a chain of internal pods with the given names.
///
/// # Panics
///
/// Panics if the names do not form a valid topology.
#[must_use]
#[allow(clippy::expect_used)]
pub fn linear_topology(names: &[&str]) -> Topology {
    names
        .iter()
        .fold(TopologyBuilder::new(), |builder, name| builder.add(PodDeclaration::new(*name)))
        .build()
        .expect("linear topology")
}

/// Builds `gateway -> external(port) -> internal`.
///
/// # Panics
///
/// Panics if the topology is rejected.
#[must_use]
#[allow(clippy::expect_used)]
pub fn external_topology(port: u16) -> Topology {
    TopologyBuilder::new()
        .add(PodDeclaration::new("external_real").external().address("127.0.0.1", port))
        .add(PodDeclaration::new("executor1").shards(2))
        .build()
        .expect("external topology")
}

/// A configuration with millisecond health polling and short timeouts.
#[must_use]
pub fn fast_config() -> ControlPlaneConfig {
    ControlPlaneConfig::new()
        .with_health_check_interval(Duration::from_millis(2))
        .with_health_check_timeout(Duration::from_millis(100))
        .with_drain_timeout(Duration::from_millis(50))
        .with_build_timeout(Duration::from_secs(5))
        .without_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_docs_ids() {
        assert_eq!(input_docs(3).ids(), vec!["doc-0", "doc-1", "doc-2"]);
    }

    #[test]
    fn test_echo_overwrites_name_tag() {
        let spec = PodSpec::new("second");
        let input = ResultBatch::combined(
            "first",
            vec![Document::new("d").with_tag("name", serde_json::json!("first"))],
        );

        let out = echo_executor(&spec, 1, 0, &input).unwrap();

        assert_eq!(out.shard, Some(1));
        assert_eq!(out.docs[0].tag("name"), Some(&serde_json::json!("second")));
    }

    #[test]
    fn test_fixture_topologies() {
        assert_eq!(linear_topology(&["a", "b"]).execution_order(), &["a".to_string(), "b".to_string()]);
        assert!(external_topology(9000).pod("external_real").unwrap().is_external());
        assert!(fast_config().validate().is_ok());
    }
}
