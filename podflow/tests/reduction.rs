//! End-to-end request routing across shards, needs and joins.

use podflow::prelude::*;
use podflow::reduce::RouteOutcome;
use podflow::testing::{echo_executor, external_topology, input_docs};
use podflow::topology::Address;
use pretty_assertions::assert_eq;

/// Each shard answers with its slice of the input, keyed by document index.
fn partition_executor(spec: &PodSpec, shard: usize, replica: usize, input: &ResultBatch) -> Option<ResultBatch> {
    let docs = input
        .docs
        .iter()
        .enumerate()
        .filter(|(i, _)| i % spec.shards == shard)
        .map(|(_, doc)| doc.clone())
        .collect();
    echo_executor(spec, shard, replica, &ResultBatch::from_shard(spec.name.clone(), shard, docs))
}

fn route(topology: &Topology, docs: usize) -> RouteOutcome {
    RequestRouter::new(topology)
        .route(input_docs(docs), partition_executor)
        .unwrap()
}

fn two_sharded_branches() -> TopologyBuilder {
    TopologyBuilder::new()
        .add(PodDeclaration::new("a").shards(2))
        .add(PodDeclaration::new("b").shards(2).needs([GATEWAY]))
}

#[test]
fn test_sharded_partitions_are_reduced_to_the_full_set() {
    let topology = TopologyBuilder::new()
        .add(PodDeclaration::new("a").shards(2).polling(PollingPolicy::All))
        .build()
        .unwrap();

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["a"].len(), 50);
    assert_eq!(outcome.response.len(), 50);
}

#[test]
fn test_unjoined_needs_are_concatenated() {
    let topology = two_sharded_branches()
        .add(PodDeclaration::new("c").needs(["a", "b"]))
        .build()
        .unwrap();

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["a"].len(), 50);
    assert_eq!(outcome.outputs["b"].len(), 50);
    assert_eq!(outcome.outputs["c"].len(), 100);
    assert_eq!(outcome.response.len(), 100);
}

#[test]
fn test_join_reduces_needs() {
    let topology = two_sharded_branches()
        .join(["a", "b"], Address::new("0.0.0.0", 45678))
        .add(PodDeclaration::new("c"))
        .build()
        .unwrap();

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["c"].len(), 50);
    assert_eq!(outcome.response.len(), 50);
}

#[test]
fn test_join_output_holds_each_document_once() {
    let topology = two_sharded_branches()
        .join(["a", "b"], Address::new("0.0.0.0", 45679))
        .build()
        .unwrap();

    let outcome = route(&topology, 4);

    let mut ids = outcome.response.ids();
    ids.sort_unstable();
    assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2", "doc-3"]);
    assert_eq!(outcome.outputs["a"].ids(), vec!["doc-0", "doc-2", "doc-1", "doc-3"]);
}

#[test]
fn test_flow_through_external_pod() {
    let topology = external_topology(45680);

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["external_real"].len(), 50);
    assert_eq!(outcome.response.len(), 50);
}

#[test]
fn test_any_polling_tolerates_a_silent_replica() {
    let topology = TopologyBuilder::new()
        .add(PodDeclaration::new("a").shards(2).replicas(2))
        .build()
        .unwrap();

    let outcome = RequestRouter::new(&topology)
        .route(input_docs(10), |spec, shard, replica, input| {
            (replica == 1).then(|| partition_executor(spec, shard, replica, input)).flatten()
        })
        .unwrap();

    assert_eq!(outcome.response.len(), 10);
}

#[test]
fn test_all_polling_fails_on_a_silent_shard() {
    let topology = TopologyBuilder::new()
        .add(PodDeclaration::new("a").shards(2).polling(PollingPolicy::All))
        .build()
        .unwrap();

    let result = RequestRouter::new(&topology).route(input_docs(10), |spec, shard, replica, input| {
        (shard == 0).then(|| partition_executor(spec, shard, replica, input)).flatten()
    });

    assert!(result.is_err());
}

fn sharded_external(needs: &[&str]) -> PodDeclaration {
    PodDeclaration::new("ext")
        .external()
        .address("10.1.1.1", 45681)
        .shards(2)
        .replicas(2)
        .polling(PollingPolicy::All)
        .needs(needs.iter().copied())
}

#[test]
fn test_external_pod_reduces_its_own_shards() {
    let topology = TopologyBuilder::new()
        .add(sharded_external(&[GATEWAY]))
        .build()
        .unwrap();

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["ext"].len(), 50);
    assert_eq!(outcome.response.len(), 50);
}

#[test]
fn test_external_pod_with_two_needs_concatenates() {
    let topology = TopologyBuilder::new()
        .add(PodDeclaration::new("foo"))
        .add(sharded_external(&[GATEWAY, "foo"]))
        .build()
        .unwrap();

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["foo"].len(), 50);
    assert_eq!(outcome.outputs["ext"].len(), 100);
    assert_eq!(outcome.response.len(), 100);
}

#[test]
fn test_external_join_is_routed_like_an_opaque_pod() {
    let topology = two_sharded_branches()
        .add(
            PodDeclaration::join(["a", "b"])
                .named("ext_join")
                .external()
                .address("10.1.1.1", 45682),
        )
        .build()
        .unwrap();
    assert_eq!(
        topology.pod("ext_join").unwrap().kind,
        PodKind::External { joins: true }
    );

    let outcome = route(&topology, 50);

    assert_eq!(outcome.outputs["ext_join"].len(), 100);
    assert_eq!(outcome.response.len(), 100);
}
