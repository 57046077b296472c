//! Hop-by-hop routing of one request through a topology.

use super::{ReductionEngine, Reply, ResultBatch};
use crate::errors::ReductionError;
use crate::topology::{PodSpec, Topology, GATEWAY};
use std::collections::HashMap;

/// Outputs of every pod plus the flow's response for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    /// Reduced output per pod.
    pub outputs: HashMap<String, ResultBatch>,
    /// Concatenated outputs of the sink pods.
    pub response: ResultBatch,
}

/// Walks a topology in dependency order, asking a caller-supplied executor
/// for each replica's answer and combining them with [`ReductionEngine`].
///
/// The executor receives the pod, shard, replica and input batch and returns
/// `None` when that replica does not answer.
#[derive(Debug, Clone, Copy)]
pub struct RequestRouter<'t> {
    topology: &'t Topology,
    engine: ReductionEngine<'t>,
}

impl<'t> RequestRouter<'t> {
    /// Creates a router over a topology.
    #[must_use]
    pub fn new(topology: &'t Topology) -> Self {
        Self {
            topology,
            engine: ReductionEngine::new(topology),
        }
    }

    /// Routes one request entering at the gateway.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ReductionError`] hit at any hop.
    pub fn route<F>(&self, request: ResultBatch, mut executor: F) -> Result<RouteOutcome, ReductionError>
    where
        F: FnMut(&PodSpec, usize, usize, &ResultBatch) -> Option<ResultBatch>,
    {
        let gateway = ResultBatch::combined(GATEWAY, request.docs);
        let mut outputs: HashMap<String, ResultBatch> = HashMap::new();

        for name in self.topology.execution_order() {
            let Some(spec) = self.topology.pod(name) else {
                return Err(ReductionError::UnknownPod(name.clone()));
            };

            let inputs = self.engine.inputs_for(name, &gateway, &outputs)?;
            let mut reduced = Vec::with_capacity(inputs.len());
            for input in &inputs {
                let replies: Vec<Reply> = spec
                    .units()
                    .filter_map(|(shard, replica)| {
                        executor(spec, shard, replica, input).map(|batch| Reply::new(shard, replica, batch))
                    })
                    .collect();
                reduced.push(self.engine.reduce_pod(name, &replies)?);
            }

            tracing::trace!(pod = %name, inputs = inputs.len(), "Routed request through pod");
            outputs.insert(name.clone(), ReductionEngine::concatenate(name, reduced));
        }

        let response = self.engine.flow_output(&outputs)?;
        Ok(RouteOutcome { outputs, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::Document;
    use crate::testing::{echo_executor, input_docs};
    use crate::topology::{PodDeclaration, PollingPolicy, TopologyBuilder};

    #[test]
    fn test_linear_chain_passes_documents_through() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("a").shards(3).polling(PollingPolicy::All))
            .add(PodDeclaration::new("b").replicas(2))
            .build()
            .unwrap();

        let outcome = RequestRouter::new(&topology)
            .route(input_docs(50), echo_executor)
            .unwrap();

        assert_eq!(outcome.response.len(), 50);
        assert_eq!(outcome.outputs["a"].len(), 50);
        assert_eq!(outcome.response.docs[0].tag("name"), Some(&serde_json::json!("b")));
    }

    #[test]
    fn test_silent_pod_fails_the_request() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("a"))
            .build()
            .unwrap();

        let err = RequestRouter::new(&topology)
            .route(input_docs(1), |_, _, _, _| None)
            .unwrap_err();
        assert_eq!(err, ReductionError::NoReplies("a".into()));
    }

    #[test]
    fn test_two_sinks_are_concatenated() {
        let topology = TopologyBuilder::new()
            .add(PodDeclaration::new("left"))
            .add(PodDeclaration::new("right").needs([GATEWAY]))
            .build()
            .unwrap();

        let outcome = RequestRouter::new(&topology)
            .route(ResultBatch::combined("client", vec![Document::new("only")]), echo_executor)
            .unwrap();

        assert_eq!(outcome.response.ids(), vec!["only", "only"]);
    }
}
