//! Topology builder with validation.

use super::{Address, PodDeclaration, PodKind, PodSpec, Topology, GATEWAY};
use crate::errors::TopologyError;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap()
    })
}

/// Builder for validated topologies.
///
/// Declarations are collected as-is; [`build`](Self::build) resolves default
/// names and default `needs` into concrete edges once, then validates the
/// resulting graph.
#[derive(Debug, Clone, Default)]
pub struct TopologyBuilder {
    declarations: Vec<PodDeclaration>,
}

impl TopologyBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder from a list of declarations.
    #[must_use]
    pub fn from_declarations(declarations: Vec<PodDeclaration>) -> Self {
        Self { declarations }
    }

    /// Appends a pod declaration.
    #[must_use]
    pub fn add(mut self, declaration: PodDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Appends a join node over `needs` listening on `address`.
    #[must_use]
    pub fn join<I, S>(self, needs: I, address: Address) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add(PodDeclaration::join(needs).address(address.host, address.port))
    }

    /// Returns the number of declarations.
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        self.declarations.len()
    }

    /// Resolves defaults and validates the topology.
    ///
    /// # Errors
    ///
    /// Returns a [`TopologyError`] on an empty topology, malformed pod,
    /// duplicate name, missing inbound address, dangling `needs` or cycle.
    pub fn build(self) -> Result<Topology, TopologyError> {
        if self.declarations.is_empty() {
            return Err(TopologyError::empty());
        }

        let mut pods: Vec<PodSpec> = Vec::with_capacity(self.declarations.len());
        let mut seen: HashSet<String> = HashSet::new();

        for (index, declaration) in self.declarations.into_iter().enumerate() {
            let name = resolve_name(&declaration, index, &seen);
            if !seen.insert(name.clone()) {
                return Err(TopologyError::duplicate(&name));
            }
            let previous = pods.last().map_or(GATEWAY, |p| p.name.as_str()).to_string();
            pods.push(resolve_pod(name, declaration, &previous)?);
        }

        check_needs(&pods)?;
        detect_cycles(&pods)?;

        Ok(Topology::new(pods))
    }
}

fn resolve_name(declaration: &PodDeclaration, index: usize, seen: &HashSet<String>) -> String {
    if let Some(ref name) = declaration.name {
        return name.clone();
    }
    if declaration.join && !seen.contains("joiner") {
        return "joiner".to_string();
    }
    let stem = if declaration.join { "joiner" } else { "executor" };
    format!("{stem}{index}")
}

fn resolve_pod(
    name: String,
    declaration: PodDeclaration,
    previous: &str,
) -> Result<PodSpec, TopologyError> {
    if name == GATEWAY {
        return Err(TopologyError::invalid_pod(&name, "the name 'gateway' is reserved"));
    }
    if !name_pattern().is_match(&name) {
        return Err(TopologyError::invalid_pod(
            &name,
            "names must start with a letter or digit and contain only letters, digits, '_', '.' or '-'",
        ));
    }

    let kind = match (declaration.external, declaration.join) {
        (true, joins) => PodKind::External { joins },
        (false, true) => PodKind::Join,
        (false, false) => PodKind::Internal,
    };

    let shards = declaration.shards.unwrap_or(1);
    let replicas = declaration.replicas.unwrap_or(1);
    if shards == 0 {
        return Err(TopologyError::invalid_pod(&name, "shards must be at least 1"));
    }
    if replicas == 0 {
        return Err(TopologyError::invalid_pod(&name, "replicas must be at least 1"));
    }
    if kind == PodKind::Join && shards != 1 {
        return Err(TopologyError::invalid_pod(&name, "a join node has exactly one shard"));
    }

    let needs = match declaration.needs {
        None if declaration.join => {
            return Err(TopologyError::invalid_pod(&name, "a join node must list its needs"));
        }
        None => vec![previous.to_string()],
        Some(needs) if needs.is_empty() => {
            return Err(TopologyError::invalid_pod(&name, "needs must not be empty"));
        }
        Some(needs) => {
            let mut unique = HashSet::new();
            if let Some(repeated) = needs.iter().find(|n| !unique.insert(n.as_str())) {
                return Err(TopologyError::invalid_pod(
                    &name,
                    format!("needs lists '{repeated}' more than once"),
                ));
            }
            needs
        }
    };

    let address = match (declaration.host, declaration.port_in) {
        (host, Some(port)) => Some(Address::new(host.unwrap_or_else(|| "0.0.0.0".to_string()), port)),
        (_, None) => None,
    };
    if address.is_none() {
        match kind {
            PodKind::External { .. } => return Err(TopologyError::missing_address(&name, "external")),
            PodKind::Join => return Err(TopologyError::missing_address(&name, "join")),
            PodKind::Internal => {}
        }
    }

    Ok(PodSpec {
        name,
        kind,
        uses: declaration.uses,
        shards,
        replicas,
        polling: declaration.polling.unwrap_or_default(),
        needs,
        address,
        executor: declaration.uses_with,
        resources: declaration.device_requests,
    })
}

fn check_needs(pods: &[PodSpec]) -> Result<(), TopologyError> {
    let names: HashSet<&str> = pods.iter().map(|p| p.name.as_str()).collect();
    for pod in pods {
        for need in &pod.needs {
            if need != GATEWAY && !names.contains(need.as_str()) {
                return Err(TopologyError::dangling(&pod.name, need));
            }
        }
    }
    Ok(())
}

fn detect_cycles(pods: &[PodSpec]) -> Result<(), TopologyError> {
    let by_name: HashMap<&str, &PodSpec> = pods.iter().map(|p| (p.name.as_str(), p)).collect();
    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    // Current DFS path: each node with the index of its next need to visit.
    let mut path: Vec<(&str, usize)> = Vec::new();

    for pod in pods {
        if !visited.insert(pod.name.as_str()) {
            continue;
        }
        on_stack.insert(pod.name.as_str());
        path.push((pod.name.as_str(), 0));

        while let Some(&(node, next)) = path.last() {
            let needs = by_name.get(node).map_or(&[][..], |spec| spec.needs.as_slice());
            let Some(dep) = needs.get(next) else {
                on_stack.remove(node);
                path.pop();
                continue;
            };
            let top = path.len() - 1;
            path[top].1 += 1;

            let dep = dep.as_str();
            if on_stack.contains(dep) {
                let start = path.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|(n, _)| (*n).to_string()).collect();
                cycle.push(dep.to_string());
                return Err(TopologyError::cycle(cycle));
            }
            if visited.insert(dep) {
                on_stack.insert(dep);
                path.push((dep, 0));
            }
        }
    }
    Ok(())
}
