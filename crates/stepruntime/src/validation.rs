//! Structural checks run before a definition may be registered.

use crate::registry::ExecutorRegistry;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use stepcore::{DefinitionError, NodeKind, WorkflowDefinition};

/// Outcome of validating a definition
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<DefinitionError>,
    pub warnings: Vec<String>,
}

/// Validate `workflow` against the node kinds known to `registry`.
///
/// Errors make the definition unusable; warnings (extra start nodes,
/// unreachable nodes, executor warnings) are reported but do not block.
pub fn validate_workflow(workflow: &WorkflowDefinition, registry: &ExecutorRegistry) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &workflow.nodes {
        if index.contains_key(node.id.as_str()) {
            errors.push(DefinitionError::DuplicateNode {
                node: node.id.clone(),
            });
            continue;
        }
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    let starts: Vec<_> = workflow
        .nodes
        .iter()
        .filter(|n| n.kind() == NodeKind::Start)
        .collect();
    match starts.len() {
        0 => errors.push(DefinitionError::MissingStartNode),
        1 => {}
        n => warnings.push(format!(
            "{} start nodes found; only '{}' is used",
            n, starts[0].id
        )),
    }

    if !workflow.nodes.iter().any(|n| n.kind() == NodeKind::End) {
        warnings.push("workflow has no end node".to_string());
    }

    for edge in &workflow.edges {
        let from = index.get(edge.source.as_str());
        let to = index.get(edge.target.as_str());
        match (from, to) {
            (Some(from), Some(to)) => {
                graph.add_edge(*from, *to, ());
            }
            _ => {
                let missing = if from.is_none() { &edge.source } else { &edge.target };
                errors.push(DefinitionError::DanglingEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    missing: missing.clone(),
                });
            }
        }

        if let Some(condition) = &edge.condition {
            if let Err(e) = condition.validate() {
                errors.push(DefinitionError::InvalidCondition {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    // Targets named by configuration count as edges for reachability
    for node in &workflow.nodes {
        let Some(&from) = index.get(node.id.as_str()) else {
            continue;
        };
        let references = node
            .config
            .referenced_nodes()
            .into_iter()
            .chain(node.metadata.fallback_node.as_ref());
        for target in references {
            match index.get(target.as_str()) {
                Some(&to) => {
                    graph.add_edge(from, to, ());
                }
                None => errors.push(DefinitionError::DanglingReference {
                    node: node.id.clone(),
                    missing: target.clone(),
                }),
            }
        }
    }

    if let Some(&root) = starts.first().and_then(|s| index.get(s.id.as_str())) {
        let mut reached = HashSet::new();
        let mut bfs = Bfs::new(&graph, root);
        while let Some(ix) = bfs.next(&graph) {
            reached.insert(ix);
        }
        for ix in graph.node_indices() {
            if !reached.contains(&ix) {
                warnings.push(format!("node '{}' is unreachable from the start node", graph[ix]));
            }
        }
    }

    for node in &workflow.nodes {
        let kind = node.kind();
        let executor = match registry.get(kind.as_str()) {
            Ok(executor) => executor,
            Err(_) => {
                errors.push(DefinitionError::UnknownNodeKind {
                    node: node.id.clone(),
                    kind: kind.to_string(),
                });
                continue;
            }
        };
        let report = executor.validate(node);
        errors.extend(report.errors.into_iter().map(|reason| DefinitionError::InvalidNode {
            node: node.id.clone(),
            reason,
        }));
        warnings.extend(
            report
                .warnings
                .into_iter()
                .map(|w| format!("node '{}': {}", node.id, w)),
        );
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}
