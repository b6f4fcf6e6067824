use std::collections::{HashMap, HashSet};
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use serde::Serialize;

use crate::flow::model::{FlowDefinition, NodeKind, TriggerKind};

/// Outcome of [`validate_flow`]. Errors make the flow unusable; warnings
/// flag things that run but probably do not do what the author meant.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn validate_flow(def: &FlowDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    let mut seen = HashSet::new();
    for node in &def.nodes {
        if !seen.insert(node.node_id.as_str()) {
            report.errors.push(format!("duplicate nodeId `{}`", node.node_id));
        }
    }

    let starts: Vec<&str> = def
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .map(|n| n.node_id.as_str())
        .collect();
    match starts.len() {
        0 => report.errors.push("flow has no start node".to_string()),
        1 => {}
        _ => report.warnings.push(format!(
            "flow has {} start nodes ({}); only `{}` is used",
            starts.len(),
            starts.join(", "),
            starts[0]
        )),
    }

    for edge in &def.edges {
        for (end, id) in [("source", &edge.source_node_id), ("target", &edge.target_node_id)] {
            if !seen.contains(id.as_str()) {
                report.errors.push(format!("edge `{}` has unknown {} `{}`", edge.id, end, id));
            }
        }
    }

    if def.flow.trigger == TriggerKind::Keyword
        && def.flow.trigger_value.as_deref().map(str::trim).unwrap_or("").is_empty()
    {
        report
            .warnings
            .push("keyword flow has no trigger value and will never match".to_string());
    }

    for node in &def.nodes {
        if let NodeKind::Webhook(cfg) = &node.kind {
            if let Err(e) = url::Url::parse(&cfg.url) {
                report
                    .warnings
                    .push(format!("webhook node `{}` has an invalid url `{}`: {}", node.node_id, cfg.url, e));
            }
        }
    }

    check_graph(def, starts.first().copied(), &mut report);
    report
}

/// Flags loops that never wait for the user and nodes the walk cannot reach.
fn check_graph(def: &FlowDefinition, start: Option<&str>, report: &mut ValidationReport) {
    let mut graph: StableDiGraph<&str, ()> = StableDiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    let mut suspends: HashSet<&str> = HashSet::new();

    for node in &def.nodes {
        if !index_of.contains_key(node.node_id.as_str()) {
            index_of.insert(&node.node_id, graph.add_node(&node.node_id));
        }
        if node.kind.is_suspension_point() {
            suspends.insert(&node.node_id);
        }
    }

    let active_edges = def.edges.iter().filter(|e| e.is_active);
    let mut waiting_graph = graph.clone();
    for edge in active_edges {
        let (Some(&from), Some(&to)) = (
            index_of.get(edge.source_node_id.as_str()),
            index_of.get(edge.target_node_id.as_str()),
        ) else {
            continue;
        };
        graph.add_edge(from, to, ());
        if !suspends.contains(edge.source_node_id.as_str()) && !suspends.contains(edge.target_node_id.as_str()) {
            waiting_graph.add_edge(from, to, ());
        }
    }

    for component in tarjan_scc(&waiting_graph) {
        let looped = component.len() > 1
            || component
                .first()
                .is_some_and(|&n| waiting_graph.contains_edge(n, n));
        if looped {
            let mut ids: Vec<&str> = component.iter().map(|&ix| waiting_graph[ix]).collect();
            ids.sort_unstable();
            report.warnings.push(format!(
                "nodes [{}] form a loop without a question or delay node",
                ids.join(", ")
            ));
        }
    }

    let Some(start_ix) = start.and_then(|s| index_of.get(s)).copied() else {
        return;
    };
    let mut reachable = HashSet::new();
    let mut stack = vec![start_ix];
    while let Some(n) = stack.pop() {
        if reachable.insert(n) {
            stack.extend(graph.neighbors_directed(n, petgraph::Direction::Outgoing));
        }
    }
    for node in &def.nodes {
        let ix = index_of[node.node_id.as_str()];
        if !reachable.contains(&ix) && !matches!(node.kind, NodeKind::Start) {
            report
                .warnings
                .push(format!("node `{}` is not reachable from the start node", node.node_id));
        }
    }
}
