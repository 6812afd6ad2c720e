//! Order & Dependency Resolver
//!
//! Turns the store's records into one deterministic injection sequence:
//!
//! 1. Keep enabled records only.
//! 2. Add an edge `B -> A` for every `requires` entry of `A` equal to the
//!    `name` of `B`. Entries matching no enabled record are ignored, as are
//!    library URLs.
//! 3. Collapse strongly connected components. A component of more than one
//!    record (or a record requiring itself) is a cycle: its members are
//!    scheduled together in `order` sequence and a warning is reported.
//! 4. Topologically sort the components, always emitting the ready
//!    component whose first member has the lowest `(order, id)`.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fmt;

use crate::model::{ScriptId, ScriptRecord, is_library_url};

/// One entry of the injection sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    pub id: ScriptId,
    pub name: String,
    pub code: String,
    pub requires: Vec<String>,
}

/// A dependency cycle among enabled scripts. Non-fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    /// Members of the cycle in the sequence they were scheduled
    pub scripts: Vec<ScriptId>,
    pub names: Vec<String>,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dependency cycle between {}; scheduled by order",
            self.names.join(", ")
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub sequence: Vec<ResolvedScript>,
    pub warnings: Vec<ResolutionWarning>,
}

impl Resolution {
    pub fn ids(&self) -> Vec<ScriptId> {
        self.sequence.iter().map(|entry| entry.id.clone()).collect()
    }
}

pub fn resolve(records: &[ScriptRecord]) -> Resolution {
    let mut enabled: Vec<&ScriptRecord> = records.iter().filter(|r| r.enabled).collect();
    enabled.sort_by(|a, b| a.position_cmp(b));

    // Node indices follow (order, id), so the smallest index is the earliest record.
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(enabled.len(), 0);
    let nodes: Vec<NodeIndex> = (0..enabled.len()).map(|i| graph.add_node(i)).collect();

    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, record) in enabled.iter().enumerate() {
        by_name.entry(record.name.as_str()).or_default().push(i);
    }

    let mut self_loops = vec![false; enabled.len()];
    for (dependent, record) in enabled.iter().enumerate() {
        for key in record.requires() {
            if is_library_url(key) {
                continue;
            }
            let Some(providers) = by_name.get(key.as_str()) else {
                tracing::debug!(
                    script = %record.name,
                    requires = %key,
                    "Unresolved dependency ignored"
                );
                continue;
            };
            for &provider in providers {
                if provider == dependent {
                    self_loops[dependent] = true;
                    continue;
                }
                graph.update_edge(nodes[provider], nodes[dependent], ());
            }
        }
    }

    // Components with members sorted by position.
    let mut components: Vec<Vec<usize>> = tarjan_scc(&graph)
        .into_iter()
        .map(|scc| {
            let mut members: Vec<usize> = scc.into_iter().map(|n| graph[n]).collect();
            members.sort_unstable();
            members
        })
        .collect();
    components.sort_by_key(|members| members[0]);

    let mut component_of = vec![0usize; enabled.len()];
    for (c, members) in components.iter().enumerate() {
        for &m in members {
            component_of[m] = c;
        }
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
    let mut in_degree = vec![0usize; components.len()];
    for edge in graph.edge_indices() {
        let Some((from, to)) = graph.edge_endpoints(edge) else {
            continue;
        };
        let (from, to) = (component_of[graph[from]], component_of[graph[to]]);
        if from != to && successors[from].insert(to) {
            in_degree[to] += 1;
        }
    }

    // Components are indexed by their first member, so the index is the priority.
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(c, _)| Reverse(c))
        .collect();

    let mut resolution = Resolution::default();
    while let Some(Reverse(c)) = ready.pop() {
        let members = &components[c];
        if members.len() > 1 || self_loops[members[0]] {
            resolution.warnings.push(ResolutionWarning {
                scripts: members.iter().map(|&m| enabled[m].id.clone()).collect(),
                names: members.iter().map(|&m| enabled[m].name.clone()).collect(),
            });
        }

        for &m in members {
            let record = enabled[m];
            resolution.sequence.push(ResolvedScript {
                id: record.id.clone(),
                name: record.name.clone(),
                code: record.code.clone(),
                requires: record.requires().to_vec(),
            });
        }

        for &next in &successors[c] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    resolution
}
