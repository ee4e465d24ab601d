// src/core/call_graph/call_graph.rs - Call graph over changed functions
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::super::differ::ChangedFunction;
use super::super::qualifier::{CallSite, QualifiedFunction};

/// Edge in the call graph representing a resolved call
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallEdge {
    /// Function making the call
    pub caller_id: String,
    /// Function being called
    pub callee_id: String,
}

/// Node in the call graph representing a changed function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallNode {
    pub function: ChangedFunction,
    pub call_sites: Vec<CallSite>,
    pub qualified_body: String,
    pub out_edges: BTreeSet<CallEdge>,
}

/// Call graph for one analysis pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallGraph {
    /// Changed functions keyed by qualified id
    pub nodes: BTreeMap<String, CallNode>,
    /// All deduplicated edges
    pub edges: BTreeSet<CallEdge>,
    /// Adjacency list for efficient traversal
    #[serde(skip)]
    adjacency_list: HashMap<String, BTreeSet<String>>,
    /// Reverse adjacency list (who calls this function)
    #[serde(skip)]
    reverse_adjacency: HashMap<String, BTreeSet<String>>,
    /// Detected cycles, reported for diagnostics only
    pub cycles: Vec<Vec<String>>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from qualified functions; a repeated id keeps its first definition
    pub fn build(functions: Vec<QualifiedFunction>) -> Self {
        let mut graph = Self::new();

        for qualified in functions {
            let id = qualified.id();
            if graph.nodes.contains_key(&id) {
                warn!("Duplicate function id {}, keeping the first definition", id);
                continue;
            }

            let out_edges: BTreeSet<CallEdge> = qualified
                .callee_ids()
                .into_iter()
                .map(|callee_id| CallEdge {
                    caller_id: id.clone(),
                    callee_id,
                })
                .collect();

            graph.edges.extend(out_edges.iter().cloned());
            graph.nodes.insert(
                id,
                CallNode {
                    function: qualified.function,
                    call_sites: qualified.call_sites,
                    qualified_body: qualified.qualified_body,
                    out_edges,
                },
            );
        }

        graph.build_adjacency_lists();
        graph.detect_cycles();

        info!(
            "Call graph: {} functions, {} edges, {} cycles",
            graph.nodes.len(),
            graph.edges.len(),
            graph.cycles.len()
        );
        graph
    }

    /// Functions that this function calls (outgoing edges)
    pub fn get_callees(&self, id: &str) -> Vec<&str> {
        self.adjacency_list
            .get(id)
            .map(|callees| callees.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Functions that call this function (incoming edges)
    pub fn get_callers(&self, id: &str) -> Vec<&str> {
        self.reverse_adjacency
            .get(id)
            .map(|callers| callers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.get_callers(id).len()
    }

    pub fn out_degree(&self, id: &str) -> usize {
        self.get_callees(id).len()
    }

    /// Changed functions not called by any other changed function, sorted by id.
    ///
    /// Self-edges never disqualify a function. A fully self-contained cycle
    /// yields no parents.
    pub fn parent_ids(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| {
                !self
                    .get_callers(id)
                    .iter()
                    .any(|caller| *caller != id.as_str() && self.nodes.contains_key(*caller))
            })
            .cloned()
            .collect()
    }

    /// Edge list grouped by caller; every node appears, callees may be unchanged functions
    pub fn adjacency_map(&self) -> BTreeMap<String, Vec<String>> {
        self.nodes
            .keys()
            .map(|id| {
                let callees = self.get_callees(id).into_iter().map(str::to_string).collect();
                (id.clone(), callees)
            })
            .collect()
    }

    pub fn get_statistics(&self) -> CallGraphStats {
        CallGraphStats {
            functions: self.nodes.len(),
            edges: self.edges.len(),
            parents: self.parent_ids().len(),
            cycles: self.cycles.len(),
            max_in_degree: self.nodes.keys().map(|id| self.in_degree(id)).max().unwrap_or(0),
            max_out_degree: self.nodes.keys().map(|id| self.out_degree(id)).max().unwrap_or(0),
        }
    }

    /// Build adjacency lists for efficient traversal
    fn build_adjacency_lists(&mut self) {
        self.adjacency_list.clear();
        self.reverse_adjacency.clear();

        for edge in &self.edges {
            self.adjacency_list
                .entry(edge.caller_id.clone())
                .or_default()
                .insert(edge.callee_id.clone());

            self.reverse_adjacency
                .entry(edge.callee_id.clone())
                .or_default()
                .insert(edge.caller_id.clone());
        }
    }

    /// Detect cycles in the call graph using DFS
    fn detect_cycles(&mut self) {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut current_path = Vec::new();
        let mut cycles = Vec::new();

        for node in self.nodes.keys() {
            if !visited.contains(node.as_str()) {
                self.dfs_cycle_detection(node, &mut visited, &mut rec_stack, &mut current_path, &mut cycles);
            }
        }

        if !cycles.is_empty() {
            debug!("Detected {} call cycles", cycles.len());
        }
        self.cycles = cycles;
    }

    /// DFS helper for cycle detection
    fn dfs_cycle_detection<'g>(
        &'g self,
        node: &'g str,
        visited: &mut HashSet<&'g str>,
        rec_stack: &mut HashSet<&'g str>,
        current_path: &mut Vec<&'g str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(node);
        rec_stack.insert(node);
        current_path.push(node);

        if let Some(callees) = self.adjacency_list.get(node) {
            for callee in callees {
                let callee = callee.as_str();
                if !visited.contains(callee) {
                    self.dfs_cycle_detection(callee, visited, rec_stack, current_path, cycles);
                } else if rec_stack.contains(callee) {
                    if let Some(cycle_start) = current_path.iter().position(|n| *n == callee) {
                        cycles.push(current_path[cycle_start..].iter().map(|s| s.to_string()).collect());
                    }
                }
            }
        }

        rec_stack.remove(node);
        current_path.pop();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraphStats {
    pub functions: usize,
    pub edges: usize,
    pub parents: usize,
    pub cycles: usize,
    pub max_in_degree: usize,
    pub max_out_degree: usize,
}
