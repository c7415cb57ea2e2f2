//! Resource dependency graph.
//!
//! Nodes keep their insertion order, which is the tie-breaker whenever
//! several nodes are ready at once.

use std::collections::{BTreeSet, HashMap};

use crate::error::{PlanError, Result};
use crate::state::ResourceKey;

/// Directed graph where an edge `a -> b` means "a runs after b".
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Nodes in insertion order.
    nodes: Vec<ResourceKey>,
    /// Node index by key.
    index: HashMap<ResourceKey, usize>,
    /// For each node, the nodes it waits for.
    waits_for: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, returning its index. Adding a key twice returns the first index.
    pub fn add_node(&mut self, key: ResourceKey) -> usize {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(key.clone(), idx);
        self.nodes.push(key);
        self.waits_for.push(BTreeSet::new());
        idx
    }

    /// Records that `after` must run after `before`.
    ///
    /// Returns false, and adds nothing, if either key is not a node.
    pub fn add_edge(&mut self, after: &ResourceKey, before: &ResourceKey) -> bool {
        match (self.index.get(after), self.index.get(before)) {
            (Some(&a), Some(&b)) => {
                self.waits_for[a].insert(b);
                true
            }
            _ => false,
        }
    }

    /// Keys a node waits for.
    #[must_use]
    pub fn waits_for(&self, key: &ResourceKey) -> Vec<&ResourceKey> {
        self.index
            .get(key)
            .map(|&i| self.waits_for[i].iter().map(|&j| &self.nodes[j]).collect())
            .unwrap_or_default()
    }

    /// Orders all nodes so that every node comes after everything it waits for.
    ///
    /// Among nodes that are ready at the same time, the one inserted first wins.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] naming one cycle if the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<&ResourceKey>> {
        let n = self.nodes.len();
        let mut remaining: Vec<usize> = self.waits_for.iter().map(BTreeSet::len).collect();
        let mut unblocks: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, deps) in self.waits_for.iter().enumerate() {
            for &dep in deps {
                unblocks[dep].push(node);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &node in &unblocks[next] {
                remaining[node] -= 1;
                if remaining[node] == 0 {
                    ready.insert(node);
                }
            }
        }

        if order.len() < n {
            return Err(PlanError::Cycle {
                cycle: self.describe_cycle(&remaining),
            }
            .into());
        }

        Ok(order.into_iter().map(|i| &self.nodes[i]).collect())
    }

    /// Finds one cycle among the nodes Kahn's algorithm could not order.
    fn describe_cycle(&self, remaining: &[usize]) -> String {
        let Some(start) = remaining.iter().position(|&r| r > 0) else {
            return String::from("unknown");
        };

        // Every blocked node waits for at least one other blocked node, so
        // walking "waits for" edges must revisit a node.
        let mut path = vec![start];
        let mut seen = HashMap::from([(start, 0usize)]);
        let mut current = start;

        loop {
            let Some(&next) = self.waits_for[current].iter().find(|&&d| remaining[d] > 0) else {
                return self.nodes[start].to_string();
            };
            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.nodes[i].to_string()).collect();
                cycle.push(self.nodes[next].to_string());
                return cycle.join(" -> ");
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        s.parse().expect("valid key")
    }

    fn names(order: &[&ResourceKey]) -> Vec<String> {
        order.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let mut graph = DependencyGraph::new();
        for k in ["job.c", "job.a", "job.b"] {
            graph.add_node(key(k));
        }

        let order = graph.topological_order().expect("acyclic");
        assert_eq!(names(&order), vec!["job.c", "job.a", "job.b"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        for k in ["job.report", "job.transform", "pipeline.ingest", "job.unrelated"] {
            graph.add_node(key(k));
        }
        assert!(graph.add_edge(&key("job.report"), &key("job.transform")));
        assert!(graph.add_edge(&key("job.transform"), &key("pipeline.ingest")));
        assert!(!graph.add_edge(&key("job.report"), &key("job.missing")));

        let order = graph.topological_order().expect("acyclic");
        assert_eq!(
            names(&order),
            vec!["pipeline.ingest", "job.transform", "job.report", "job.unrelated"]
        );
        assert_eq!(graph.waits_for(&key("job.report")), vec![&key("job.transform")]);
    }

    #[test]
    fn test_cycle_is_named() {
        let mut graph = DependencyGraph::new();
        for k in ["job.free", "job.a", "job.b", "job.c"] {
            graph.add_node(key(k));
        }
        graph.add_edge(&key("job.a"), &key("job.b"));
        graph.add_edge(&key("job.b"), &key("job.c"));
        graph.add_edge(&key("job.c"), &key("job.a"));

        let err = graph.topological_order().expect_err("cycle");
        let message = err.to_string();
        assert!(message.contains("job.a -> job.b -> job.c -> job.a"), "{message}");
        assert!(!message.contains("job.free"));
    }

    #[test]
    fn test_self_loop() {
        let mut graph = DependencyGraph::new();
        graph.add_node(key("job.a"));
        graph.add_edge(&key("job.a"), &key("job.a"));

        let err = graph.topological_order().expect_err("cycle");
        assert!(err.to_string().contains("job.a -> job.a"));
    }
}
