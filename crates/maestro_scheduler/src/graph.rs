//! The dependency graph that orders jobs within a run.
//!
//! Nodes live in an arena keyed by name; parent and child links are
//! stored as name sets and resolved through the arena, so there is no
//! shared ownership between nodes. Traversal enumerates neighbors in
//! name order, which makes every operation deterministic.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The remaining graph has nodes but none are ready. Cycles are
    /// allowed at insertion time (SQL parsing produces false-positive
    /// parents); they only become an error once no progress can be made.
    #[error("Cycle detected.")]
    CycleDetected,
    /// Only parentless nodes may be removed.
    #[error("Node {0:?} has parents, cannot be removed.")]
    HasParents(String),
}

/// Anything that can live in the graph: tables while a run is being
/// assembled, jobs while it executes.
pub trait GraphItem {
    fn node_name(&self) -> String;
}

#[derive(Debug, Clone)]
struct Node<T> {
    item: T,
    parents: BTreeSet<String>,
    children: BTreeSet<String>,
}

impl<T> Node<T> {
    fn new(item: T) -> Self {
        Self {
            item,
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }
}

/// A dependency graph: an arena of named nodes with parent/child edges.
#[derive(Debug, Clone, Default)]
pub struct Graph<T> {
    nodes: BTreeMap<String, Node<T>>,
}

impl<T: GraphItem + Clone> Graph<T> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.nodes.get(name).map(|n| &n.item)
    }

    fn add_item(&mut self, item: &T) {
        let name = item.node_name();
        self.nodes
            .entry(name)
            .or_insert_with(|| Node::new(item.clone()));
    }

    /// Add a parent-child pair. A `None` parent means the child has no
    /// parent (it is inserted as a root). Idempotent.
    pub fn relate(&mut self, parent: Option<&T>, child: &T) {
        self.add_item(child);
        if let Some(parent) = parent {
            self.add_item(parent);
            let pname = parent.node_name();
            let cname = child.node_name();
            if let Some(c) = self.nodes.get_mut(&cname) {
                c.parents.insert(pname.clone());
            }
            if let Some(p) = self.nodes.get_mut(&pname) {
                p.children.insert(cname);
            }
        }
    }

    /// Remove a node. Fails if the node still has parents; otherwise it
    /// is detached from all of its children and dropped. Removing an
    /// unknown name is a no-op.
    pub fn remove(&mut self, name: &str) -> Result<(), GraphError> {
        let children = match self.nodes.get(name) {
            None => return Ok(()),
            Some(node) => {
                if !node.parents.is_empty() {
                    return Err(GraphError::HasParents(name.to_string()));
                }
                node.children.clone()
            }
        };
        for child in children {
            if let Some(c) = self.nodes.get_mut(&child) {
                c.parents.remove(name);
            }
        }
        self.nodes.remove(name);
        Ok(())
    }

    /// Names of nodes with no children, in name order. Upward score
    /// traversal starts here, as if from an ephemeral child common to
    /// every leaf.
    fn leaf_frontier(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.children.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Breadth-first upward walk over `starts` and everything reachable
    /// through parent links; each node is visited once.
    fn bft_up(&self, starts: &[String], mut action: impl FnMut(&str)) {
        let mut queue: VecDeque<String> = starts.iter().cloned().collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let node = match self.nodes.get(&name) {
                Some(n) => n,
                None => continue,
            };
            action(&name);
            for parent in &node.parents {
                queue.push_back(parent.clone());
            }
        }
    }

    /// Breadth-first downward walk from one node; each node is visited
    /// once, so cycles terminate.
    fn bft_down(&self, start: &str, mut action: impl FnMut(&str)) {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        queue.push_back(start.to_string());
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let node = match self.nodes.get(&name) {
                Some(n) => n,
                None => continue,
            };
            action(&name);
            for child in &node.children {
                queue.push_back(child.clone());
            }
        }
    }

    /// Score every node by its number of descendants (excluding itself)
    /// and return `(name, score)` pairs sorted by score descending. Ties
    /// keep the upward traversal order, which starts at the leaves in
    /// name order - so the result is stable across calls.
    pub fn scores(&self) -> Vec<(String, usize)> {
        let mut result: Vec<(String, usize)> = Vec::with_capacity(self.nodes.len());
        self.bft_up(&self.leaf_frontier(), |name| {
            let mut progeny = 0usize;
            self.bft_down(name, |_| progeny += 1);
            result.push((name.to_string(), progeny - 1)); // minus self
        });
        result.sort_by(|a, b| b.1.cmp(&a.1)); // stable: ties keep traversal order
        result
    }

    /// Every item with no parents, ordered by score. If nothing is
    /// ready while nodes remain, the leftover graph is cyclic.
    pub fn ready_items(&self) -> Result<Vec<T>, GraphError> {
        let mut result = Vec::new();
        for (name, _) in self.scores() {
            if let Some(node) = self.nodes.get(&name) {
                if node.parents.is_empty() {
                    result.push(node.item.clone());
                }
            }
        }
        if !self.nodes.is_empty() && result.is_empty() {
            return Err(GraphError::CycleDetected);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct T(&'static str);

    impl GraphItem for T {
        fn node_name(&self) -> String {
            self.0.to_string()
        }
    }

    //       g00   g01
    //        ^     ^
    //        |     |
    //        +-g10-+-g11
    //           ^     ^
    //           |     |
    //       g20 + g21 + g22
    //        ^      ^   ^
    //       g30      g31
    fn make_graph() -> Graph<T> {
        let mut g = Graph::new();
        g.relate(Some(&T("g00")), &T("g10"));
        g.relate(Some(&T("g01")), &T("g10"));
        g.relate(Some(&T("g01")), &T("g11"));
        g.relate(Some(&T("g10")), &T("g20"));
        g.relate(Some(&T("g10")), &T("g21"));
        g.relate(Some(&T("g10")), &T("g22"));
        g.relate(Some(&T("g20")), &T("g30"));
        g.relate(Some(&T("g21")), &T("g31"));
        g.relate(Some(&T("g22")), &T("g31"));
        g
    }

    #[test]
    fn relate_links_both_directions() {
        let mut g = Graph::new();
        g.relate(Some(&T("parent")), &T("child"));
        assert_eq!(g.nodes["child"].parents.iter().next().unwrap(), "parent");
        assert_eq!(g.nodes["parent"].children.iter().next().unwrap(), "child");
        // Idempotent.
        g.relate(Some(&T("parent")), &T("child"));
        assert_eq!(g.nodes["child"].parents.len(), 1);
    }

    #[test]
    fn relate_nil_parent_inserts_root() {
        let mut g = Graph::new();
        g.relate(None, &T("solo"));
        assert_eq!(g.len(), 1);
        assert!(g.nodes["solo"].parents.is_empty());
    }

    #[test]
    fn upward_traversal_order() {
        let g = make_graph();
        let mut order = Vec::new();
        g.bft_up(&["g31".to_string()], |n| order.push(n.to_string()));
        assert_eq!(order, vec!["g31", "g21", "g22", "g10", "g00", "g01"]);
    }

    #[test]
    fn downward_traversal_order() {
        let g = make_graph();
        let mut order = Vec::new();
        g.bft_down("g00", |n| order.push(n.to_string()));
        assert_eq!(order, vec!["g00", "g10", "g20", "g21", "g22", "g30", "g31"]);
    }

    #[test]
    fn traversal_survives_a_cycle() {
        let mut g = make_graph();
        g.relate(Some(&T("g31")), &T("g00"));
        let mut order = Vec::new();
        g.bft_down("g00", |n| order.push(n.to_string()));
        assert_eq!(order, vec!["g00", "g10", "g20", "g21", "g22", "g30", "g31"]);
    }

    #[test]
    fn scores_count_descendants() {
        let g = make_graph();
        let expect = vec![
            ("g01".to_string(), 7),
            ("g00".to_string(), 6),
            ("g10".to_string(), 5),
            ("g20".to_string(), 1),
            ("g21".to_string(), 1),
            ("g22".to_string(), 1),
            ("g11".to_string(), 0),
            ("g30".to_string(), 0),
            ("g31".to_string(), 0),
        ];
        assert_eq!(g.scores(), expect);
    }

    #[test]
    fn ready_items_are_parentless_in_score_order() {
        let g = make_graph();
        let ready: Vec<String> = g
            .ready_items()
            .unwrap()
            .iter()
            .map(|t| t.node_name())
            .collect();
        assert_eq!(ready, vec!["g01", "g00"]);
    }

    #[test]
    fn remove_refuses_nodes_with_parents() {
        let mut g = make_graph();
        assert_eq!(
            g.remove("g30"),
            Err(GraphError::HasParents("g30".to_string()))
        );
        assert!(g.remove("g01").is_ok());

        let mut order = Vec::new();
        g.bft_up(&["g31".to_string()], |n| order.push(n.to_string()));
        assert_eq!(order, vec!["g31", "g21", "g22", "g10", "g00"]);
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut g = make_graph();
        assert!(g.remove("nope").is_ok());
        assert_eq!(g.len(), 9);
    }

    #[test]
    fn acyclic_graph_drains_completely() {
        let mut g = make_graph();
        while !g.is_empty() {
            let ready = g.ready_items().unwrap();
            assert!(!ready.is_empty());
            for item in ready {
                g.remove(&item.node_name()).unwrap();
            }
        }
    }

    #[test]
    fn cycle_is_detected_once_progress_stalls() {
        let mut g = make_graph();
        g.relate(Some(&T("g31")), &T("g00"));
        loop {
            match g.ready_items() {
                Ok(ready) => {
                    assert!(!ready.is_empty(), "empty ready set should be an error");
                    for item in ready {
                        g.remove(&item.node_name()).unwrap();
                    }
                }
                Err(err) => {
                    assert_eq!(err, GraphError::CycleDetected);
                    assert!(!g.is_empty());
                    break;
                }
            }
        }
    }
}
