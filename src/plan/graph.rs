//! Requires graph over change instances

use crate::error::{Error, Result};

/// Directed graph where an edge `a -> b` means `a` requires `b`.
///
/// Nodes are change instances in plan order, so a reworked change appears
/// once per instance.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    edges: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) -> usize {
        self.names.push(name.into());
        self.edges.push(Vec::new());
        self.names.len() - 1
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        if let Some(targets) = self.edges.get_mut(from) {
            if !targets.contains(&to) {
                targets.push(to);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names along one cycle, first node repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut stack = Vec::new();
        for start in 0..self.names.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Some(cycle.into_iter().map(|i| self.names[i].clone()).collect());
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for &next in &self.edges[node] {
            match marks.get(next).copied() {
                Some(Mark::InProgress) => {
                    let from = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle = stack[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Some(Mark::Unvisited) => {
                    if let Some(cycle) = self.visit(next, marks, stack) {
                        return Some(cycle);
                    }
                }
                Some(Mark::Done) | None => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    pub fn check_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(Error::Validation(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acyclic_chain() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(b, a);
        graph.add_edge(c, b);
        graph.add_edge(c, a);
        assert_eq!(graph.len(), 3);
        assert!(graph.find_cycle().is_none());
        assert!(graph.check_acyclic().is_ok());
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a");
        let b = graph.add_node("b");
        let c = graph.add_node("c");
        graph.add_edge(a, b);
        graph.add_edge(b, c);
        graph.add_edge(c, a);
        assert_eq!(
            graph.find_cycle().unwrap(),
            vec!["a", "b", "c", "a"]
        );
        let err = graph.check_acyclic().unwrap_err();
        assert!(err.to_string().contains("a -> b -> c -> a"));
    }

    #[test]
    fn test_self_loop() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a");
        graph.add_edge(a, a);
        assert_eq!(graph.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        let root = graph.add_node("root");
        let left = graph.add_node("left");
        let right = graph.add_node("right");
        let top = graph.add_node("top");
        graph.add_edge(left, root);
        graph.add_edge(right, root);
        graph.add_edge(top, left);
        graph.add_edge(top, right);
        assert!(graph.find_cycle().is_none());
    }
}
