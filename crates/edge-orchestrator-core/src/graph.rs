//! Wrapped-binding dependency graph.
//!
//! Workers are stored in an arena indexed by position; edges point from the
//! worker declaring a wrapped binding to the worker implementing it. Cycle
//! detection is a depth-first search with a three-colour map.

use std::collections::HashMap;

/// DFS colour of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS stack.
    Gray,
    /// Fully explored.
    Black,
}

/// Directed graph over worker names.
#[derive(Debug, Default)]
pub struct WrappedGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
}

impl WrappedGraph {
    /// Create a graph with one node per worker name.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let edges = vec![Vec::new(); names.len()];
        Self {
            names,
            index,
            edges,
        }
    }

    /// Add an edge `from -> to`. Unknown names are ignored.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if let (Some(&from), Some(&to)) = (self.index.get(from), self.index.get(to)) {
            if !self.edges[from].contains(&to) {
                self.edges[from].push(to);
            }
        }
    }

    /// Returns `true` if `from` has an edge to `to`.
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&from), Some(&to)) => self.edges[from].contains(&to),
            _ => false,
        }
    }

    /// Find a cycle, returned as the names along it with the first repeated
    /// at the end (`a -> b -> a`).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut colors = vec![Color::White; self.names.len()];
        let mut stack = Vec::new();

        for start in 0..self.names.len() {
            if colors[start] == Color::White {
                if let Some(cycle) = self.visit(start, &mut colors, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, node: usize, colors: &mut [Color], stack: &mut Vec<usize>) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        stack.push(node);

        for &next in &self.edges[node] {
            match colors[next] {
                Color::Gray => {
                    // `next` is on the stack: the cycle is the stack suffix from it
                    let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[from..].iter().map(|&n| self.names[n].clone()).collect();
                    cycle.push(self.names[next].clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.visit(next, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[node] = Color::Black;
        None
    }
}
