//! Commit ancestry for diffing two refs.

use std::collections::{HashMap, HashSet};

/// Parent links between commits, keyed by sha.
#[derive(Debug, Clone, Default)]
pub struct CommitAncestryGraph {
    parents: HashMap<String, Vec<String>>,
}

impl CommitAncestryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `parent` is a parent of `child`. Parents keep insertion
    /// order; a repeated edge is ignored.
    pub fn add_edge(&mut self, child: impl Into<String>, parent: impl Into<String>) {
        let parent = parent.into();
        self.parents.entry(parent.clone()).or_default();
        let parents = self.parents.entry(child.into()).or_default();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }

    /// Record a commit, with or without parents.
    pub fn add_commit<I, S>(&mut self, sha: impl Into<String>, parents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sha = sha.into();
        self.parents.entry(sha.clone()).or_default();
        for parent in parents {
            self.add_edge(sha.clone(), parent);
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn parents(&self, sha: &str) -> &[String] {
        self.parents.get(sha).map(Vec::as_slice).unwrap_or_default()
    }

    /// Commits reachable from `sha` (itself included) in depth-first
    /// preorder. An unknown sha yields only itself.
    fn ancestors<'a>(&'a self, sha: &'a str) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![sha];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            // Reversed so the first parent is visited first.
            for parent in self.parents(current).iter().rev() {
                if !seen.contains(parent.as_str()) {
                    stack.push(parent.as_str());
                }
            }
        }
        order
    }

    /// Commits reachable from `new` but not from `old`, in depth-first
    /// preorder from `new`, together with the sizes of both ancestor sets.
    pub fn ancestor_set_difference(&self, old: &str, new: &str) -> (Vec<String>, usize, usize) {
        let old_set: HashSet<&str> = self.ancestors(old).into_iter().collect();
        let new_order = self.ancestors(new);
        let new_count = new_order.len();
        let lost = new_order
            .into_iter()
            .filter(|sha| !old_set.contains(sha))
            .map(str::to_string)
            .collect();
        (lost, old_set.len(), new_count)
    }
}
