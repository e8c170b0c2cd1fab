//! Dependency resolution for setup/teardown chains
//!
//! A unit declares the units that must run before it and after it. Resolving
//! a unit expands those declarations depth-first into two flat sequences.
//! Cycle detection is scoped to the current path, so a unit reachable through
//! two siblings is resolved twice but listed once.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResolveError;

/// A unit's declared dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    #[serde(default)]
    pub before: Vec<String>,
    #[serde(default)]
    pub after: Vec<String>,
}

impl DependencyNode {
    pub fn new<B, A>(before: B, after: A) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            before: before.into_iter().map(Into::into).collect(),
            after: after.into_iter().map(Into::into).collect(),
        }
    }
}

/// Read access to declared dependencies
pub trait DependencyGraph {
    /// `Ok(None)` when the unit does not exist
    fn node(&self, id: &str) -> Result<Option<DependencyNode>, ResolveError>;
}

impl DependencyGraph for HashMap<String, DependencyNode> {
    fn node(&self, id: &str) -> Result<Option<DependencyNode>, ResolveError> {
        Ok(self.get(id).cloned())
    }
}

/// Flattened execution chain around one unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChain {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl ResolvedChain {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

/// Expand `id`'s before and after chains
pub fn resolve(graph: &dyn DependencyGraph, id: &str) -> Result<ResolvedChain, ResolveError> {
    let mut path = vec![id.to_string()];
    let raw = expand(graph, id, &mut path)?;
    let chain = ResolvedChain {
        before: dedup(raw.before),
        after: dedup(raw.after),
    };
    debug!(unit = id, before = ?chain.before, after = ?chain.after, "Resolved dependency chain");
    Ok(chain)
}

/// `before ++ [id] ++ after`
pub fn full_chain(graph: &dyn DependencyGraph, id: &str) -> Result<Vec<String>, ResolveError> {
    let chain = resolve(graph, id)?;
    let mut all = chain.before;
    all.push(id.to_string());
    all.extend(chain.after);
    Ok(all)
}

fn expand(
    graph: &dyn DependencyGraph,
    id: &str,
    path: &mut Vec<String>,
) -> Result<ResolvedChain, ResolveError> {
    let node = graph
        .node(id)?
        .ok_or_else(|| ResolveError::NotFound(id.to_string()))?;

    let mut chain = ResolvedChain::default();

    for dep in &node.before {
        let nested = descend(graph, dep, path)?;
        chain.before.extend(nested.before);
        chain.before.push(dep.clone());
    }

    for dep in &node.after {
        let nested = descend(graph, dep, path)?;
        chain.after.push(dep.clone());
        chain.after.extend(nested.after);
    }

    Ok(chain)
}

fn descend(
    graph: &dyn DependencyGraph,
    dep: &str,
    path: &mut Vec<String>,
) -> Result<ResolvedChain, ResolveError> {
    if path.iter().any(|seen| seen == dep) {
        let mut cycle = path.clone();
        cycle.push(dep.to_string());
        return Err(ResolveError::CircularDependency { cycle });
    }
    path.push(dep.to_string());
    let result = expand(graph, dep, path);
    path.pop();
    result
}

/// Keep the first occurrence of each id
fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
