//! Build graph for derivation dependency management.
//!
//! This module provides a directed acyclic graph (DAG) over the input
//! closure of a build request and computes parallel execution waves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::derivation::Derivation;
use crate::util::hash::Fingerprint;

use super::types::BuildError;

/// A DAG of derivations keyed by fingerprint.
///
/// The graph is constructed from a set of root derivations and provides:
/// - Deduplication of identical derivations reached along different paths
/// - Topological ordering
/// - Parallel execution waves (groups of independent derivations)
/// - Dependency and dependent queries
pub struct BuildGraph {
  /// The underlying graph. Edges point from dependency to dependent.
  graph: DiGraph<Fingerprint, ()>,

  /// Map from fingerprint to node index.
  nodes: HashMap<Fingerprint, NodeIndex>,

  /// One derivation per fingerprint.
  derivations: HashMap<Fingerprint, Arc<Derivation>>,

  /// Requested roots, deduplicated, in request order.
  roots: Vec<Fingerprint>,
}

impl BuildGraph {
  /// Build the graph over the input closure of `roots`.
  ///
  /// # Errors
  ///
  /// Returns `Cycle` if the closure is not acyclic.
  pub fn from_roots(roots: &[Arc<Derivation>]) -> Result<Self, BuildError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut derivations = HashMap::new();
    let mut root_fps = Vec::new();

    // First pass: collect the closure, one node per fingerprint
    let mut stack: Vec<Arc<Derivation>> = roots.iter().rev().cloned().collect();
    while let Some(drv) = stack.pop() {
      let fp = drv.fingerprint().clone();
      if nodes.contains_key(&fp) {
        continue;
      }
      nodes.insert(fp.clone(), graph.add_node(fp.clone()));
      stack.extend(drv.inputs().iter().rev().cloned());
      derivations.insert(fp, drv);
    }

    for root in roots {
      if !root_fps.contains(root.fingerprint()) {
        root_fps.push(root.fingerprint().clone());
      }
    }

    // Second pass: edges from each input to its dependent
    for (fp, drv) in &derivations {
      let dependent = nodes[fp];
      for input in drv.inputs() {
        if let Some(&dependency) = nodes.get(input.fingerprint()) {
          graph.update_edge(dependency, dependent, ());
        }
      }
    }

    let dag = Self {
      graph,
      nodes,
      derivations,
      roots: root_fps,
    };

    dag.verify_acyclic()?;

    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), BuildError> {
    toposort(&self.graph, None).map_err(|_| BuildError::Cycle)?;
    Ok(())
  }

  pub fn roots(&self) -> &[Fingerprint] {
    &self.roots
  }

  pub fn derivation(&self, fp: &Fingerprint) -> Option<&Arc<Derivation>> {
    self.derivations.get(fp)
  }

  pub fn contains(&self, fp: &Fingerprint) -> bool {
    self.nodes.contains_key(fp)
  }

  /// Get the number of distinct derivations in the graph.
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Get derivations in topological order.
  ///
  /// Dependencies come before dependents.
  pub fn topological(&self) -> Result<Vec<Fingerprint>, BuildError> {
    let sorted = toposort(&self.graph, None).map_err(|_| BuildError::Cycle)?;
    Ok(sorted.into_iter().map(|idx| self.graph[idx].clone()).collect())
  }

  /// Get derivations organized into parallel execution waves.
  ///
  /// Each wave contains derivations whose inputs are all in earlier waves.
  /// Waves are sorted by fingerprint so plans are reproducible.
  pub fn waves(&self) -> Result<Vec<Vec<Fingerprint>>, BuildError> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();

      if ready.is_empty() {
        return Err(BuildError::Cycle);
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<Fingerprint> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }

  /// Get the direct dependencies of a derivation.
  pub fn dependencies(&self, fp: &Fingerprint) -> Vec<Fingerprint> {
    self.neighbors(fp, Direction::Incoming)
  }

  /// Get the derivations that take this one as a direct input.
  pub fn dependents(&self, fp: &Fingerprint) -> Vec<Fingerprint> {
    self.neighbors(fp, Direction::Outgoing)
  }

  fn neighbors(&self, fp: &Fingerprint, direction: Direction) -> Vec<Fingerprint> {
    let Some(&idx) = self.nodes.get(fp) else {
      return Vec::new();
    };

    self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::derivation::StdPhase;

  fn drv(name: &str, inputs: &[&Arc<Derivation>]) -> Arc<Derivation> {
    Arc::new(
      Derivation::builder(name)
        .inputs(inputs.iter().map(|d| (*d).clone()))
        .run(StdPhase::Build, format!("build {}", name))
        .build()
        .unwrap(),
    )
  }

  fn names(dag: &BuildGraph, fps: &[Fingerprint]) -> Vec<String> {
    let mut names: Vec<String> = fps
      .iter()
      .map(|fp| dag.derivation(fp).unwrap().name().to_string())
      .collect();
    names.sort();
    names
  }

  #[test]
  fn empty_request() {
    let dag = BuildGraph::from_roots(&[]).unwrap();

    assert!(dag.is_empty());
    assert!(dag.waves().unwrap().is_empty());
    assert!(dag.topological().unwrap().is_empty());
  }

  #[test]
  fn linear_dependency_chain() {
    let a = drv("a", &[]);
    let b = drv("b", &[&a]);
    let c = drv("c", &[&b]);

    let dag = BuildGraph::from_roots(&[c.clone()]).unwrap();
    let waves = dag.waves().unwrap();

    assert_eq!(dag.len(), 3);
    assert_eq!(waves.len(), 3);
    assert_eq!(names(&dag, &waves[0]), ["a"]);
    assert_eq!(names(&dag, &waves[2]), ["c"]);
    assert_eq!(dag.dependencies(c.fingerprint()), [b.fingerprint().clone()]);
    assert_eq!(dag.dependents(a.fingerprint()), [b.fingerprint().clone()]);
    assert_eq!(dag.roots(), [c.fingerprint().clone()]);
  }

  #[test]
  fn diamond_dependency() {
    let a = drv("a", &[]);
    let b = drv("b", &[&a]);
    let c = drv("c", &[&a]);
    let d = drv("d", &[&b, &c]);

    let dag = BuildGraph::from_roots(&[d]).unwrap();
    let waves = dag.waves().unwrap();

    assert_eq!(waves.len(), 3);
    assert_eq!(names(&dag, &waves[1]), ["b", "c"]);

    let topo = dag.topological().unwrap();
    let pos = |name: &str| topo.iter().position(|fp| dag.derivation(fp).unwrap().name() == name).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("c") < pos("d"));
  }

  #[test]
  fn identical_derivations_are_deduplicated() {
    // Two separately built but identical zlib recipes
    let zlib1 = drv("zlib", &[]);
    let zlib2 = drv("zlib", &[]);
    let curl = drv("curl", &[&zlib1]);
    let git = drv("git", &[&zlib2, &curl]);

    let dag = BuildGraph::from_roots(&[git, curl]).unwrap();

    assert_eq!(dag.len(), 3);
    assert_eq!(dag.roots().len(), 2);
    assert_eq!(dag.dependents(zlib1.fingerprint()).len(), 2);
  }

  #[test]
  fn repeated_input_adds_one_edge() {
    let a = drv("a", &[]);
    let b = drv("b", &[&a, &a]);

    let dag = BuildGraph::from_roots(&[b.clone()]).unwrap();

    assert_eq!(dag.dependencies(b.fingerprint()).len(), 1);
  }

  #[test]
  fn parallel_independent_roots() {
    let roots = [drv("x", &[]), drv("y", &[]), drv("z", &[])];

    let dag = BuildGraph::from_roots(&roots).unwrap();
    let waves = dag.waves().unwrap();

    assert_eq!(waves.len(), 1);
    assert_eq!(names(&dag, &waves[0]), ["x", "y", "z"]);
  }
}
