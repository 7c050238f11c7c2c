use crate::{Error, Result, resources::TResource};
use std::collections::{BTreeMap, BTreeSet};

/// Dependency graph over the resources of a template, keyed by id
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<String, TResource>,
    // dependency -> dependents
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    pub fn build(resources: &[TResource]) -> Result<Graph> {
        let mut nodes = BTreeMap::new();
        for res in resources {
            if nodes.insert(res.id.clone(), res.clone()).is_some() {
                return Err(Error::DuplicateId(res.id.clone()));
            }
        }
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for res in resources {
            for dep in &res.depend_ids {
                if !nodes.contains_key(dep) {
                    return Err(Error::MissingDependency(res.id.clone(), dep.clone()));
                }
                edges.entry(dep.clone()).or_default().insert(res.id.clone());
            }
        }
        Ok(Graph { nodes, edges })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TResource> {
        self.nodes.get(id)
    }

    fn in_degrees(&self) -> BTreeMap<&str, usize> {
        let mut degrees: BTreeMap<&str, usize> = self.nodes.keys().map(|k| (k.as_str(), 0)).collect();
        for dependents in self.edges.values() {
            for d in dependents {
                *degrees.entry(d.as_str()).or_default() += 1;
            }
        }
        degrees
    }

    /// Kahn's algorithm, ready nodes taken in lexicographic id order.
    /// Returns the ordered ids and the ids left over by a cycle.
    fn kahn(&self) -> (Vec<String>, Vec<String>) {
        let mut degrees = self.in_degrees();
        let mut ready: BTreeSet<&str> = degrees.iter().filter(|(_, d)| **d == 0).map(|(k, _)| *k).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            if let Some(dependents) = self.edges.get(id) {
                for d in dependents {
                    if let Some(deg) = degrees.get_mut(d.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(d.as_str());
                        }
                    }
                }
            }
        }
        let left = degrees
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(k, _)| k.to_string())
            .collect();
        (order, left)
    }

    pub fn validate(&self) -> Result<()> {
        let (_, left) = self.kahn();
        if left.is_empty() { Ok(()) } else { Err(Error::Cycle(left)) }
    }

    /// Resources in apply order
    pub fn topological_sort(&self) -> Result<Vec<TResource>> {
        let (order, left) = self.kahn();
        if !left.is_empty() {
            return Err(Error::Cycle(left));
        }
        Ok(order.iter().filter_map(|id| self.nodes.get(id).cloned()).collect())
    }
}

/// Build, validate and sort in one go
pub fn sorted(resources: &[TResource]) -> Result<Vec<TResource>> {
    Graph::build(resources)?.topological_sort()
}
