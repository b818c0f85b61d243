//! Processor dependency ordering
//!
//! Processors declare which shared dependencies they provide and which they
//! want. The resulting graph is sorted with Kahn's algorithm to decide the order
//! snapshot kinds are handled in: providers run before consumers.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Raised when the dependency graph has no valid topological order
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cyclic dependency: {remaining} vertices could not be ordered")]
pub struct CyclicDependencyError {
    pub remaining: usize,
}

/// Directed graph where an edge `a -> b` means `a` must be visible before `b` runs
#[derive(Debug, Clone)]
pub struct DependencyGraph<V> {
    vertices: Vec<V>,
    index: HashMap<V, usize>,
    edges: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl<V: Eq + Hash + Clone> DependencyGraph<V> {
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            in_degree: Vec::new(),
        }
    }

    /// Add a vertex if it is not already present, returning its index
    pub fn add_vertex(&mut self, vertex: V) -> usize {
        if let Some(&idx) = self.index.get(&vertex) {
            return idx;
        }

        let idx = self.vertices.len();
        self.index.insert(vertex.clone(), idx);
        self.vertices.push(vertex);
        self.edges.push(Vec::new());
        self.in_degree.push(0);
        idx
    }

    /// Record that `b` depends on `a`. Adding the same edge twice is a no-op.
    pub fn connect(&mut self, a: V, b: V) {
        let from = self.add_vertex(a);
        let to = self.add_vertex(b);

        if self.edges[from].contains(&to) {
            return;
        }

        self.edges[from].push(to);
        self.in_degree[to] += 1;
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Every vertex exactly once, in an order that respects all edges.
    ///
    /// The order is computed up front; a cycle fails before anything is yielded.
    pub fn traverse(&self) -> Result<std::vec::IntoIter<V>, CyclicDependencyError> {
        if self.vertices.is_empty() {
            return Ok(Vec::new().into_iter());
        }

        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| idx)
            .collect();

        if queue.is_empty() {
            return Err(CyclicDependencyError {
                remaining: self.vertices.len(),
            });
        }

        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(idx) = queue.pop_front() {
            order.push(self.vertices[idx].clone());

            for &next in &self.edges[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        let remaining = in_degree.iter().filter(|degree| **degree > 0).count();
        if remaining > 0 {
            return Err(CyclicDependencyError { remaining });
        }

        Ok(order.into_iter())
    }
}

impl<V: Eq + Hash + Clone> Default for DependencyGraph<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared data published by one processor and read by others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    /// Discovered Services and the gateway's own Service
    Service,
    /// Secret availability
    Secret,
    /// IngressClasses owned by this gateway
    IngressClasses,
}

impl Dependency {
    /// Snapshot key holding the objects this dependency is built from
    pub fn watt_key(&self) -> &'static str {
        match self {
            Dependency::Service => "service",
            Dependency::Secret => "secret",
            Dependency::IngressClasses => "ingressclasses",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Dependency::Secret,
            Dependency::Service,
            Dependency::IngressClasses,
        ]
    }
}

/// Graph vertex: a shared dependency or a named processor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Vertex {
    Dependency(Dependency),
    Processor(String),
}

/// What one processor wants and provides
#[derive(Debug, Clone, Default)]
pub struct DependencyInjector {
    wants: Vec<Dependency>,
    provides: Vec<Dependency>,
}

impl DependencyInjector {
    pub fn want(&mut self, dep: Dependency) -> &mut Self {
        if !self.wants.contains(&dep) {
            self.wants.push(dep);
        }
        self
    }

    pub fn provide(&mut self, dep: Dependency) -> &mut Self {
        if !self.provides.contains(&dep) {
            self.provides.push(dep);
        }
        self
    }

    pub fn wants(&self) -> &[Dependency] {
        &self.wants
    }

    pub fn provides(&self) -> &[Dependency] {
        &self.provides
    }
}

/// Collects the declarations of every processor
#[derive(Debug, Clone)]
pub struct DependencyManager {
    known: Vec<Dependency>,
    injectors: Vec<(String, DependencyInjector)>,
}

impl DependencyManager {
    /// Manager aware of `known` dependencies, in the order given
    pub fn new(known: &[Dependency]) -> Self {
        Self {
            known: known.to_vec(),
            injectors: Vec::new(),
        }
    }

    /// Injector for the processor called `name`, created on first use
    pub fn register(&mut self, name: &str) -> &mut DependencyInjector {
        let idx = match self.injectors.iter().position(|(n, _)| n == name) {
            Some(idx) => idx,
            None => {
                self.injectors
                    .push((name.to_string(), DependencyInjector::default()));
                self.injectors.len() - 1
            }
        };
        &mut self.injectors[idx].1
    }

    fn graph(&self) -> DependencyGraph<Vertex> {
        let mut graph = DependencyGraph::new();

        for dep in &self.known {
            graph.add_vertex(Vertex::Dependency(*dep));
        }

        for (name, injector) in &self.injectors {
            let processor = Vertex::Processor(name.clone());
            graph.add_vertex(processor.clone());

            for dep in &injector.wants {
                graph.connect(Vertex::Dependency(*dep), processor.clone());
            }
            for dep in &injector.provides {
                graph.connect(processor.clone(), Vertex::Dependency(*dep));
            }
        }

        graph
    }

    /// Snapshot keys of the dependencies, providers before consumers
    pub fn sorted_watt_keys(&self) -> Result<Vec<&'static str>, CyclicDependencyError> {
        Ok(self
            .graph()
            .traverse()?
            .filter_map(|vertex| match vertex {
                Vertex::Dependency(dep) => Some(dep.watt_key()),
                Vertex::Processor(_) => None,
            })
            .collect())
    }
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new(Dependency::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_is_idempotent() {
        let mut graph = DependencyGraph::new();
        graph.connect("a", "b");
        graph.connect("a", "b");

        let order: Vec<_> = graph.traverse().unwrap().collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_graph() {
        let graph: DependencyGraph<u32> = DependencyGraph::new();
        assert_eq!(graph.traverse().unwrap().count(), 0);
    }

    #[test]
    fn test_sorted_watt_keys() {
        let mut deps = DependencyManager::default();
        deps.register("a")
            .want(Dependency::Secret)
            .want(Dependency::Service)
            .provide(Dependency::IngressClasses);
        deps.register("b").provide(Dependency::Secret);
        deps.register("c").provide(Dependency::Service);

        assert_eq!(
            deps.sorted_watt_keys().unwrap(),
            vec!["secret", "service", "ingressclasses"]
        );
    }

    #[test]
    fn test_cyclic_declarations() {
        let mut deps = DependencyManager::default();
        deps.register("a")
            .provide(Dependency::Secret)
            .want(Dependency::Service);
        deps.register("b")
            .provide(Dependency::Service)
            .want(Dependency::IngressClasses);
        deps.register("c")
            .provide(Dependency::IngressClasses)
            .want(Dependency::Secret);

        assert!(deps.sorted_watt_keys().is_err());
    }
}
