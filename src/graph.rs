//! Service dependency graph.
//!
//! Nodes are services; a directed edge records that one service must be
//! handled after another. Edges come from five manifest relationships:
//! `links`, `volumes_from`, `depends_on`, `network_mode: service:X` and
//! `ipc: service:X`. The graph answers the questions the project engine
//! asks: a topological order (or the offending cycle), the transitive
//! dependency and dependent closures of a filter set, and the parallel
//! wave decomposition.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::config::Manifest;
use crate::error::{Error, Result};

/// Why an edge exists. `DependsOn` edges additionally carry the
/// start-before constraint from the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Link,
    VolumesFrom,
    DependsOn,
    NetNamespace,
    IpcNamespace,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Link => write!(f, "links"),
            EdgeKind::VolumesFrom => write!(f, "volumes_from"),
            EdgeKind::DependsOn => write!(f, "depends_on"),
            EdgeKind::NetNamespace => write!(f, "network_mode"),
            EdgeKind::IpcNamespace => write!(f, "ipc"),
        }
    }
}

/// An outgoing dependency of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub target: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashSet<String>,
    /// `edges[a]` lists the services `a` depends on.
    edges: HashMap<String, Vec<Edge>>,
    /// `reverse[a]` lists the services depending on `a`.
    reverse: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a merged manifest and reject cycles up front.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let mut graph = DependencyGraph::new();

        for name in manifest.services.keys() {
            graph.add_node(name.clone());
        }

        for (name, service) in &manifest.services {
            for link in &service.links {
                let target = link.split(':').next().unwrap_or(link);
                graph.add_edge(name, target, EdgeKind::Link);
            }
            for entry in &service.volumes_from {
                if entry.starts_with("container:") {
                    continue;
                }
                let target = entry.split(':').next().unwrap_or(entry);
                graph.add_edge(name, target, EdgeKind::VolumesFrom);
            }
            for dep in &service.depends_on {
                graph.add_edge(name, dep, EdgeKind::DependsOn);
            }
            if let Some(target) = service.network_mode.as_ref().and_then(|m| m.service_ref()) {
                graph.add_edge(name, target, EdgeKind::NetNamespace);
            }
            if let Some(target) = service.ipc.as_ref().and_then(|m| m.service_ref()) {
                graph.add_edge(name, target, EdgeKind::IpcNamespace);
            }
        }

        graph.topological_sort()?;
        Ok(graph)
    }

    pub fn add_node(&mut self, name: String) {
        self.nodes.insert(name.clone());
        self.edges.entry(name.clone()).or_default();
        self.reverse.entry(name).or_default();
    }

    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        self.add_node(from.to_string());
        self.add_node(to.to_string());

        let edges = self.edges.entry(from.to_string()).or_default();
        if !edges.iter().any(|e| e.target == to) {
            edges.push(Edge {
                target: to.to_string(),
                kind,
            });
            self.reverse
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
    }

    pub fn nodes(&self) -> &HashSet<String> {
        &self.nodes
    }

    /// Direct dependencies of a service.
    pub fn direct_dependencies(&self, node: &str) -> &[Edge] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Services that directly depend on `node`.
    pub fn direct_dependents(&self, node: &str) -> &[String] {
        self.reverse.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Transitive dependencies of every node in `roots`, excluding the
    /// roots themselves, in dependency-first order.
    pub fn dependency_closure(&self, roots: &[String]) -> Vec<String> {
        let root_set: HashSet<&String> = roots.iter().collect();
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        for root in roots {
            self.dfs_dependencies(root, &mut visited, &mut result);
        }
        result.retain(|n| !root_set.contains(n));
        result
    }

    fn dfs_dependencies(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(edges) = self.edges.get(node) {
            for edge in edges {
                self.dfs_dependencies(&edge.target, visited, result);
            }
        }
        result.push(node.to_string());
    }

    /// Transitive dependents of every node in `roots`, excluding the roots
    /// themselves.
    pub fn dependent_closure(&self, roots: &[String]) -> Vec<String> {
        let root_set: HashSet<&String> = roots.iter().collect();
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        for root in roots {
            self.dfs_dependents(root, &mut visited, &mut result);
        }
        result.retain(|n| !root_set.contains(n));
        result
    }

    fn dfs_dependents(&self, node: &str, visited: &mut HashSet<String>, result: &mut Vec<String>) {
        if !visited.insert(node.to_string()) {
            return;
        }
        if let Some(dependents) = self.reverse.get(node) {
            for dependent in dependents {
                self.dfs_dependents(dependent, visited, result);
            }
        }
        result.push(node.to_string());
    }

    /// Kahn's algorithm: dependency-first order, or the cycle as an error.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&String, usize> = self
            .nodes
            .iter()
            .map(|node| (node, self.edges.get(node).map_or(0, Vec::len)))
            .collect();

        let mut queue: VecDeque<&String> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| *node)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            result.push(node.clone());
            if let Some(dependents) = self.reverse.get(node) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            return Err(Error::CircularDependency(self.find_cycle()));
        }
        Ok(result)
    }

    pub fn has_cycle(&self) -> bool {
        self.topological_sort().is_err()
    }

    /// Waves of services with no dependency edges between members of the
    /// same wave; wave N+1 only depends on earlier waves.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>> {
        self.topological_sort()?;

        let mut in_degree: HashMap<&String, usize> = self
            .nodes
            .iter()
            .map(|node| (node, self.edges.get(node).map_or(0, Vec::len)))
            .collect();

        let mut groups = Vec::new();
        let mut processed: HashSet<&String> = HashSet::new();

        while processed.len() < self.nodes.len() {
            let mut wave: Vec<String> = self
                .nodes
                .iter()
                .filter(|node| {
                    !processed.contains(node) && in_degree.get(node).copied().unwrap_or(0) == 0
                })
                .cloned()
                .collect();
            wave.sort();

            for node in &wave {
                let node = self.nodes.get(node).expect("wave node exists");
                processed.insert(node);
                if let Some(dependents) = self.reverse.get(node) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            groups.push(wave);
        }

        Ok(groups)
    }

    /// Extract one cycle path for the error message.
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        let mut nodes: Vec<&String> = self.nodes.iter().collect();
        nodes.sort();

        for node in nodes {
            if !visited.contains(node.as_str()) {
                if let Some(cycle) =
                    self.cycle_dfs(node, &mut visited, &mut on_stack, &mut path)
                {
                    return cycle;
                }
            }
        }
        self.nodes.iter().take(3).cloned().collect()
    }

    fn cycle_dfs(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(edges) = self.edges.get(node) {
            for edge in edges {
                if !visited.contains(&edge.target) {
                    if let Some(cycle) = self.cycle_dfs(&edge.target, visited, on_stack, path) {
                        return Some(cycle);
                    }
                } else if on_stack.contains(&edge.target) {
                    let start = path.iter().position(|n| n == &edge.target).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(edge.target.clone());
                    return Some(cycle);
                }
            }
        }

        on_stack.remove(node);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(yaml: &str) -> Manifest {
        use crate::config::{loader, MapEnv, MapResolver};
        let file = loader::load_file(yaml.as_bytes(), "test.yml", &MapEnv::default()).unwrap();
        crate::config::merge::merge_files(&[file], &MapResolver::default(), &MapEnv::default())
            .unwrap()
    }

    #[test]
    fn topo_sort_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b", EdgeKind::DependsOn);
        graph.add_edge("b", "c", EdgeKind::DependsOn);

        let sorted = graph.topological_sort().unwrap();
        let pos = |n: &str| sorted.iter().position(|s| s == n).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn cycle_reported_with_path() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b", EdgeKind::DependsOn);
        graph.add_edge("b", "a", EdgeKind::DependsOn);

        let err = graph.topological_sort().unwrap_err();
        match err {
            Error::CircularDependency(path) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn closure_excludes_roots() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("web", "db", EdgeKind::DependsOn);
        graph.add_edge("db", "disk", EdgeKind::VolumesFrom);

        let deps = graph.dependency_closure(&["web".to_string()]);
        assert_eq!(deps, vec!["disk".to_string(), "db".to_string()]);

        let dependents = graph.dependent_closure(&["disk".to_string()]);
        assert!(dependents.contains(&"db".to_string()));
        assert!(dependents.contains(&"web".to_string()));
    }

    #[test]
    fn parallel_groups_follow_waves() {
        let mut graph = DependencyGraph::new();
        graph.add_node("a".to_string());
        graph.add_node("b".to_string());
        graph.add_edge("c", "a", EdgeKind::DependsOn);
        graph.add_edge("c", "b", EdgeKind::DependsOn);

        let groups = graph.parallel_groups().unwrap();
        assert_eq!(groups[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(groups[1], vec!["c".to_string()]);
    }

    #[test]
    fn manifest_edges_cover_all_kinds() {
        let manifest = manifest(
            r#"
version: "2"
services:
  base:
    image: busybox
  linked:
    image: busybox
    links: ["base:alias"]
  sharer:
    image: busybox
    volumes_from: [base]
  depender:
    image: busybox
    depends_on: [base]
  netns:
    image: busybox
    network_mode: "service:base"
  ipcns:
    image: busybox
    ipc: "service:base"
"#,
        );
        let graph = DependencyGraph::from_manifest(&manifest).unwrap();
        let dependents = graph.direct_dependents("base");
        assert_eq!(dependents.len(), 5);

        let kinds: Vec<EdgeKind> = ["linked", "sharer", "depender", "netns", "ipcns"]
            .iter()
            .map(|n| graph.direct_dependencies(n)[0].kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EdgeKind::Link,
                EdgeKind::VolumesFrom,
                EdgeKind::DependsOn,
                EdgeKind::NetNamespace,
                EdgeKind::IpcNamespace
            ]
        );
    }

    #[test]
    fn manifest_cycle_is_fatal() {
        use crate::config::{loader, MapEnv, MapResolver};
        let file = loader::load_file(
            b"version: \"2\"\nservices:\n  a:\n    image: x\n    depends_on: [b]\n  b:\n    image: x\n    depends_on: [a]\n",
            "test.yml",
            &MapEnv::default(),
        )
        .unwrap();
        let manifest = crate::config::merge::merge_files(
            &[file],
            &MapResolver::default(),
            &MapEnv::default(),
        )
        .unwrap();

        let err = DependencyGraph::from_manifest(&manifest).unwrap_err();
        assert!(matches!(err, Error::CircularDependency(_)));
    }
}
