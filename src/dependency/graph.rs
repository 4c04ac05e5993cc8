use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Dependency graph between services.
///
/// An edge `A -> B` means "A uses B": B must be ready before A starts.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeSet<String>,
    /// `edges[A] = [B, C]` means A depends on B and C
    edges: HashMap<String, Vec<String>>,
    /// `reverse[A] = [B, C]` means B and C depend on A
    reverse: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a service → "uses" map.
    ///
    /// Every referenced dependency must itself be a key of the map; the
    /// first unknown reference (in service name order) is reported as
    /// [`Error::MissingDependency`].
    pub fn from_dependencies(deps: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut graph = Self::new();
        for name in deps.keys() {
            graph.add_node(name.clone());
        }
        for (name, uses) in deps {
            for dep in uses {
                if !deps.contains_key(dep) {
                    return Err(Error::MissingDependency {
                        service: name.clone(),
                        missing: dep.clone(),
                    });
                }
                graph.add_edge(name.clone(), dep.clone());
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, name: String) {
        self.edges.entry(name.clone()).or_default();
        self.reverse.entry(name.clone()).or_default();
        self.nodes.insert(name);
    }

    /// Add a dependency edge (`from` uses `to`). Duplicate edges are ignored.
    pub fn add_edge(&mut self, from: String, to: String) {
        self.add_node(from.clone());
        self.add_node(to.clone());

        let deps = self.edges.entry(from.clone()).or_default();
        if deps.contains(&to) {
            return;
        }
        deps.push(to.clone());
        self.reverse.entry(to).or_default().push(from);
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> &BTreeSet<String> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All transitive dependencies of a node, dependencies first.
    pub fn get_dependencies(&self, node: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        self.dfs_dependencies(node, node, &mut visited, &mut result);
        result
    }

    fn dfs_dependencies(
        &self,
        node: &str,
        start_node: &str,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }

        if let Some(deps) = self.edges.get(node) {
            let mut sorted: Vec<&String> = deps.iter().collect();
            sorted.sort();
            for dep in sorted {
                self.dfs_dependencies(dep, start_node, visited, result);
            }
        }

        if node != start_node {
            result.push(node.to_string());
        }
    }

    pub fn get_direct_dependencies(&self, node: &str) -> Vec<String> {
        self.edges.get(node).cloned().unwrap_or_default()
    }

    /// Nodes that directly depend on the given node
    pub fn get_dependents(&self, node: &str) -> Vec<String> {
        self.reverse.get(node).cloned().unwrap_or_default()
    }

    /// Every node that transitively depends on `node`, nearest first.
    pub fn get_all_dependents(&self, node: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::from([node.to_string()]);
        seen.insert(node.to_string());

        while let Some(current) = queue.pop_front() {
            let mut dependents = self.get_dependents(&current);
            dependents.sort();
            for dependent in dependents {
                if seen.insert(dependent.clone()) {
                    result.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        result
    }

    /// The requested nodes plus every transitive dependency of them.
    pub fn closure(&self, requested: &[String]) -> Result<BTreeSet<String>> {
        let mut keep = BTreeSet::new();
        for name in requested {
            if !self.contains(name) {
                return Err(Error::ServiceNotFound(name.clone()));
            }
            keep.insert(name.clone());
            keep.extend(self.get_dependencies(name));
        }
        Ok(keep)
    }

    /// Induced subgraph over `keep`.
    pub fn subgraph(&self, keep: &BTreeSet<String>) -> Graph {
        let mut graph = Graph::new();
        for node in keep.iter().filter(|n| self.contains(n)) {
            graph.add_node(node.clone());
            for dep in self.get_direct_dependencies(node) {
                if keep.contains(&dep) {
                    graph.add_edge(node.clone(), dep);
                }
            }
        }
        graph
    }

    /// Start levels (Kahn's algorithm).
    ///
    /// Level 0 holds every node without dependencies; each later level holds
    /// the nodes whose dependencies all sit in earlier levels. Names within a
    /// level are sorted. If extraction stalls, the nodes still on a cycle are
    /// reported and no levels are returned.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|node| {
                (
                    node.as_str(),
                    self.edges.get(node).map_or(0, |deps| deps.len()),
                )
            })
            .collect();

        let mut current: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| in_degree.get(node.as_str()) == Some(&0))
            .cloned()
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            current.sort();
            placed += current.len();

            let mut next = Vec::new();
            for node in &current {
                if let Some(dependents) = self.reverse.get(node) {
                    for dependent in dependents {
                        if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                            *degree -= 1;
                            if *degree == 0 {
                                next.push(dependent.clone());
                            }
                        }
                    }
                }
            }

            levels.push(std::mem::take(&mut current));
            current = next;
        }

        if placed != self.nodes.len() {
            let stuck: BTreeSet<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(node, _)| node.to_string())
                .collect();
            return Err(Error::CircularDependency(self.cycle_members(stuck)));
        }

        Ok(levels)
    }

    /// Levels over `requested` and its transitive dependencies only.
    pub fn levels_for(&self, requested: &[String]) -> Result<Vec<Vec<String>>> {
        let keep = self.closure(requested)?;
        self.subgraph(&keep).levels()
    }

    /// Dependencies-first ordering, flattened from [`levels`](Self::levels).
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    pub fn has_cycle(&self) -> bool {
        self.levels().is_err()
    }

    /// Narrow the nodes left over by Kahn's algorithm to those on a cycle.
    ///
    /// Leftovers also include nodes that merely depend on a cycle; they are
    /// peeled off by repeatedly removing leftovers nothing else depends on.
    fn cycle_members(&self, mut stuck: BTreeSet<String>) -> Vec<String> {
        loop {
            let removable: Vec<String> = stuck
                .iter()
                .filter(|node| {
                    !self
                        .get_dependents(node)
                        .iter()
                        .any(|dependent| stuck.contains(dependent))
                })
                .cloned()
                .collect();
            if removable.is_empty() {
                break;
            }
            for node in removable {
                stuck.remove(&node);
            }
        }
        stuck.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, uses)| {
                (
                    name.to_string(),
                    uses.iter().map(|u| u.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_transitive_dependencies() {
        let graph =
            Graph::from_dependencies(&deps(&[("a", &["b"]), ("b", &["c"]), ("c", &[])])).unwrap();

        assert_eq!(graph.get_dependencies("a"), vec!["c", "b"]);
        assert_eq!(graph.get_all_dependents("c"), vec!["b", "a"]);
    }

    #[test]
    fn test_levels_sorted_within_level() {
        let graph = Graph::from_dependencies(&deps(&[
            ("web", &["api"]),
            ("api", &["db", "cache"]),
            ("worker", &["db"]),
            ("db", &[]),
            ("cache", &[]),
        ]))
        .unwrap();

        let levels = graph.levels().unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["cache".to_string(), "db".to_string()],
                vec!["api".to_string(), "worker".to_string()],
                vec!["web".to_string()],
            ]
        );
    }

    #[test]
    fn test_two_node_cycle_reports_both() {
        let graph = Graph::from_dependencies(&deps(&[("a", &["b"]), ("b", &["a"])])).unwrap();
        match graph.levels() {
            Err(Error::CircularDependency(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
        assert!(graph.has_cycle());
    }

    #[test]
    fn test_cycle_report_excludes_downstream_nodes() {
        let graph = Graph::from_dependencies(&deps(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
            ("d", &["a"]),
            ("e", &[]),
        ]))
        .unwrap();
        match graph.levels() {
            Err(Error::CircularDependency(names)) => assert_eq!(names, vec!["a", "b", "c"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_dependency_is_not_a_cycle() {
        let err = Graph::from_dependencies(&deps(&[("api", &["db"])])).unwrap_err();
        match err {
            Error::MissingDependency { service, missing } => {
                assert_eq!(service, "api");
                assert_eq!(missing, "db");
            }
            other => panic!("expected missing dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_subset_includes_transitive_dependencies() {
        let graph = Graph::from_dependencies(&deps(&[
            ("web", &["api"]),
            ("api", &["db"]),
            ("db", &[]),
            ("docs", &[]),
        ]))
        .unwrap();

        let levels = graph.levels_for(&["api".to_string()]).unwrap();
        assert_eq!(
            levels,
            vec![vec!["db".to_string()], vec!["api".to_string()]]
        );

        assert!(matches!(
            graph.levels_for(&["nope".to_string()]),
            Err(Error::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_edges_ignored() {
        let mut graph = Graph::new();
        graph.add_edge("a".into(), "b".into());
        graph.add_edge("a".into(), "b".into());
        assert_eq!(graph.get_direct_dependencies("a"), vec!["b"]);
        assert_eq!(graph.levels().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_graph_has_no_levels() {
        let graph = Graph::new();
        assert!(graph.levels().unwrap().is_empty());
        assert!(graph.is_empty());
    }
}
