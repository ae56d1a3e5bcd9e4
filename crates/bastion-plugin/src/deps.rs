//! Dependency graph checks over installed plugins.

use std::collections::{BTreeMap, HashSet};

use bastion_core::PluginId;

/// Installed plugin → its declared dependencies.
pub type DependencyGraph = BTreeMap<PluginId, Vec<PluginId>>;

/// If adding `candidate` with edges to `deps` would close a cycle, return
/// the cycle as a path starting and ending at `candidate`.
pub fn find_cycle(graph: &DependencyGraph, candidate: &PluginId, deps: &[PluginId]) -> Option<Vec<PluginId>> {
    let mut visited = HashSet::new();
    for dep in deps {
        let mut path = vec![candidate.clone()];
        if reaches(graph, dep, candidate, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn reaches(
    graph: &DependencyGraph,
    node: &PluginId,
    target: &PluginId,
    visited: &mut HashSet<PluginId>,
    path: &mut Vec<PluginId>,
) -> bool {
    path.push(node.clone());
    if node == target {
        return true;
    }
    if visited.insert(node.clone()) {
        if let Some(next) = graph.get(node) {
            for n in next {
                if reaches(graph, n, target, visited, path) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}

/// Installed plugins that declare `id` as a direct dependency.
pub fn dependents(graph: &DependencyGraph, id: &PluginId) -> Vec<PluginId> {
    graph
        .iter()
        .filter(|(_, deps)| deps.contains(id))
        .map(|(k, _)| k.clone())
        .collect()
}

pub fn format_path(path: &[PluginId]) -> String {
    path.iter().map(PluginId::as_str).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PluginId {
        PluginId::new(s).unwrap()
    }

    #[test]
    fn detects_indirect_cycle() {
        let mut graph = DependencyGraph::new();
        graph.insert(id("b"), vec![id("c")]);
        graph.insert(id("c"), vec![id("a")]);
        let cycle = find_cycle(&graph, &id("a"), &[id("b")]).unwrap();
        assert_eq!(format_path(&cycle), "a -> b -> c -> a");
    }

    #[test]
    fn no_cycle_in_diamond() {
        let mut graph = DependencyGraph::new();
        graph.insert(id("b"), vec![id("d")]);
        graph.insert(id("c"), vec![id("d")]);
        graph.insert(id("d"), vec![]);
        assert!(find_cycle(&graph, &id("a"), &[id("b"), id("c")]).is_none());
    }

    #[test]
    fn missing_dependencies_are_not_cycles() {
        let graph = DependencyGraph::new();
        assert!(find_cycle(&graph, &id("a"), &[id("ghost")]).is_none());
    }

    #[test]
    fn dependents_found() {
        let mut graph = DependencyGraph::new();
        graph.insert(id("p2"), vec![id("p3")]);
        graph.insert(id("p4"), vec![]);
        assert_eq!(dependents(&graph, &id("p3")), vec![id("p2")]);
    }
}
