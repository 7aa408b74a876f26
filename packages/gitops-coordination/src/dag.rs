use crate::dependency_graph::RepoId;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

/// Repository → direct dependencies
pub type Adjacency = BTreeMap<RepoId, BTreeSet<RepoId>>;

/// Repositories forming a loop, in edge order, without repeating the first.
/// `[a, b]` means `a → b → a`.
pub type Cycle = Vec<RepoId>;

/// Result of wave ordering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaveOrder {
    /// Mutually independent groups; every dependency sits in an earlier wave
    pub waves: Vec<Vec<RepoId>>,
    /// Nodes Kahn's algorithm could not place (only non-empty on a residual cycle)
    pub unordered: Vec<RepoId>,
}

/// Reachability closure per repository.
///
/// A repository appears in its own closure only when it sits on a cycle.
/// Traversal is bounded by the visited set, so cycles terminate.
pub fn transitive_closure(adjacency: &Adjacency) -> BTreeMap<RepoId, BTreeSet<RepoId>> {
    adjacency
        .par_iter()
        .map(|(repo, _)| (repo.clone(), reachable_from(adjacency, repo)))
        .collect()
}

fn reachable_from(adjacency: &Adjacency, start: &str) -> BTreeSet<RepoId> {
    let mut reached = BTreeSet::new();
    let mut queue: VecDeque<&RepoId> = VecDeque::new();

    if let Some(deps) = adjacency.get(start) {
        queue.extend(deps.iter());
    }

    while let Some(current) = queue.pop_front() {
        if !reached.insert(current.clone()) {
            continue;
        }
        if let Some(deps) = adjacency.get(current) {
            queue.extend(deps.iter().filter(|d| !reached.contains(*d)));
        }
    }

    reached
}

/// Distinct cycles found by depth-first traversal with a recursion stack.
///
/// Each back edge yields one cycle, reported once in its lexicographically
/// smallest rotation. Output is sorted.
pub fn find_cycles(adjacency: &Adjacency) -> Vec<Cycle> {
    let mut nodes: BTreeSet<&RepoId> = adjacency.keys().collect();
    for deps in adjacency.values() {
        nodes.extend(deps.iter());
    }

    let mut visited = HashSet::new();
    let mut found = BTreeSet::new();

    for node in nodes {
        if !visited.contains(node.as_str()) {
            let mut stack = Vec::new();
            let mut on_stack = HashSet::new();
            visit(
                node,
                adjacency,
                &mut visited,
                &mut stack,
                &mut on_stack,
                &mut found,
            );
        }
    }

    found.into_iter().collect()
}

fn visit(
    node: &str,
    adjacency: &Adjacency,
    visited: &mut HashSet<RepoId>,
    stack: &mut Vec<RepoId>,
    on_stack: &mut HashSet<RepoId>,
    found: &mut BTreeSet<Cycle>,
) {
    visited.insert(node.to_string());
    stack.push(node.to_string());
    on_stack.insert(node.to_string());

    if let Some(deps) = adjacency.get(node) {
        for dep in deps {
            if on_stack.contains(dep) {
                if let Some(start) = stack.iter().position(|n| n == dep) {
                    found.insert(canonical_rotation(&stack[start..]));
                }
            } else if !visited.contains(dep) {
                visit(dep, adjacency, visited, stack, on_stack, found);
            }
        }
    }

    stack.pop();
    on_stack.remove(node);
}

/// Smallest rotation of a cycle, so `[b, a]` and `[a, b]` compare equal
pub fn canonical_rotation(cycle: &[RepoId]) -> Cycle {
    (0..cycle.len())
        .map(|shift| {
            cycle[shift..]
                .iter()
                .chain(cycle[..shift].iter())
                .cloned()
                .collect::<Vec<_>>()
        })
        .min()
        .unwrap_or_default()
}

/// Kahn's topological sort restricted to `nodes`, grouped into waves.
///
/// Edges leaving `nodes` are ignored. Each wave is sorted ascending so output
/// is deterministic.
pub fn deployment_waves(adjacency: &Adjacency, nodes: &BTreeSet<RepoId>) -> WaveOrder {
    let mut in_degree: BTreeMap<&RepoId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&RepoId, Vec<&RepoId>> = BTreeMap::new();

    for node in nodes {
        let deps: Vec<&RepoId> = adjacency
            .get(node)
            .map(|deps| deps.iter().filter(|d| nodes.contains(*d)).collect())
            .unwrap_or_default();
        in_degree.insert(node, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut order = WaveOrder::default();

    while !in_degree.is_empty() {
        let ready: Vec<&RepoId> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();

        if ready.is_empty() {
            order.unordered = in_degree.keys().map(|id| (*id).clone()).collect();
            break;
        }

        for id in &ready {
            in_degree.remove(*id);
            if let Some(children) = dependents.get(*id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(*child) {
                        *degree -= 1;
                    }
                }
            }
        }

        order
            .waves
            .push(ready.into_iter().cloned().collect());
    }

    order
}

/// All simple paths `source → … → target` following dependency edges
pub fn simple_paths(adjacency: &Adjacency, source: &str, target: &str) -> Vec<Vec<RepoId>> {
    fn walk(
        adjacency: &Adjacency,
        current: &str,
        target: &str,
        path: &mut Vec<RepoId>,
        paths: &mut Vec<Vec<RepoId>>,
    ) {
        if current == target {
            paths.push(path.clone());
            return;
        }
        if let Some(deps) = adjacency.get(current) {
            for dep in deps {
                if path.contains(dep) {
                    continue;
                }
                path.push(dep.clone());
                walk(adjacency, dep, target, path, paths);
                path.pop();
            }
        }
    }

    let mut paths = Vec::new();
    if source == target {
        return paths;
    }
    let mut path = vec![source.to_string()];
    walk(adjacency, source, target, &mut path, &mut paths);
    paths
}

/// Human-readable wave plan (for logging)
pub fn describe_waves(waves: &[Vec<RepoId>]) -> String {
    waves
        .iter()
        .enumerate()
        .map(|(i, wave)| {
            if wave.len() > 1 {
                format!("Wave {}: {} (parallel)", i + 1, wave.join(" ∥ "))
            } else {
                format!("Wave {}: {}", i + 1, wave.join(""))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Adjacency {
        edges
            .iter()
            .map(|(repo, deps)| {
                (
                    repo.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<RepoId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_waves_linear_chain() {
        let adj = graph(&[("web", &["api"]), ("api", &["db"]), ("db", &[])]);
        let order = deployment_waves(&adj, &set(&["web", "api", "db"]));

        assert_eq!(
            order.waves,
            vec![vec!["db".to_string()], vec!["api".to_string()], vec!["web".to_string()]]
        );
        assert!(order.unordered.is_empty());
    }

    #[test]
    fn test_waves_parallel_detection_sorted() {
        let adj = graph(&[("b", &[]), ("a", &[]), ("c", &["a", "b"])]);
        let order = deployment_waves(&adj, &set(&["a", "b", "c"]));

        assert_eq!(order.waves.len(), 2);
        assert_eq!(order.waves[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(order.waves[1], vec!["c".to_string()]);
    }

    #[test]
    fn test_waves_ignore_edges_outside_set() {
        let adj = graph(&[("web", &["api"]), ("api", &["db"])]);
        let order = deployment_waves(&adj, &set(&["web", "db"]));

        assert_eq!(order.waves, vec![vec!["db".to_string(), "web".to_string()]]);
    }

    #[test]
    fn test_waves_residual_cycle_reported() {
        let adj = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let order = deployment_waves(&adj, &set(&["a", "b", "c"]));

        assert_eq!(order.waves, vec![vec!["c".to_string()]]);
        assert_eq!(order.unordered, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_closure_terminates_on_cycle() {
        let adj = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &["a"])]);
        let closure = transitive_closure(&adj);

        assert!(closure["a"].contains("a"));
        assert_eq!(closure["d"], set(&["a", "b", "c"]));
        assert!(!closure["d"].contains("d"));
    }

    #[test]
    fn test_find_cycles_canonical_once() {
        let adj = graph(&[("b", &["a"]), ("a", &["b"]), ("c", &["c2"]), ("c2", &[])]);
        let cycles = find_cycles(&adj);

        assert_eq!(cycles, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_find_cycles_multiple() {
        let adj = graph(&[
            ("a", &["b"]),
            ("b", &["a", "c"]),
            ("c", &["d"]),
            ("d", &["c"]),
        ]);
        let cycles = find_cycles(&adj);

        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec!["a".to_string(), "b".to_string()]));
        assert!(cycles.contains(&vec!["c".to_string(), "d".to_string()]));
    }

    #[test]
    fn test_canonical_rotation() {
        let cycle = vec!["m".to_string(), "c".to_string(), "x".to_string()];
        assert_eq!(
            canonical_rotation(&cycle),
            vec!["c".to_string(), "x".to_string(), "m".to_string()]
        );
    }

    #[test]
    fn test_simple_paths_diamond() {
        let adj = graph(&[
            ("web", &["api", "auth"]),
            ("api", &["db"]),
            ("auth", &["db"]),
            ("db", &[]),
        ]);
        let paths = simple_paths(&adj, "web", "db");

        assert_eq!(paths.len(), 2);
        assert!(paths.contains(&vec!["web".to_string(), "api".to_string(), "db".to_string()]));
        assert!(paths.contains(&vec!["web".to_string(), "auth".to_string(), "db".to_string()]));
    }

    #[test]
    fn test_describe_waves() {
        let plan = describe_waves(&[
            vec!["db".to_string()],
            vec!["api".to_string(), "auth".to_string()],
        ]);
        assert!(plan.contains("Wave 1: db"));
        assert!(plan.contains("Wave 2: api ∥ auth (parallel)"));
    }
}
