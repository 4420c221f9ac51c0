use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::error::GraphError;

/// Order `nodes` so every node comes after the nodes it depends on.
///
/// Returns indices into `nodes`. Dependencies naming keys outside `nodes` are
/// ignored; among ready nodes the lowest index goes first.
///
/// # Errors
///
/// Returns an error when a dependency cycle is detected.
pub fn build_execution_order<K>(
    nodes: &[(K, BTreeSet<K>)],
) -> std::result::Result<Vec<usize>, GraphError>
where
    K: Ord + Clone + std::hash::Hash + fmt::Display,
{
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let positions: HashMap<&K, usize> = nodes
        .iter()
        .enumerate()
        .map(|(index, (key, _))| (key, index))
        .collect();
    if positions.len() != nodes.len() {
        return Err(GraphError::Invariant {
            message: "internal graph error: duplicate node key".to_string(),
        });
    }

    let mut indegree = vec![0_usize; nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, (key, dependencies)) in nodes.iter().enumerate() {
        for dependency in dependencies {
            if dependency == key {
                continue;
            }
            let Some(&from) = positions.get(dependency) else {
                continue;
            };
            adjacency[from].push(index);
            indegree[index] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter_map(|(index, count)| (*count == 0).then_some(index))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &neighbor in &adjacency[next] {
            let Some(entry) = indegree.get_mut(neighbor) else {
                return Err(GraphError::Invariant {
                    message: "internal graph error: missing neighbor indegree".to_string(),
                });
            };
            if *entry == 0 {
                continue;
            }
            *entry -= 1;
            if *entry == 0 {
                ready.insert(neighbor);
            }
        }
    }

    if order.len() != nodes.len() {
        let mut leftovers: Vec<&K> = indegree
            .iter()
            .enumerate()
            .filter_map(|(index, count)| (*count > 0).then_some(&nodes[index].0))
            .collect();
        leftovers.sort();
        let cycle = leftovers
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(GraphError::CycleDetected { cycle });
    }

    Ok(order)
}

/// Cycles found by depth-first search, each rotated to start at its smallest
/// node.
#[must_use]
pub fn find_cycles<K: Ord + Clone>(edges: &BTreeMap<K, BTreeSet<K>>) -> Vec<Vec<K>> {
    let mut finished = BTreeSet::new();
    let mut cycles = BTreeSet::new();
    for start in edges.keys() {
        let mut stack = Vec::new();
        visit(start, edges, &mut stack, &mut finished, &mut cycles);
    }
    cycles.into_iter().collect()
}

fn visit<K: Ord + Clone>(
    node: &K,
    edges: &BTreeMap<K, BTreeSet<K>>,
    stack: &mut Vec<K>,
    finished: &mut BTreeSet<K>,
    cycles: &mut BTreeSet<Vec<K>>,
) {
    if finished.contains(node) {
        return;
    }
    if let Some(position) = stack.iter().position(|entry| entry == node) {
        let mut cycle = stack[position..].to_vec();
        if let Some(smallest) = cycle
            .iter()
            .enumerate()
            .min_by(|left, right| left.1.cmp(right.1))
            .map(|(index, _)| index)
        {
            cycle.rotate_left(smallest);
        }
        cycles.insert(cycle);
        return;
    }

    stack.push(node.clone());
    if let Some(targets) = edges.get(node) {
        for target in targets {
            visit(target, edges, stack, finished, cycles);
        }
    }
    stack.pop();
    finished.insert(node.clone());
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use std::collections::{BTreeMap, BTreeSet};

    use super::{build_execution_order, find_cycles};

    fn deps(items: &[&'static str]) -> BTreeSet<&'static str> {
        items.iter().copied().collect()
    }

    #[test]
    fn orders_by_dependency_edges() {
        let nodes = vec![("b", deps(&["a"])), ("a", deps(&[])), ("c", deps(&["b", "x"]))];
        let ordered = build_execution_order(&nodes).expect("order");
        assert_eq!(ordered, vec![1, 0, 2]);
    }

    #[test]
    fn independent_nodes_keep_declaration_order() {
        let nodes = vec![("z", deps(&[])), ("y", deps(&[])), ("x", deps(&[]))];
        let ordered = build_execution_order(&nodes).expect("order");
        assert_eq!(ordered, vec![0, 1, 2]);
    }

    #[test]
    fn detects_cycle() {
        let nodes = vec![("a", deps(&["b"])), ("b", deps(&["a"]))];
        let err = build_execution_order(&nodes).expect_err("must fail");
        assert!(err.to_string().contains("cycle"));
        assert!(err.to_string().contains("a -> b"));
    }

    #[test]
    fn finds_each_cycle_once() {
        let mut edges = BTreeMap::new();
        edges.insert("a", deps(&["b"]));
        edges.insert("b", deps(&["c"]));
        edges.insert("c", deps(&["a"]));
        edges.insert("d", deps(&["d", "a"]));

        let cycles = find_cycles(&edges);
        assert_eq!(cycles, vec![vec!["a", "b", "c"], vec!["d"]]);
    }
}
