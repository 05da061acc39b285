//! Dependency-graph validation.
//!
//! The store re-checks acyclicity before committing any transaction that
//! grows or rewires a workflow's graph (bulk insert, surgery). Edges are
//! id-based; no in-memory graph with back-pointers is ever built.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::error::StoreError;

/// Verify that every `depends_on` reference points at a node in the set.
///
/// Returns `DanglingDependency` naming the first offending edge.
pub fn check_edges(
    nodes: &HashSet<Uuid>,
    edges: &[(Uuid, Uuid)],
) -> Result<(), StoreError> {
    for (task, dep) in edges {
        if !nodes.contains(dep) {
            return Err(StoreError::DanglingDependency {
                task: *task,
                dependency: *dep,
            });
        }
        if !nodes.contains(task) {
            return Err(StoreError::DanglingDependency {
                task: *task,
                dependency: *dep,
            });
        }
    }
    Ok(())
}

/// Detect dependency cycles using Kahn's algorithm for topological sort.
///
/// `edges` are `(task, depends_on)` pairs. Returns `Ok(())` if the graph is
/// a DAG, or `CycleDetected` listing the ids left unsorted.
pub fn ensure_acyclic(
    nodes: &HashSet<Uuid>,
    edges: &[(Uuid, Uuid)],
) -> Result<(), StoreError> {
    let ids: Vec<Uuid> = nodes.iter().copied().collect();
    let id_to_idx: HashMap<Uuid, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i))
        .collect();

    let n = ids.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (task, dep) in edges {
        let (Some(&task_idx), Some(&dep_idx)) = (id_to_idx.get(task), id_to_idx.get(dep)) else {
            // Edge into a node outside the set; check_edges reports these.
            continue;
        };
        // Edge: dep -> task (dep must complete before task).
        adj[dep_idx].push(task_idx);
        in_degree[task_idx] += 1;
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_ids: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| ids[i].to_string())
            .collect();
        return Err(StoreError::CycleDetected(cycle_ids.join(", ")));
    }

    Ok(())
}
