use std::collections::{HashMap, HashSet};

use crate::scope::error::{Result, ScopeError};

/// Topologically sorts a dependency graph so that leaves come first. Each
/// node is `(key, dependency keys)`; dependency keys that do not name another
/// node in the batch are ignored. The returned vector contains indices into
/// the input, ordered so every node appears after all of its in-batch
/// dependencies.
///
/// Fails with `CyclicDependency` when the graph contains a cycle.
pub fn topo_sort_leaves_first(nodes: &[(String, Vec<String>)]) -> Result<Vec<usize>> {
    let positions: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (key.as_str(), i))
        .collect();

    // in-batch edges only
    let deps: Vec<Vec<usize>> = nodes
        .iter()
        .map(|(_, dep_keys)| {
            dep_keys
                .iter()
                .filter_map(|key| positions.get(key.as_str()).copied())
                .collect()
        })
        .collect();

    let mut emitted: HashSet<usize> = HashSet::with_capacity(nodes.len());
    let mut order = Vec::with_capacity(nodes.len());

    while order.len() < nodes.len() {
        let mut progressed = false;

        for i in 0..nodes.len() {
            if emitted.contains(&i) {
                continue;
            }
            if deps[i].iter().all(|dep| emitted.contains(dep)) {
                emitted.insert(i);
                order.push(i);
                progressed = true;
            }
        }

        if !progressed {
            let remaining: Vec<&str> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !emitted.contains(i))
                .map(|(_, (key, _))| key.as_str())
                .collect();
            return Err(ScopeError::CyclicDependency(remaining.join(", ")));
        }
    }

    Ok(order)
}
