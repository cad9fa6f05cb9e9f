//! Computed-field dependency graph.
//!
//! Built once at schema load: computed fields become nodes, `computed.*`
//! dependencies become edges, and `data.*` dependencies go into a separate
//! multimap used for fine-grained recomputation. A cycle refuses the load.
//!
//! Recomputation planning: given the set of changed data paths, the graph
//! returns the transitive closure of affected computed fields in topological
//! order. Prefix matching runs both ways: a dependency on `data.items` is
//! affected by a change to `items.0.name`, and a dependency on
//! `data.user.name` is affected by a wholesale replacement of `user`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::SchemaError;
use crate::schema::ComputedSpec;
use crate::value::Path;

/// Dependency structure of a schema's computed section.
#[derive(Debug, Clone, Default)]
pub struct ComputedGraph {
    /// All computed field names in topological order (dependencies first).
    order: Vec<String>,
    /// Reverse edges: computed name → computed fields that depend on it.
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Data-relative dependency path → computed fields reading it.
    data_deps: BTreeMap<String, BTreeSet<String>>,
}

impl ComputedGraph {
    /// Build and topologically sort the graph. Cycles refuse the load.
    pub fn build(fields: &BTreeMap<String, ComputedSpec>) -> Result<Self, SchemaError> {
        let mut forward: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut data_deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (name, spec) in fields {
            forward.entry(name.clone()).or_default();
            for dep in &spec.deps {
                let dep_path = Path::parse(dep);
                match dep_path.head() {
                    Some("computed") => {
                        let target = dep_path.tail().to_string();
                        if !fields.contains_key(&target) {
                            return Err(SchemaError::Invalid {
                                message: format!(
                                    "computed field '{name}' depends on unknown computed '{target}'"
                                ),
                            });
                        }
                        forward
                            .entry(name.clone())
                            .or_default()
                            .insert(target.clone());
                        dependents.entry(target).or_default().insert(name.clone());
                    }
                    Some("data") => {
                        data_deps
                            .entry(dep_path.tail().to_string())
                            .or_default()
                            .insert(name.clone());
                    }
                    _ => {
                        return Err(SchemaError::Invalid {
                            message: format!(
                                "computed field '{name}' has dependency '{dep}' outside data./computed."
                            ),
                        })
                    }
                }
            }
        }

        let order = toposort(&forward)?;
        Ok(Self {
            order,
            dependents,
            data_deps,
        })
    }

    /// All computed names, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Computed fields affected by the given data-relative changed paths,
    /// including transitive dependents, in topological order.
    pub fn affected(&self, changed: &[Path]) -> Vec<String> {
        let mut seed: BTreeSet<&String> = BTreeSet::new();
        for (dep, readers) in &self.data_deps {
            let dep_path = Path::parse(dep);
            let hit = changed
                .iter()
                .any(|c| dep_path.starts_with(c) || c.starts_with(&dep_path));
            if hit {
                seed.extend(readers);
            }
        }

        // Transitive closure over computed-to-computed dependents.
        let mut closed: BTreeSet<&String> = BTreeSet::new();
        let mut queue: VecDeque<&String> = seed.into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if !closed.insert(name) {
                continue;
            }
            if let Some(readers) = self.dependents.get(name) {
                queue.extend(readers.iter());
            }
        }

        self.order
            .iter()
            .filter(|name| closed.contains(name))
            .cloned()
            .collect()
    }
}

/// Kahn's algorithm; reports a concrete cycle path on failure.
fn toposort(forward: &BTreeMap<String, BTreeSet<String>>) -> Result<Vec<String>, SchemaError> {
    let mut in_degree: BTreeMap<&String, usize> = forward
        .keys()
        .map(|name| (name, forward[name].len()))
        .collect();
    let mut dependents: BTreeMap<&String, Vec<&String>> = BTreeMap::new();
    for (name, deps) in forward {
        for dep in deps {
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut ready: VecDeque<&String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(forward.len());

    while let Some(name) = ready.pop_front() {
        order.push(name.clone());
        if let Some(readers) = dependents.get(name) {
            for reader in readers {
                if let Some(degree) = in_degree.get_mut(*reader) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*reader);
                    }
                }
            }
        }
    }

    if order.len() == forward.len() {
        return Ok(order);
    }

    // Something remains on a cycle; walk it for the diagnostic.
    let remaining: BTreeSet<&String> = forward
        .keys()
        .filter(|name| !order.contains(*name))
        .collect();
    let cycle = find_cycle(forward, &remaining);
    Err(SchemaError::CyclicDependency { cycle })
}

fn find_cycle(forward: &BTreeMap<String, BTreeSet<String>>, remaining: &BTreeSet<&String>) -> String {
    let Some(start) = remaining.iter().next() else {
        return String::from("<unknown>");
    };
    let mut seen: Vec<&String> = Vec::new();
    let mut current = *start;
    loop {
        if let Some(position) = seen.iter().position(|name| *name == current) {
            let mut parts: Vec<&str> = seen[position..].iter().map(|s| s.as_str()).collect();
            parts.push(current.as_str());
            return parts.join(" -> ");
        }
        seen.push(current);
        let next = forward
            .get(current)
            .and_then(|deps| deps.iter().find(|d| remaining.contains(d)));
        match next {
            Some(next) => current = next,
            None => return current.clone(),
        }
    }
}
