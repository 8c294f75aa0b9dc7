//! Dependency and conflict checks over a selected set of patches, and the
//! install order that puts every dependency before its dependents.

use std::collections::{BTreeMap, HashSet};

use crate::error::DependencyError;
use crate::manifest::Manifest;

pub type ManifestMap = BTreeMap<String, Manifest>;

fn manifest<'a>(manifests: &'a ManifestMap, id: &str) -> Result<&'a Manifest, DependencyError> {
    manifests
        .get(id)
        .ok_or_else(|| DependencyError::UnknownPatch(id.to_string()))
}

/// Every requirement of every selected patch must itself be selected.
/// Patches installed earlier, outside this batch, do not count.
pub fn validate_dependencies(
    manifests: &ManifestMap,
    selected: &[String],
) -> Result<(), DependencyError> {
    let chosen: HashSet<&str> = selected.iter().map(String::as_str).collect();
    for id in selected {
        for required in &manifest(manifests, id)?.requires {
            if !chosen.contains(required.as_str()) {
                return Err(DependencyError::MissingDependency {
                    patch: id.clone(),
                    requires: required.clone(),
                });
            }
        }
    }
    Ok(())
}

/// No selected patch may conflict with another selected patch.
pub fn validate_no_conflicts(
    manifests: &ManifestMap,
    selected: &[String],
) -> Result<(), DependencyError> {
    let chosen: HashSet<&str> = selected.iter().map(String::as_str).collect();
    for id in selected {
        for other in &manifest(manifests, id)?.conflicts {
            if chosen.contains(other.as_str()) {
                return Err(DependencyError::Conflict {
                    patch: id.clone(),
                    other: other.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Walk the requires-graph from each root. A node that shows up again on
/// the active path closes a cycle; the error carries that path plus the
/// repeated id. Requirements with no manifest are skipped here and caught
/// by [`validate_dependencies`].
pub fn detect_circular_dependencies(
    manifests: &ManifestMap,
    roots: &[String],
) -> Result<(), DependencyError> {
    fn walk<'a>(
        manifests: &'a ManifestMap,
        id: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), DependencyError> {
        if path.contains(&id) {
            let mut cycle: Vec<String> = path.iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(DependencyError::Cycle { path: cycle });
        }
        if done.contains(id) {
            return Ok(());
        }
        let Some(m) = manifests.get(id) else {
            return Ok(());
        };

        path.push(id);
        for required in &m.requires {
            walk(manifests, required, path, done)?;
        }
        path.pop();
        done.insert(id);
        Ok(())
    }

    let mut done = HashSet::new();
    for root in roots {
        let mut path = Vec::new();
        walk(manifests, root, &mut path, &mut done)?;
    }
    Ok(())
}

/// Depth-first topological order restricted to `selected`: each patch is
/// appended after all of its selected requirements.
pub fn calculate_install_order(
    manifests: &ManifestMap,
    selected: &[String],
) -> Result<Vec<String>, DependencyError> {
    struct Walk<'a> {
        manifests: &'a ManifestMap,
        chosen: HashSet<&'a str>,
        visiting: Vec<&'a str>,
        visited: HashSet<&'a str>,
        order: Vec<String>,
    }

    impl<'a> Walk<'a> {
        fn visit(&mut self, id: &'a str) -> Result<(), DependencyError> {
            if self.visited.contains(id) {
                return Ok(());
            }
            if self.visiting.contains(&id) {
                let mut path: Vec<String> = self.visiting.iter().map(|s| s.to_string()).collect();
                path.push(id.to_string());
                return Err(DependencyError::Cycle { path });
            }

            let m = manifest(self.manifests, id)?;
            self.visiting.push(id);
            for required in &m.requires {
                if self.chosen.contains(required.as_str()) {
                    self.visit(required)?;
                }
            }
            self.visiting.pop();

            self.visited.insert(id);
            self.order.push(id.to_string());
            Ok(())
        }
    }

    let mut walk = Walk {
        manifests,
        chosen: selected.iter().map(String::as_str).collect(),
        visiting: Vec::new(),
        visited: HashSet::new(),
        order: Vec::with_capacity(selected.len()),
    };
    for id in selected {
        walk.visit(id)?;
    }
    Ok(walk.order)
}

/// All four checks, in order, returning the install order.
pub fn resolve(manifests: &ManifestMap, selected: &[String]) -> Result<Vec<String>, DependencyError> {
    validate_dependencies(manifests, selected)?;
    validate_no_conflicts(manifests, selected)?;
    detect_circular_dependencies(manifests, selected)?;
    calculate_install_order(manifests, selected)
}
