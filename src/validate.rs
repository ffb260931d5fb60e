//! Dependency validation against the registry
//!
//! A plain `requires` entry is satisfied by any deployed instance of the
//! named change; `name@tag` needs the exact instance that tag points at.
//! Conflicts block a deploy while any instance of the named change is
//! deployed.

use crate::error::{Error, Result};
use crate::plan::{Change, Plan};
use crate::registry::{DependencyRow, DeployedChange, ResolvedDependency};
use std::collections::{HashMap, HashSet};

/// Deployed state of one project, kept current while a run progresses.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    ids: HashSet<String>,
    /// Change name -> deployed ids in deploy order
    by_name: HashMap<String, Vec<String>>,
}

impl Validator {
    pub fn new(deployed: &[DeployedChange]) -> Self {
        let mut validator = Self::default();
        for row in deployed {
            validator.insert(&row.change, &row.change_id);
        }
        validator
    }

    fn insert(&mut self, name: &str, id: &str) {
        if self.ids.insert(id.to_string()) {
            self.by_name
                .entry(name.to_string())
                .or_default()
                .push(id.to_string());
        }
    }

    pub fn is_deployed(&self, change_id: &str) -> bool {
        self.ids.contains(change_id)
    }

    pub fn mark_deployed(&mut self, change: &Change) {
        self.insert(&change.name, &change.id);
    }

    pub fn mark_reverted(&mut self, change: &Change) {
        if self.ids.remove(&change.id) {
            if let Some(ids) = self.by_name.get_mut(&change.name) {
                ids.retain(|id| id != &change.id);
            }
        }
    }

    /// Check the change at `position` and resolve its dependencies to the
    /// deployed changes satisfying them.
    pub fn check_deploy(&self, plan: &Plan, position: usize) -> Result<Vec<ResolvedDependency>> {
        let change = plan
            .changes()
            .get(position)
            .ok_or_else(|| Error::UnknownChange(format!("plan position {}", position)))?;

        let mut resolved = Vec::with_capacity(change.dependencies.len());
        let mut missing = Vec::new();
        let mut conflicting = Vec::new();

        for dep in &change.dependencies {
            let reference = dep.reference();
            if dep.conflicts {
                let deployed = match &dep.tag {
                    Some(_) => plan
                        .resolve_dependency(position, dep)
                        .is_some_and(|c| self.is_deployed(&c.id)),
                    None => self.by_name.get(&dep.change).is_some_and(|ids| !ids.is_empty()),
                };
                if deployed {
                    conflicting.push(reference.clone());
                }
                resolved.push(ResolvedDependency {
                    conflicts: true,
                    reference,
                    dependency_id: None,
                });
                continue;
            }

            let planned = plan
                .resolve_dependency(position, dep)
                .map(|c| c.id.clone())
                .filter(|id| self.is_deployed(id));
            let satisfied = match (&dep.tag, planned) {
                (_, Some(id)) => Some(id),
                (None, None) => self
                    .by_name
                    .get(&dep.change)
                    .and_then(|ids| ids.last().cloned()),
                (Some(_), None) => None,
            };

            match satisfied {
                Some(id) => resolved.push(ResolvedDependency {
                    conflicts: false,
                    reference,
                    dependency_id: Some(id),
                }),
                None => missing.push(reference),
            }
        }

        if !missing.is_empty() {
            return Err(Error::DependencyUnsatisfied {
                change: change.format_name(),
                missing,
            });
        }
        if !conflicting.is_empty() {
            return Err(Error::ConflictDeployed {
                change: change.format_name(),
                conflicts: conflicting,
            });
        }
        Ok(resolved)
    }
}

/// Refuse to revert a set of changes while a deployed change outside the set
/// still requires one of them. `requiring` holds the registry rows pointing
/// at the set.
pub fn check_revert(
    reverting: &[DeployedChange],
    requiring: &[DependencyRow],
    deployed: &[DeployedChange],
) -> Result<()> {
    let leaving: HashSet<&str> = reverting.iter().map(|c| c.change_id.as_str()).collect();
    let names: HashMap<&str, &str> = deployed
        .iter()
        .map(|c| (c.change_id.as_str(), c.change.as_str()))
        .collect();

    // Report against the earliest-deployed blocked change
    for target in reverting.iter().rev() {
        let mut dependents: Vec<String> = requiring
            .iter()
            .filter(|row| row.dependency_id.as_deref() == Some(target.change_id.as_str()))
            .filter(|row| !leaving.contains(row.change_id.as_str()))
            .map(|row| {
                names
                    .get(row.change_id.as_str())
                    .map_or_else(|| row.change_id.clone(), |n| n.to_string())
            })
            .collect();
        if !dependents.is_empty() {
            dependents.sort();
            dependents.dedup();
            return Err(Error::RevertBlocked {
                change: target.change.clone(),
                dependents,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "%project=flipr\n\n\
        users 2025-01-01T00:00:00Z Jane <jane@example.com>\n\
        @v1.0 2025-01-01T00:00:01Z Jane <jane@example.com>\n\
        legacy 2025-01-01T00:00:02Z Jane <jane@example.com>\n\
        flips [users] 2025-01-02T00:00:00Z Jane <jane@example.com>\n\
        modern [!legacy] 2025-01-02T00:00:01Z Jane <jane@example.com>\n\
        @v2.0 2025-01-02T00:00:02Z Jane <jane@example.com>\n\
        users [users@v1.0] 2025-01-03T00:00:00Z Jane <jane@example.com>\n";

    fn plan() -> Plan {
        Plan::parse(PLAN).unwrap()
    }

    fn row(change: &Change) -> DeployedChange {
        DeployedChange {
            change_id: change.id.clone(),
            script_hash: None,
            change: change.name.clone(),
            project: "flipr".to_string(),
            note: String::new(),
            committed_at: String::new(),
            committer_name: String::new(),
            committer_email: String::new(),
            planned_at: String::new(),
            planner_name: String::new(),
            planner_email: String::new(),
        }
    }

    fn requires(dependent: &Change, dependency: &Change) -> DependencyRow {
        DependencyRow {
            change_id: dependent.id.clone(),
            dependency_type: "require".to_string(),
            dependency: dependency.name.clone(),
            dependency_id: Some(dependency.id.clone()),
        }
    }

    #[test]
    fn test_missing_requirement() {
        let plan = plan();
        let err = Validator::new(&[]).check_deploy(&plan, 2).unwrap_err();
        match err {
            Error::DependencyUnsatisfied { change, missing } => {
                assert_eq!(change, "flips");
                assert_eq!(missing, vec!["users"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_requirement_resolves_to_deployed_id() {
        let plan = plan();
        let users = &plan.changes()[0];
        let validator = Validator::new(&[row(users)]);
        let resolved = validator.check_deploy(&plan, 2).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].dependency_id.as_deref(), Some(users.id.as_str()));
    }

    #[test]
    fn test_conflict_blocks_deploy() {
        let plan = plan();
        let legacy = &plan.changes()[1];
        let err = Validator::new(&[row(legacy)]).check_deploy(&plan, 3).unwrap_err();
        assert!(matches!(err, Error::ConflictDeployed { conflicts, .. } if conflicts == vec!["legacy"]));

        let resolved = Validator::new(&[]).check_deploy(&plan, 3).unwrap();
        assert!(resolved[0].conflicts);
        assert_eq!(resolved[0].dependency_id, None);
    }

    #[test]
    fn test_tagged_requirement_needs_exact_instance() {
        let plan = plan();
        let rework = plan.changes().len() - 1;
        let err = Validator::new(&[]).check_deploy(&plan, rework).unwrap_err();
        assert!(matches!(err, Error::DependencyUnsatisfied { missing, .. } if missing == vec!["users@v1.0"]));

        let old = &plan.changes()[0];
        let resolved = Validator::new(&[row(old)]).check_deploy(&plan, rework).unwrap();
        assert_eq!(resolved[0].dependency_id.as_deref(), Some(old.id.as_str()));
    }

    #[test]
    fn test_mark_deployed_and_reverted() {
        let plan = plan();
        let users = &plan.changes()[0];
        let mut validator = Validator::new(&[]);
        validator.mark_deployed(users);
        assert!(validator.check_deploy(&plan, 2).is_ok());
        validator.mark_reverted(users);
        assert!(!validator.is_deployed(&users.id));
        assert!(validator.check_deploy(&plan, 2).is_err());
    }

    #[test]
    fn test_revert_blocked_by_outside_dependent() {
        let plan = plan();
        let users = &plan.changes()[0];
        let flips = &plan.changes()[2];
        let deployed = vec![row(users), row(flips)];
        let rows = vec![requires(flips, users)];

        let err = check_revert(&deployed[..1], &rows, &deployed).unwrap_err();
        match err {
            Error::RevertBlocked { change, dependents } => {
                assert_eq!(change, "users");
                assert_eq!(dependents, vec!["flips"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Reverting both together is fine
        assert!(check_revert(&deployed, &rows, &deployed).is_ok());
    }
}
