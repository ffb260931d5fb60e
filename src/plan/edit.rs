//! Plan mutation helpers
//!
//! Each helper renders one new line, appends it to the canonical text of the
//! current plan and parses the result. The returned plan has therefore gone
//! through the same checks as a plan read from disk; `self` is untouched.

use super::write::{change_line, tag_line};
use super::{parse, Change, Dependency, Plan, Planner, Tag};
use crate::error::{Error, Result};
use crate::script::ScriptKind;
use chrono::{DateTime, FixedOffset};
use std::path::{Path, PathBuf};
use tracing::debug;

fn check_note(note: Option<&str>) -> Result<Option<String>> {
    match note.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) if n.contains('\n') => Err(Error::Validation(
            "notes must fit on a single line".to_string(),
        )),
        other => Ok(other.map(str::to_string)),
    }
}

impl Plan {
    fn with_line(&self, line: &str) -> Result<Plan> {
        let mut text = self.to_text();
        text.push_str(line);
        text.push('\n');
        Plan::parse(&text)
    }

    /// Append a new change. `requires` entries may be `name` or `name@tag`.
    pub fn add_change(
        &self,
        name: &str,
        requires: &[String],
        conflicts: &[String],
        note: Option<&str>,
        planner: &Planner,
        at: DateTime<FixedOffset>,
    ) -> Result<Plan> {
        if !parse::is_change_name(name) {
            return Err(Error::Validation(format!("invalid change name \"{}\"", name)));
        }
        if self.changes.iter().any(|c| c.name == name) {
            return Err(Error::Validation(format!(
                "change \"{}\" already exists; use rework to change it",
                name
            )));
        }

        let mut dependencies = Vec::with_capacity(requires.len() + conflicts.len());
        for reference in requires {
            dependencies.push(Dependency::requires(reference).ok_or_else(|| {
                Error::Validation(format!("invalid required change \"{}\"", reference))
            })?);
        }
        for reference in conflicts {
            dependencies.push(Dependency::conflicts_with(reference).ok_or_else(|| {
                Error::Validation(format!("invalid conflicting change \"{}\"", reference))
            })?);
        }

        let change = Change {
            name: name.to_string(),
            dependencies,
            timestamp: at,
            planner: planner.clone(),
            note: check_note(note)?,
            id: String::new(),
            tags: Vec::new(),
            rework_tag: None,
        };
        debug!(change = name, "adding change to plan");
        self.with_line(&change_line(&change))
    }

    /// Append a tag bound to the last change.
    pub fn add_tag(
        &self,
        name: &str,
        note: Option<&str>,
        planner: &Planner,
        at: DateTime<FixedOffset>,
    ) -> Result<Plan> {
        let name = name.strip_prefix('@').unwrap_or(name);
        if !parse::is_tag_name(name) {
            return Err(Error::Validation(format!("invalid tag name \"@{}\"", name)));
        }
        let last = self.last_change().ok_or_else(|| {
            Error::Validation(format!("cannot tag \"@{}\": the plan has no changes", name))
        })?;
        if self.tag(name).is_some() {
            return Err(Error::Validation(format!("tag \"@{}\" already exists", name)));
        }

        let tag = Tag {
            name: name.to_string(),
            change: last.name.clone(),
            change_id: last.id.clone(),
            timestamp: at,
            planner: planner.clone(),
            note: check_note(note)?,
            id: String::new(),
        };
        debug!(tag = name, change = %last.name, "adding tag to plan");
        self.with_line(&tag_line(&tag))
    }

    /// Append a new instance of an existing change. The new instance
    /// requires the previous one as of the latest tag in the plan.
    pub fn rework_change(
        &self,
        name: &str,
        note: Option<&str>,
        planner: &Planner,
        at: DateTime<FixedOffset>,
    ) -> Result<Plan> {
        let tag = self.rework_anchor(name)?;
        let change = Change {
            name: name.to_string(),
            dependencies: vec![Dependency {
                conflicts: false,
                change: name.to_string(),
                tag: Some(tag),
            }],
            timestamp: at,
            planner: planner.clone(),
            note: check_note(note)?,
            id: String::new(),
            tags: Vec::new(),
            rework_tag: None,
        };
        debug!(change = name, "reworking change");
        self.with_line(&change_line(&change))
    }

    /// Tag the superseded instance of `name` would be archived under.
    pub fn rework_anchor(&self, name: &str) -> Result<String> {
        let position = self
            .changes
            .iter()
            .rposition(|c| c.name == name)
            .ok_or_else(|| Error::UnknownChange(name.to_string()))?;
        parse::last_tag_after(&self.changes, position).ok_or_else(|| {
            Error::Validation(format!(
                "cannot rework \"{}\" without a tag after it; tag the plan first",
                name
            ))
        })
    }
}

/// Copy `<kind>/<name>.sql` to `<kind>/<name>@<tag>.sql` for every script
/// that exists, returning the written paths.
pub fn rework_scripts(top_dir: &Path, name: &str, tag: &str) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for kind in ScriptKind::ALL {
        let dir = top_dir.join(kind.dir());
        let source = dir.join(format!("{}.{}", name, super::SCRIPT_EXTENSION));
        if !source.exists() {
            continue;
        }
        let dest = dir.join(format!("{}@{}.{}", name, tag, super::SCRIPT_EXTENSION));
        std::fs::copy(&source, &dest).map_err(|e| Error::io(&dest, e))?;
        written.push(dest);
    }
    Ok(written)
}
