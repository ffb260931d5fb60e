//! Plan text parser
//!
//! Parsing runs in two passes. The first pass reads lines into raw entries
//! and rejects grammar errors with their line numbers. The second pass
//! resolves names: duplicates, unknown dependencies, tag placement, derived
//! identifiers, and finally the cycle check over the whole requires graph.

use super::graph::DependencyGraph;
use super::{compute_hash, Change, Dependency, Line, Plan, Planner, Pragma, Tag};
use crate::error::{Error, Result};
use crate::id::{ChangeInfo, TagInfo};
use chrono::{DateTime, FixedOffset};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{HashMap, HashSet};

const TIMESTAMP: &str = r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:Z|[+-]\d{2}:\d{2})";

lazy_static! {
    static ref PRAGMA_RE: Regex =
        Regex::new(r"^%\s*(?P<key>[A-Za-z0-9_.-]+)\s*=\s*(?P<value>.*?)\s*$").unwrap();
    static ref CHANGE_RE: Regex = Regex::new(&format!(
        r"^(?P<name>[A-Za-z0-9_:-]+)(?:\s+\[(?P<deps>[^\]]*)\])?\s+(?P<ts>{})\s+(?P<planner>[^#]*?)\s*(?:#\s?(?P<note>.*))?$",
        TIMESTAMP
    ))
    .unwrap();
    static ref TAG_RE: Regex = Regex::new(&format!(
        r"^@(?P<name>[A-Za-z0-9_.:-]+)\s+(?P<ts>{})\s+(?P<planner>[^#]*?)\s*(?:#\s?(?P<note>.*))?$",
        TIMESTAMP
    ))
    .unwrap();
    static ref PLANNER_RE: Regex = Regex::new(r"^(?P<name>[^<>]*?)\s*<(?P<email>[^<>\s]+)>$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^\s<>@]+@[^\s<>@]+$").unwrap();
    static ref CHANGE_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_:-]+$").unwrap();
    static ref TAG_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.:-]+$").unwrap();
}

pub(crate) fn is_change_name(name: &str) -> bool {
    CHANGE_NAME_RE.is_match(name)
}

pub(crate) fn is_tag_name(name: &str) -> bool {
    TAG_NAME_RE.is_match(name) && name != "HEAD" && name != "ROOT"
}

/// First-pass change line.
struct RawChange {
    line: usize,
    name: String,
    dependencies: Vec<Dependency>,
    timestamp: DateTime<FixedOffset>,
    planner: Planner,
    note: Option<String>,
}

/// First-pass tag line.
struct RawTag {
    line: usize,
    name: String,
    timestamp: DateTime<FixedOffset>,
    planner: Planner,
    note: Option<String>,
}

enum RawLine {
    Change(RawChange),
    Tag(RawTag),
    Blank,
    Comment(String),
}

pub(super) fn parse_plan(text: &str) -> Result<Plan> {
    let mut pragmas = Vec::new();
    let mut raw = Vec::new();
    let mut in_header = true;

    for (index, full_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = full_line.trim_end();
        let trimmed = line.trim_start();

        if in_header {
            if trimmed.starts_with('%') {
                pragmas.push(parse_pragma(trimmed, line_no)?);
                continue;
            }
            in_header = false;
            if trimmed.is_empty() {
                // Separator between header and entries
                continue;
            }
        }

        let entry = if trimmed.is_empty() {
            RawLine::Blank
        } else if trimmed.starts_with('#') {
            RawLine::Comment(line.to_string())
        } else if trimmed.starts_with('%') {
            return Err(Error::parse(
                line_no,
                "pragma found after the first plan entry",
            ));
        } else if trimmed.starts_with('@') {
            RawLine::Tag(parse_tag(trimmed, line_no)?)
        } else {
            RawLine::Change(parse_change(trimmed, line_no)?)
        };
        raw.push(entry);
    }

    if !pragmas.iter().any(|p: &Pragma| p.key == "project") {
        return Err(Error::parse(1, "missing %project pragma"));
    }

    resolve(pragmas, raw, compute_hash(text))
}

fn parse_pragma(line: &str, line_no: usize) -> Result<Pragma> {
    let caps = PRAGMA_RE
        .captures(line)
        .ok_or_else(|| Error::parse(line_no, format!("invalid pragma \"{}\"", line)))?;
    let value = caps["value"].to_string();
    if value.is_empty() {
        return Err(Error::parse(line_no, "pragma has no value"));
    }
    Ok(Pragma {
        key: caps["key"].to_string(),
        value,
    })
}

fn parse_change(line: &str, line_no: usize) -> Result<RawChange> {
    let caps = CHANGE_RE
        .captures(line)
        .ok_or_else(|| Error::parse(line_no, format!("invalid change entry \"{}\"", line)))?;

    let mut dependencies = Vec::new();
    if let Some(deps) = caps.name("deps") {
        for token in deps.as_str().split_whitespace() {
            let dep = Dependency::parse(token).ok_or_else(|| {
                Error::parse(line_no, format!("invalid dependency \"{}\"", token))
            })?;
            dependencies.push(dep);
        }
    }

    Ok(RawChange {
        line: line_no,
        name: caps["name"].to_string(),
        dependencies,
        timestamp: parse_timestamp(&caps["ts"], line_no)?,
        planner: parse_planner(&caps["planner"], line_no)?,
        note: parse_note(caps.name("note").map(|m| m.as_str())),
    })
}

fn parse_tag(line: &str, line_no: usize) -> Result<RawTag> {
    let caps = TAG_RE
        .captures(line)
        .ok_or_else(|| Error::parse(line_no, format!("invalid tag entry \"{}\"", line)))?;
    let name = caps["name"].to_string();
    if !is_tag_name(&name) {
        return Err(Error::parse(line_no, format!("reserved tag name \"@{}\"", name)));
    }

    Ok(RawTag {
        line: line_no,
        name,
        timestamp: parse_timestamp(&caps["ts"], line_no)?,
        planner: parse_planner(&caps["planner"], line_no)?,
        note: parse_note(caps.name("note").map(|m| m.as_str())),
    })
}

fn parse_timestamp(ts: &str, line_no: usize) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(ts)
        .map_err(|e| Error::parse(line_no, format!("invalid timestamp \"{}\": {}", ts, e)))
}

fn parse_planner(text: &str, line_no: usize) -> Result<Planner> {
    let text = text.trim();
    if let Some(caps) = PLANNER_RE.captures(text) {
        let name = caps["name"].trim();
        return Ok(Planner {
            name: (!name.is_empty()).then(|| name.to_string()),
            email: caps["email"].to_string(),
        });
    }
    if EMAIL_RE.is_match(text) {
        return Ok(Planner {
            name: None,
            email: text.to_string(),
        });
    }
    Err(Error::parse(line_no, format!("invalid planner \"{}\"", text)))
}

fn parse_note(note: Option<&str>) -> Option<String> {
    note.map(str::trim_end)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// Second pass: names, tags, identifiers and the dependency graph.
fn resolve(pragmas: Vec<Pragma>, raw: Vec<RawLine>, checksum: String) -> Result<Plan> {
    let project = pragmas
        .iter()
        .find(|p| p.key == "project")
        .map(|p| p.value.clone())
        .unwrap_or_default();

    let mut changes: Vec<Change> = Vec::new();
    let mut tags: Vec<Tag> = Vec::new();
    let mut layout = Vec::with_capacity(raw.len());
    let mut positions: HashMap<String, usize> = HashMap::new();
    // change name -> positions of its instances
    let mut instances: HashMap<String, Vec<usize>> = HashMap::new();
    // tag name -> position of the tagged change
    let mut tag_positions: HashMap<String, usize> = HashMap::new();
    // number of tags declared before each change
    let mut tags_before: Vec<usize> = Vec::new();
    let mut graph = DependencyGraph::new();

    for entry in raw {
        match entry {
            RawLine::Blank => layout.push(Line::Blank),
            RawLine::Comment(text) => layout.push(Line::Comment(text)),
            RawLine::Tag(raw_tag) => {
                let tagged = changes.len().checked_sub(1).ok_or_else(|| {
                    Error::Validation(format!(
                        "line {}: tag \"@{}\" declared before any change",
                        raw_tag.line, raw_tag.name
                    ))
                })?;
                if tag_positions.contains_key(&raw_tag.name) {
                    return Err(Error::Validation(format!(
                        "line {}: tag \"@{}\" already exists",
                        raw_tag.line, raw_tag.name
                    )));
                }

                let change = &mut changes[tagged];
                change.tags.push(raw_tag.name.clone());
                let planner = raw_tag.planner.to_string();
                let date = super::utc_date(&raw_tag.timestamp);
                let id = TagInfo {
                    project: &project,
                    name: &raw_tag.name,
                    change_id: &change.id,
                    planner: &planner,
                    date: &date,
                    note: raw_tag.note.as_deref(),
                }
                .id();

                tag_positions.insert(raw_tag.name.clone(), tagged);
                layout.push(Line::Tag(tags.len()));
                tags.push(Tag {
                    name: raw_tag.name,
                    change: change.name.clone(),
                    change_id: change.id.clone(),
                    timestamp: raw_tag.timestamp,
                    planner: raw_tag.planner,
                    note: raw_tag.note,
                    id,
                });
            }
            RawLine::Change(raw_change) => {
                let position = changes.len();

                if let Some(previous) = instances.get(&raw_change.name).and_then(|v| v.last()) {
                    if tags_before[*previous] == tags.len() {
                        return Err(Error::Validation(format!(
                            "line {}: change \"{}\" already exists; tag the plan and rework it instead",
                            raw_change.line, raw_change.name
                        )));
                    }
                }

                let node = graph.add_node(raw_change.name.clone());
                let mut seen = HashSet::new();
                for dep in &raw_change.dependencies {
                    if !seen.insert(dep.reference()) {
                        return Err(Error::Validation(format!(
                            "line {}: change \"{}\" lists \"{}\" more than once",
                            raw_change.line,
                            raw_change.name,
                            dep.reference()
                        )));
                    }
                    let target = resolve_reference(dep, &instances, &tag_positions).ok_or_else(|| {
                        Error::Validation(format!(
                            "line {}: change \"{}\" references unknown change \"{}\"",
                            raw_change.line,
                            raw_change.name,
                            dep.reference()
                        ))
                    })?;
                    if !dep.conflicts {
                        graph.add_edge(node, target);
                    }
                }

                let requires: Vec<String> = raw_change
                    .dependencies
                    .iter()
                    .filter(|d| !d.conflicts)
                    .map(Dependency::reference)
                    .collect();
                let conflicts: Vec<String> = raw_change
                    .dependencies
                    .iter()
                    .filter(|d| d.conflicts)
                    .map(Dependency::reference)
                    .collect();
                let planner = raw_change.planner.to_string();
                let date = super::utc_date(&raw_change.timestamp);
                let id = ChangeInfo {
                    project: &project,
                    name: &raw_change.name,
                    planner: &planner,
                    date: &date,
                    requires: &requires,
                    conflicts: &conflicts,
                    note: raw_change.note.as_deref(),
                }
                .id();

                if positions.insert(id.clone(), position).is_some() {
                    return Err(Error::Validation(format!(
                        "line {}: change \"{}\" duplicates an earlier entry",
                        raw_change.line, raw_change.name
                    )));
                }

                // The superseded instance's scripts move to name@<latest tag since it>
                if let Some(previous) = instances.get(&raw_change.name).and_then(|v| v.last()) {
                    let rework_tag = last_tag_after(&changes, *previous);
                    changes[*previous].rework_tag = rework_tag;
                }

                instances
                    .entry(raw_change.name.clone())
                    .or_default()
                    .push(position);
                tags_before.push(tags.len());
                layout.push(Line::Change(position));
                changes.push(Change {
                    name: raw_change.name,
                    dependencies: raw_change.dependencies,
                    timestamp: raw_change.timestamp,
                    planner: raw_change.planner,
                    note: raw_change.note,
                    id,
                    tags: Vec::new(),
                    rework_tag: None,
                });
            }
        }
    }

    graph.check_acyclic()?;

    Ok(Plan {
        pragmas,
        changes,
        tags,
        layout,
        positions,
        checksum,
    })
}

/// First tag declared at or after the change at `position`.
/// Most recent tag on or after `position`.
pub(super) fn last_tag_after(changes: &[Change], position: usize) -> Option<String> {
    changes[position..]
        .iter()
        .rev()
        .find_map(|c| c.tags.last().cloned())
}

/// Position of the change a dependency refers to, among entries seen so far.
fn resolve_reference(
    dep: &Dependency,
    instances: &HashMap<String, Vec<usize>>,
    tag_positions: &HashMap<String, usize>,
) -> Option<usize> {
    let candidates = instances.get(&dep.change)?;
    match &dep.tag {
        Some(tag) => {
            let tagged = *tag_positions.get(tag)?;
            candidates.iter().rev().find(|p| **p <= tagged).copied()
        }
        None => candidates.last().copied(),
    }
}
