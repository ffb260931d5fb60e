//! The plan: an ordered ledger of changes and tags
//!
//! A plan file is a header of `%key=value` pragmas, a blank line, and one
//! entry per line:
//!
//! ```text
//! %syntax-version=1.0.0
//! %project=flipr
//!
//! users 2025-01-01T00:00:00Z Jane <jane@example.com> # init
//! flips [users] 2025-01-02T00:00:00Z Jane <jane@example.com>
//! @v1.0 2025-01-03T00:00:00Z Jane <jane@example.com> # first release
//! ```
//!
//! Parsed plans are immutable. The helpers in [`edit`] return a new plan
//! built from the old plan's text plus the new line, so every mutation goes
//! through the same validation as a file read from disk.

pub mod edit;
mod graph;
mod parse;
mod write;

pub use graph::DependencyGraph;
pub use write::{format_timestamp, utc_date};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::script::ScriptKind;
use chrono::{DateTime, FixedOffset};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Syntax version written by `Plan::init`.
pub const SYNTAX_VERSION: &str = "1.0.0";

/// File extension of change scripts.
pub const SCRIPT_EXTENSION: &str = "sql";

/// A `%key=value` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pragma {
    pub key: String,
    pub value: String,
}

/// Who planned a change or tag: `Name <email>` or a bare email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planner {
    pub name: Option<String>,
    pub email: String,
}

impl Planner {
    /// Name recorded in registry rows; empty for a bare-email planner.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

impl From<&Identity> for Planner {
    fn from(identity: &Identity) -> Self {
        Self {
            name: Some(identity.name.clone()),
            email: identity.email.clone(),
        }
    }
}

impl fmt::Display for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

/// One bracketed dependency of a change: `name`, `name@tag` or `!name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub conflicts: bool,
    pub change: String,
    pub tag: Option<String>,
}

impl Dependency {
    pub fn requires(reference: &str) -> Option<Self> {
        Self::parse(reference).filter(|d| !d.conflicts)
    }

    pub fn conflicts_with(reference: &str) -> Option<Self> {
        Self::parse(&format!("!{}", reference.trim_start_matches('!')))
    }

    /// Parse one token from a dependency list.
    pub fn parse(token: &str) -> Option<Self> {
        let (conflicts, rest) = match token.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let (change, tag) = match rest.split_once('@') {
            Some((change, tag)) => (change, Some(tag)),
            None => (rest, None),
        };
        if !parse::is_change_name(change) || tag.is_some_and(|t| !parse::is_tag_name(t)) {
            return None;
        }
        Some(Self {
            conflicts,
            change: change.to_string(),
            tag: tag.map(str::to_string),
        })
    }

    /// The reference without the conflict marker, e.g. `users@v1.0`.
    pub fn reference(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}@{}", self.change, tag),
            None => self.change.clone(),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflicts {
            f.write_str("!")?;
        }
        f.write_str(&self.reference())
    }
}

/// A planned change. Everything after `note` is derived while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub name: String,
    /// Requires and conflicts in their original order.
    pub dependencies: Vec<Dependency>,
    pub timestamp: DateTime<FixedOffset>,
    pub planner: Planner,
    pub note: Option<String>,
    /// Content-addressable identifier.
    pub id: String,
    /// Tags declared directly after this change.
    pub tags: Vec<String>,
    /// For an instance superseded by a later rework: the first tag after it.
    pub rework_tag: Option<String>,
}

impl Change {
    pub fn requires(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.conflicts)
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.conflicts)
    }

    /// Relative script path, e.g. `deploy/users.sql` or `deploy/users@v1.0.sql`.
    pub fn script_path(&self, kind: ScriptKind) -> PathBuf {
        let stem = match &self.rework_tag {
            Some(tag) => format!("{}@{}", self.name, tag),
            None => self.name.clone(),
        };
        Path::new(kind.dir()).join(format!("{}.{}", stem, SCRIPT_EXTENSION))
    }

    pub fn scripts(&self) -> BTreeMap<ScriptKind, PathBuf> {
        ScriptKind::ALL
            .iter()
            .map(|kind| (*kind, self.script_path(*kind)))
            .collect()
    }

    /// `name` or `name@tag` for a superseded instance.
    pub fn format_name(&self) -> String {
        match &self.rework_tag {
            Some(tag) => format!("{}@{}", self.name, tag),
            None => self.name.clone(),
        }
    }

    pub fn note_text(&self) -> &str {
        self.note.as_deref().unwrap_or("")
    }
}

/// A named marker bound to the change before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    /// Name of the tagged change.
    pub change: String,
    pub change_id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub planner: Planner,
    pub note: Option<String>,
    pub id: String,
}

impl Tag {
    pub fn format_name(&self) -> String {
        format!("@{}", self.name)
    }
}

/// A semantic plan entry in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<'a> {
    Change(&'a Change),
    Tag(&'a Tag),
}

/// Physical line of the entry section.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Change(usize),
    Tag(usize),
    Blank,
    Comment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pragmas: Vec<Pragma>,
    changes: Vec<Change>,
    tags: Vec<Tag>,
    layout: Vec<Line>,
    positions: HashMap<String, usize>,
    checksum: String,
}

impl Plan {
    /// Parse plan text.
    pub fn parse(text: &str) -> Result<Self> {
        parse::parse_plan(text)
    }

    /// Read and parse a plan file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::parse(&text)
    }

    /// A plan with only a header.
    pub fn init(project: &str, uri: Option<&str>) -> Result<Self> {
        let mut text = format!("%syntax-version={}\n%project={}\n", SYNTAX_VERSION, project);
        if let Some(uri) = uri {
            text.push_str(&format!("%uri={}\n", uri));
        }
        text.push('\n');
        Self::parse(&text)
    }

    /// Write the canonical text to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(path, self.to_text()).map_err(|e| Error::io(path, e))
    }

    pub fn pragma(&self, key: &str) -> Option<&str> {
        self.pragmas
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    pub fn pragmas(&self) -> &[Pragma] {
        &self.pragmas
    }

    pub fn project(&self) -> &str {
        // Presence is enforced by the parser
        self.pragma("project").unwrap_or_default()
    }

    pub fn uri(&self) -> Option<&str> {
        self.pragma("uri")
    }

    pub fn syntax_version(&self) -> &str {
        self.pragma("syntax-version").unwrap_or(SYNTAX_VERSION)
    }

    /// Default engine name, if the plan declares one.
    pub fn engine(&self) -> Option<&str> {
        self.pragma("engine")
    }

    /// SHA-256 of the plan text this plan was parsed from.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn entries(&self) -> impl Iterator<Item = Entry<'_>> {
        self.layout.iter().filter_map(move |line| match line {
            Line::Change(i) => Some(Entry::Change(&self.changes[*i])),
            Line::Tag(i) => Some(Entry::Tag(&self.tags[*i])),
            Line::Blank | Line::Comment(_) => None,
        })
    }

    pub fn last_change(&self) -> Option<&Change> {
        self.changes.last()
    }

    /// Position of a change in plan order.
    pub fn position(&self, change_id: &str) -> Option<usize> {
        self.positions.get(change_id).copied()
    }

    pub fn change_by_id(&self, change_id: &str) -> Option<&Change> {
        self.position(change_id).map(|i| &self.changes[i])
    }

    pub fn tag(&self, name: &str) -> Option<&Tag> {
        let name = name.strip_prefix('@').unwrap_or(name);
        self.tags.iter().find(|t| t.name == name)
    }

    /// Latest instance of `name` at or before position `limit`.
    fn latest_instance(&self, name: &str, limit: usize) -> Option<usize> {
        self.changes
            .iter()
            .enumerate()
            .take(limit.saturating_add(1))
            .rev()
            .find(|(_, c)| c.name == name)
            .map(|(i, _)| i)
    }

    /// Find a change by reference: `name`, `@tag`, `name@tag`, `@HEAD`,
    /// `@ROOT` or a change identifier.
    pub fn find(&self, reference: &str) -> Option<&Change> {
        self.find_position(reference).map(|i| &self.changes[i])
    }

    pub fn find_position(&self, reference: &str) -> Option<usize> {
        if self.changes.is_empty() {
            return None;
        }
        let last = self.changes.len() - 1;
        match reference.split_once('@') {
            Some(("", "HEAD")) => Some(last),
            Some(("", "ROOT")) => Some(0),
            Some(("", tag)) => self.tag(tag).and_then(|t| self.position(&t.change_id)),
            Some((name, "HEAD")) => self.latest_instance(name, last),
            Some((name, tag)) => {
                let tagged = self.tag(tag).and_then(|t| self.position(&t.change_id))?;
                self.latest_instance(name, tagged)
            }
            None => self
                .position(reference)
                .or_else(|| self.latest_instance(reference, last)),
        }
    }

    /// The change a dependency of the change at `position` points to.
    pub fn resolve_dependency(&self, position: usize, dependency: &Dependency) -> Option<&Change> {
        let index = match &dependency.tag {
            Some(tag) => {
                let tagged = self.tag(tag).and_then(|t| self.position(&t.change_id))?;
                self.latest_instance(&dependency.change, tagged)
            }
            None => self.latest_instance(&dependency.change, position.checked_sub(1)?),
        }?;
        Some(&self.changes[index])
    }

    /// Changes in plan order up to and including `reference`.
    pub fn changes_through(&self, reference: Option<&str>) -> Result<&[Change]> {
        match reference {
            None => Ok(&self.changes),
            Some(reference) => {
                let end = self
                    .find_position(reference)
                    .ok_or_else(|| Error::UnknownChange(reference.to_string()))?;
                Ok(&self.changes[..=end])
            }
        }
    }

    /// Tags declared after the change with this identifier.
    pub fn tags_of(&self, change_id: &str) -> impl Iterator<Item = &Tag> {
        let change_id = change_id.to_string();
        self.tags.iter().filter(move |t| t.change_id == change_id)
    }
}

/// SHA-256 hex digest of plan text.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "%syntax-version=1.0.0\n\
%project=flipr\n\
%uri=https://github.com/example/flipr/\n\
\n\
appschema 2025-01-01T00:00:00Z Jane <jane@example.com> # App schema\n\
users [appschema] 2025-01-01T01:00:00Z Jane <jane@example.com> # Creates users\n\
@v1.0 2025-01-02T00:00:00Z Jane <jane@example.com> # Release 1.0\n\
\n\
flips [users !oldflips] 2025-01-03T00:00:00Z Jane <jane@example.com>\n";

    fn plan() -> Plan {
        Plan::parse(&PLAN.replace(" !oldflips", "")).unwrap()
    }

    #[test]
    fn test_compute_hash() {
        let hash = compute_hash("test content");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, compute_hash("test content"));
        assert_ne!(hash, compute_hash("different content"));
    }

    #[test]
    fn test_header_accessors() {
        let plan = plan();
        assert_eq!(plan.project(), "flipr");
        assert_eq!(plan.uri(), Some("https://github.com/example/flipr/"));
        assert_eq!(plan.syntax_version(), "1.0.0");
        assert_eq!(plan.engine(), None);
        assert_eq!(plan.checksum().len(), 64);
    }

    #[test]
    fn test_entries_in_order() {
        let plan = plan();
        let names: Vec<String> = plan
            .entries()
            .map(|e| match e {
                Entry::Change(c) => c.name.clone(),
                Entry::Tag(t) => t.format_name(),
            })
            .collect();
        assert_eq!(names, vec!["appschema", "users", "@v1.0", "flips"]);
    }

    #[test]
    fn test_tags_attach_to_preceding_change() {
        let plan = plan();
        let users = plan.find("users").unwrap();
        assert_eq!(users.tags, vec!["v1.0".to_string()]);
        let tag = plan.tag("@v1.0").unwrap();
        assert_eq!(tag.change, "users");
        assert_eq!(tag.change_id, users.id);
        assert_eq!(plan.tags_of(&users.id).count(), 1);
    }

    #[test]
    fn test_find_references() {
        let plan = plan();
        assert_eq!(plan.find("@v1.0").unwrap().name, "users");
        assert_eq!(plan.find("@HEAD").unwrap().name, "flips");
        assert_eq!(plan.find("@ROOT").unwrap().name, "appschema");
        assert_eq!(plan.find("appschema@v1.0").unwrap().name, "appschema");
        let id = plan.find("flips").unwrap().id.clone();
        assert_eq!(plan.find(&id).unwrap().name, "flips");
        assert!(plan.find("flips@v1.0").is_none());
        assert!(plan.find("nope").is_none());
    }

    #[test]
    fn test_changes_through() {
        let plan = plan();
        assert_eq!(plan.changes_through(None).unwrap().len(), 3);
        assert_eq!(plan.changes_through(Some("@v1.0")).unwrap().len(), 2);
        assert!(matches!(
            plan.changes_through(Some("missing")),
            Err(Error::UnknownChange(_))
        ));
    }

    #[test]
    fn test_script_paths() {
        let plan = plan();
        let users = plan.find("users").unwrap();
        assert_eq!(
            users.script_path(ScriptKind::Deploy),
            PathBuf::from("deploy/users.sql")
        );
        assert_eq!(users.scripts().len(), 3);
    }

    #[test]
    fn test_requires_and_conflicts_split() {
        let mut text = PLAN.to_string();
        text = text.replace(
            "flips [users !oldflips]",
            "oldflips 2025-01-02T12:00:00Z Jane <jane@example.com>\nflips [users !oldflips]",
        );
        let plan = Plan::parse(&text).unwrap();
        let flips = plan.find("flips").unwrap();
        let requires: Vec<String> = flips.requires().map(|d| d.reference()).collect();
        let conflicts: Vec<String> = flips.conflicts().map(|d| d.reference()).collect();
        assert_eq!(requires, vec!["users"]);
        assert_eq!(conflicts, vec!["oldflips"]);
    }

    #[test]
    fn test_dependency_parse() {
        let dep = Dependency::parse("!users@v1.0").unwrap();
        assert!(dep.conflicts);
        assert_eq!(dep.change, "users");
        assert_eq!(dep.tag.as_deref(), Some("v1.0"));
        assert_eq!(dep.to_string(), "!users@v1.0");
        assert!(Dependency::parse("bad name").is_none());
        assert!(Dependency::requires("!users").is_none());
        assert!(Dependency::conflicts_with("users").unwrap().conflicts);
    }

    #[test]
    fn test_planner_display() {
        let planner = Planner {
            name: None,
            email: "jane@example.com".to_string(),
        };
        assert_eq!(planner.to_string(), "jane@example.com");
        assert_eq!(planner.display_name(), "");
    }

    #[test]
    fn test_init_plan() {
        let plan = Plan::init("flipr", None).unwrap();
        assert_eq!(plan.project(), "flipr");
        assert!(plan.changes().is_empty());
        assert_eq!(plan.to_text(), "%syntax-version=1.0.0\n%project=flipr\n\n");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sqitch.plan");
        let plan = plan();
        plan.save(&path).unwrap();
        assert_eq!(Plan::load(&path).unwrap(), plan);
    }
}
