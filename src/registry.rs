//! Registry store with Diesel ORM
//!
//! The registry records what is deployed to a target: one row per deployed
//! change, its dependencies and tags, and an append-only event log. It lives
//! in a separate SQLite file attached to the target connection as `sqitch`,
//! so a script and the registry rows it produces commit in one transaction.
//!
//! Mutating methods take the caller's connection so they join whatever
//! transaction the engine has open.

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::plan::{utc_date, Change, Tag};
use crate::schema::*;
use crate::target::Target;
use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Registry layout version written to `releases`.
pub const REGISTRY_VERSION: &str = "1.1";

/// Rows fetched per round trip by [`EventIter`].
pub const EVENT_PAGE_SIZE: i64 = 50;

/// Columns every registry table must have.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("releases", &["version", "installed_at", "installer_name", "installer_email"]),
    ("projects", &["project", "uri", "created_at", "creator_name", "creator_email"]),
    (
        "changes",
        &[
            "change_id", "script_hash", "change", "project", "note", "committed_at",
            "committer_name", "committer_email", "planned_at", "planner_name", "planner_email",
        ],
    ),
    ("dependencies", &["change_id", "type", "dependency", "dependency_id"]),
    (
        "events",
        &[
            "event", "change_id", "change", "project", "note", "requires", "conflicts", "tags",
            "committed_at", "committer_name", "committer_email", "planned_at", "planner_name",
            "planner_email",
        ],
    ),
    (
        "tags",
        &[
            "tag_id", "tag", "project", "change_id", "note", "committed_at", "committer_name",
            "committer_email", "planned_at", "planner_name", "planner_email",
        ],
    ),
];

const REGISTRY_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS sqitch.releases (
        version         TEXT NOT NULL PRIMARY KEY,
        installed_at    TEXT NOT NULL,
        installer_name  TEXT NOT NULL,
        installer_email TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sqitch.projects (
        project         TEXT NOT NULL PRIMARY KEY,
        uri             TEXT NULL UNIQUE,
        created_at      TEXT NOT NULL,
        creator_name    TEXT NOT NULL,
        creator_email   TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sqitch.changes (
        change_id       TEXT NOT NULL PRIMARY KEY,
        script_hash     TEXT NULL,
        change          TEXT NOT NULL,
        project         TEXT NOT NULL REFERENCES projects(project) ON UPDATE CASCADE,
        note            TEXT NOT NULL DEFAULT '',
        committed_at    TEXT NOT NULL,
        committer_name  TEXT NOT NULL,
        committer_email TEXT NOT NULL,
        planned_at      TEXT NOT NULL,
        planner_name    TEXT NOT NULL,
        planner_email   TEXT NOT NULL,
        UNIQUE(project, script_hash)
    );

    CREATE TABLE IF NOT EXISTS sqitch.tags (
        tag_id          TEXT NOT NULL PRIMARY KEY,
        tag             TEXT NOT NULL,
        project         TEXT NOT NULL REFERENCES projects(project) ON UPDATE CASCADE,
        change_id       TEXT NOT NULL REFERENCES changes(change_id) ON UPDATE CASCADE,
        note            TEXT NOT NULL DEFAULT '',
        committed_at    TEXT NOT NULL,
        committer_name  TEXT NOT NULL,
        committer_email TEXT NOT NULL,
        planned_at      TEXT NOT NULL,
        planner_name    TEXT NOT NULL,
        planner_email   TEXT NOT NULL,
        UNIQUE(project, tag)
    );

    CREATE TABLE IF NOT EXISTS sqitch.dependencies (
        change_id       TEXT NOT NULL REFERENCES changes(change_id) ON UPDATE CASCADE ON DELETE CASCADE,
        type            TEXT NOT NULL,
        dependency      TEXT NOT NULL,
        dependency_id   TEXT NULL REFERENCES changes(change_id) ON UPDATE CASCADE,
        CONSTRAINT dependencies_check CHECK (
            (type = 'require' AND dependency_id IS NOT NULL)
            OR (type = 'conflict' AND dependency_id IS NULL)
        ),
        PRIMARY KEY (change_id, dependency)
    );

    CREATE TABLE IF NOT EXISTS sqitch.events (
        event           TEXT NOT NULL CHECK (event IN ('deploy', 'revert', 'fail', 'merge')),
        change_id       TEXT NOT NULL,
        change          TEXT NOT NULL,
        project         TEXT NOT NULL REFERENCES projects(project) ON UPDATE CASCADE,
        note            TEXT NOT NULL DEFAULT '',
        requires        TEXT NOT NULL DEFAULT '',
        conflicts       TEXT NOT NULL DEFAULT '',
        tags            TEXT NOT NULL DEFAULT '',
        committed_at    TEXT NOT NULL,
        committer_name  TEXT NOT NULL,
        committer_email TEXT NOT NULL,
        planned_at      TEXT NOT NULL,
        planner_name    TEXT NOT NULL,
        planner_email   TEXT NOT NULL,
        PRIMARY KEY (change_id, committed_at)
    );

    CREATE INDEX IF NOT EXISTS sqitch.idx_events_committed_at ON events(committed_at);
    CREATE INDEX IF NOT EXISTS sqitch.idx_dependencies_dependency_id ON dependencies(dependency_id);
"#;

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = releases)]
struct NewRelease<'a> {
    version: &'a str,
    installed_at: &'a str,
    installer_name: &'a str,
    installer_email: &'a str,
}

#[derive(Insertable)]
#[diesel(table_name = projects)]
struct NewProject<'a> {
    project: &'a str,
    uri: Option<&'a str>,
    created_at: &'a str,
    creator_name: &'a str,
    creator_email: &'a str,
}

/// Queryable project row
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub project: String,
    pub uri: Option<String>,
    pub created_at: String,
    pub creator_name: String,
    pub creator_email: String,
}

#[derive(Insertable)]
#[diesel(table_name = changes)]
struct NewChange<'a> {
    change_id: &'a str,
    script_hash: Option<&'a str>,
    change: &'a str,
    project: &'a str,
    note: &'a str,
    committed_at: &'a str,
    committer_name: &'a str,
    committer_email: &'a str,
    planned_at: &'a str,
    planner_name: &'a str,
    planner_email: &'a str,
}

/// A change currently applied to the target
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[diesel(table_name = changes)]
pub struct DeployedChange {
    pub change_id: String,
    pub script_hash: Option<String>,
    pub change: String,
    pub project: String,
    pub note: String,
    pub committed_at: String,
    pub committer_name: String,
    pub committer_email: String,
    pub planned_at: String,
    pub planner_name: String,
    pub planner_email: String,
}

#[derive(Insertable)]
#[diesel(table_name = dependencies)]
struct NewDependency<'a> {
    change_id: &'a str,
    dependency_type: &'a str,
    dependency: &'a str,
    dependency_id: Option<&'a str>,
}

/// A recorded dependency of a deployed change
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[diesel(table_name = dependencies)]
pub struct DependencyRow {
    pub change_id: String,
    pub dependency_type: String,
    pub dependency: String,
    pub dependency_id: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = events)]
struct NewEvent<'a> {
    event: &'a str,
    change_id: &'a str,
    change: &'a str,
    project: &'a str,
    note: &'a str,
    requires: &'a str,
    conflicts: &'a str,
    tags: &'a str,
    committed_at: &'a str,
    committer_name: &'a str,
    committer_email: &'a str,
    planned_at: &'a str,
    planner_name: &'a str,
    planner_email: &'a str,
}

/// An audit log row
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[diesel(table_name = events)]
pub struct Event {
    pub event: String,
    pub change_id: String,
    pub change: String,
    pub project: String,
    pub note: String,
    pub requires: String,
    pub conflicts: String,
    pub tags: String,
    pub committed_at: String,
    pub committer_name: String,
    pub committer_email: String,
    pub planned_at: String,
    pub planner_name: String,
    pub planner_email: String,
}

impl Event {
    pub fn kind(&self) -> Option<EventKind> {
        self.event.parse().ok()
    }
}

#[derive(Insertable)]
#[diesel(table_name = tags)]
struct NewTag<'a> {
    tag_id: &'a str,
    tag: &'a str,
    project: &'a str,
    change_id: &'a str,
    note: &'a str,
    committed_at: &'a str,
    committer_name: &'a str,
    committer_email: &'a str,
    planned_at: &'a str,
    planner_name: &'a str,
    planner_email: &'a str,
}

/// A tag recorded against a deployed change
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[diesel(table_name = tags)]
pub struct DeployedTag {
    pub tag_id: String,
    pub tag: String,
    pub project: String,
    pub change_id: String,
    pub note: String,
    pub committed_at: String,
    pub committer_name: String,
    pub committer_email: String,
    pub planned_at: String,
    pub planner_name: String,
    pub planner_email: String,
}

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

/// Helper for PRAGMA table_info queries
#[derive(QueryableByName, Debug)]
struct PragmaTableInfo {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

// ============================================================================
// Events
// ============================================================================

/// Kinds of audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Deploy,
    Revert,
    Fail,
    Merge,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deploy => "deploy",
            EventKind::Revert => "revert",
            EventKind::Fail => "fail",
            EventKind::Merge => "merge",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deploy" => Ok(EventKind::Deploy),
            "revert" => Ok(EventKind::Revert),
            "fail" => Ok(EventKind::Fail),
            "merge" => Ok(EventKind::Merge),
            other => Err(Error::Validation(format!("unknown event kind \"{}\"", other))),
        }
    }
}

/// Filters for [`Registry::query_events`]. Empty filters match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Exact change name
    pub change: Option<String>,
    pub change_pattern: Option<Regex>,
    pub committer_pattern: Option<Regex>,
    pub events: Vec<EventKind>,
    pub project: Option<String>,
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Checks that cannot be pushed into SQL.
    fn matches(&self, event: &Event) -> bool {
        self.change_pattern
            .as_ref()
            .map_or(true, |re| re.is_match(&event.change))
            && self
                .committer_pattern
                .as_ref()
                .map_or(true, |re| re.is_match(&event.committer_name))
    }
}

/// Lazy, newest-first event sequence. Owns its connection and fetches
/// [`EVENT_PAGE_SIZE`] rows at a time.
pub struct EventIter {
    conn: DbConn,
    filter: EventFilter,
    buffer: VecDeque<Event>,
    offset: i64,
    yielded: usize,
    exhausted: bool,
}

impl EventIter {
    fn new(conn: DbConn, filter: EventFilter) -> Self {
        Self {
            conn,
            filter,
            buffer: VecDeque::new(),
            offset: 0,
            yielded: 0,
            exhausted: false,
        }
    }

    fn fetch_page(&mut self) -> Result<()> {
        let mut query = events::table.into_boxed();
        if let Some(change) = &self.filter.change {
            query = query.filter(events::change.eq(change.clone()));
        }
        if let Some(project) = &self.filter.project {
            query = query.filter(events::project.eq(project.clone()));
        }
        if !self.filter.events.is_empty() {
            let kinds: Vec<String> = self
                .filter
                .events
                .iter()
                .map(|k| k.as_str().to_string())
                .collect();
            query = query.filter(events::event.eq_any(kinds));
        }

        let page: Vec<Event> = query
            .order((events::committed_at.desc(), events::change_id.desc()))
            .limit(EVENT_PAGE_SIZE)
            .offset(self.offset)
            .load(&mut *self.conn)?;

        debug!(offset = self.offset, rows = page.len(), "fetched event page");
        self.offset += page.len() as i64;
        if (page.len() as i64) < EVENT_PAGE_SIZE {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EventIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.filter.limit.is_some_and(|max| self.yielded >= max) {
                return None;
            }
            if let Some(event) = self.buffer.pop_front() {
                if self.filter.matches(&event) {
                    self.yielded += 1;
                    return Some(Ok(event));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

// ============================================================================
// Registry Connection
// ============================================================================

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Attaches the registry file to every pooled connection.
#[derive(Debug)]
struct AttachRegistry {
    registry: String,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for AttachRegistry {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = 5000; ATTACH DATABASE '{}' AS sqitch; PRAGMA foreign_keys = ON;",
            self.registry.replace('\'', "''")
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// A dependency of a change about to be deployed, resolved against the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub conflicts: bool,
    /// Reference as written in the plan, e.g. `users@v1.0`.
    pub reference: String,
    /// Deployed change satisfying a requirement; `None` for conflicts.
    pub dependency_id: Option<String>,
}

/// Registry handle for one project on one target.
pub struct Registry {
    pool: DbPool,
    project: String,
    /// Last committed timestamp handed out
    clock: Mutex<Option<DateTime<Utc>>>,
}

impl Registry {
    /// Open the target database with the registry attached. Call
    /// [`Registry::initialize`] before reading or writing rows.
    pub fn open(target: &Target, project: &str) -> Result<Self> {
        for path in [&target.database, &target.registry] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
        }

        let manager =
            ConnectionManager::<SqliteConnection>::new(target.database.to_string_lossy());
        let pool = Pool::builder()
            .max_size(2)
            .connection_customizer(Box::new(AttachRegistry {
                registry: target.registry.to_string_lossy().to_string(),
            }))
            .build(manager)
            .map_err(|e| Error::Connection(e.to_string()))?;

        debug!(
            database = %target.database.display(),
            registry = %target.registry.display(),
            "opened target"
        );
        Ok(Self {
            pool,
            project: project.to_string(),
            clock: Mutex::new(None),
        })
    }

    /// Check out the connection shared by the script and the registry.
    pub fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Connection(e.to_string()))
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Create the registry tables and the project row if absent. Safe to
    /// call on every run.
    pub fn initialize(&self, uri: Option<&str>, creator: &Identity) -> Result<()> {
        let mut conn = self.conn()?;
        conn.transaction::<_, Error, _>(|conn| {
            conn.batch_execute(REGISTRY_DDL)?;
            check_shape(conn)?;
            self.ensure_release(conn, creator)?;
            self.ensure_project(conn, uri, creator)?;
            self.seed_clock(conn)
        })
    }

    fn ensure_release(&self, conn: &mut SqliteConnection, installer: &Identity) -> Result<()> {
        let versions: Vec<String> = releases::table.select(releases::version).load(conn)?;
        let supported = parse_version(REGISTRY_VERSION)?;
        for version in &versions {
            if parse_version(version)? > supported {
                return Err(Error::RegistryCorruption(format!(
                    "registry version {} is newer than supported version {}",
                    version, REGISTRY_VERSION
                )));
            }
        }
        if versions.is_empty() {
            let now = self.now();
            diesel::insert_into(releases::table)
                .values(&NewRelease {
                    version: REGISTRY_VERSION,
                    installed_at: &now,
                    installer_name: &installer.name,
                    installer_email: &installer.email,
                })
                .execute(conn)?;
            info!(version = REGISTRY_VERSION, "initialized registry");
        }
        Ok(())
    }

    fn ensure_project(
        &self,
        conn: &mut SqliteConnection,
        uri: Option<&str>,
        creator: &Identity,
    ) -> Result<()> {
        let existing = projects::table
            .find(&self.project)
            .select(Project::as_select())
            .first(conn)
            .optional()?;

        match existing {
            Some(project) => {
                if let (Some(stored), Some(wanted)) = (project.uri.as_deref(), uri) {
                    if stored != wanted {
                        return Err(Error::Validation(format!(
                            "project \"{}\" is registered with URI {}, but the plan declares {}",
                            self.project, stored, wanted
                        )));
                    }
                }
            }
            None => {
                let now = self.now();
                diesel::insert_into(projects::table)
                    .values(&NewProject {
                        project: &self.project,
                        uri,
                        created_at: &now,
                        creator_name: &creator.name,
                        creator_email: &creator.email,
                    })
                    .execute(conn)?;
                info!(project = %self.project, "registered project");
            }
        }
        Ok(())
    }

    /// Start the clock after the newest recorded event.
    fn seed_clock(&self, conn: &mut SqliteConnection) -> Result<()> {
        let latest: Option<String> = events::table
            .select(diesel::dsl::max(events::committed_at))
            .first(conn)?;
        if let Some(latest) = latest.and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok()) {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            let latest = latest.with_timezone(&Utc);
            if clock.map_or(true, |c| c < latest) {
                *clock = Some(latest);
            }
        }
        Ok(())
    }

    /// Current UTC time with microseconds, strictly after every earlier
    /// value from this handle.
    fn now(&self) -> String {
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = Utc::now().trunc_subsecs(6);
        if let Some(previous) = *clock {
            if now <= previous {
                now = previous + Duration::microseconds(1);
            }
        }
        *clock = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Record a successful deploy: the change row, its dependencies, the
    /// `deploy` event and rows for `tags`.
    pub fn record_deploy(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        script_hash: &str,
        dependencies: &[ResolvedDependency],
        tags: &[&Tag],
        committer: &Identity,
    ) -> Result<()> {
        let committed_at = self.now();
        let planned_at = utc_date(&change.timestamp);

        diesel::insert_into(changes::table)
            .values(&NewChange {
                change_id: &change.id,
                script_hash: Some(script_hash),
                change: &change.name,
                project: &self.project,
                note: change.note_text(),
                committed_at: &committed_at,
                committer_name: &committer.name,
                committer_email: &committer.email,
                planned_at: &planned_at,
                planner_name: change.planner.display_name(),
                planner_email: &change.planner.email,
            })
            .execute(conn)?;

        for dep in dependencies {
            diesel::insert_into(dependencies::table)
                .values(&NewDependency {
                    change_id: &change.id,
                    dependency_type: if dep.conflicts { "conflict" } else { "require" },
                    dependency: &dep.reference,
                    dependency_id: dep.dependency_id.as_deref(),
                })
                .execute(conn)?;
        }

        self.insert_event(conn, EventKind::Deploy, change, tags, &committed_at, committer)?;

        for tag in tags {
            self.record_tag(conn, tag, committer)?;
        }
        debug!(change = %change.name, id = %change.id, "recorded deploy");
        Ok(())
    }

    /// Record a revert: delete the change's rows and append a `revert` event.
    pub fn record_revert(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        tags: &[&Tag],
        committer: &Identity,
    ) -> Result<()> {
        diesel::delete(tags::table.filter(tags::change_id.eq(&change.id))).execute(conn)?;
        diesel::delete(dependencies::table.filter(dependencies::change_id.eq(&change.id)))
            .execute(conn)?;
        let removed = diesel::delete(changes::table.find(&change.id)).execute(conn)?;
        if removed == 0 {
            return Err(Error::UnknownChange(format!(
                "{} is not deployed",
                change.format_name()
            )));
        }

        let committed_at = self.now();
        self.insert_event(conn, EventKind::Revert, change, tags, &committed_at, committer)?;
        debug!(change = %change.name, id = %change.id, "recorded revert");
        Ok(())
    }

    /// Append a `fail` event. The reason goes to the log; the event table
    /// has no column for it.
    pub fn record_fail(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        tags: &[&Tag],
        committer: &Identity,
        reason: &str,
    ) -> Result<()> {
        let committed_at = self.now();
        self.insert_event(conn, EventKind::Fail, change, tags, &committed_at, committer)?;
        warn!(change = %change.name, reason, "recorded failure");
        Ok(())
    }

    /// Record a tag against its (deployed) change. Recording the same tag
    /// twice is a no-op.
    pub fn record_tag(
        &self,
        conn: &mut SqliteConnection,
        tag: &Tag,
        committer: &Identity,
    ) -> Result<()> {
        let committed_at = self.now();
        let planned_at = utc_date(&tag.timestamp);
        let name = tag.format_name();
        diesel::insert_or_ignore_into(tags::table)
            .values(&NewTag {
                tag_id: &tag.id,
                tag: &name,
                project: &self.project,
                change_id: &tag.change_id,
                note: tag.note.as_deref().unwrap_or(""),
                committed_at: &committed_at,
                committer_name: &committer.name,
                committer_email: &committer.email,
                planned_at: &planned_at,
                planner_name: tag.planner.display_name(),
                planner_email: &tag.planner.email,
            })
            .execute(conn)?;
        Ok(())
    }

    fn insert_event(
        &self,
        conn: &mut SqliteConnection,
        kind: EventKind,
        change: &Change,
        tags: &[&Tag],
        committed_at: &str,
        committer: &Identity,
    ) -> Result<()> {
        let requires = join_references(change.requires().map(|d| d.reference()));
        let conflicts = join_references(change.conflicts().map(|d| d.reference()));
        let tag_names = join_references(tags.iter().map(|t| t.format_name()));
        let planned_at = utc_date(&change.timestamp);

        diesel::insert_into(events::table)
            .values(&NewEvent {
                event: kind.as_str(),
                change_id: &change.id,
                change: &change.name,
                project: &self.project,
                note: change.note_text(),
                requires: &requires,
                conflicts: &conflicts,
                tags: &tag_names,
                committed_at,
                committer_name: &committer.name,
                committer_email: &committer.email,
                planned_at: &planned_at,
                planner_name: change.planner.display_name(),
                planner_email: &change.planner.email,
            })
            .execute(conn)?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Deployed changes of this project in deploy order.
    pub fn query_deployed(&self, conn: &mut SqliteConnection) -> Result<Vec<DeployedChange>> {
        let rows = changes::table
            .filter(changes::project.eq(&self.project))
            .order((changes::committed_at.asc(), changes::change_id.asc()))
            .select(DeployedChange::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// Deployed tags of this project in the order they were recorded.
    pub fn deployed_tags(&self, conn: &mut SqliteConnection) -> Result<Vec<DeployedTag>> {
        let rows = tags::table
            .filter(tags::project.eq(&self.project))
            .order((tags::committed_at.asc(), tags::tag_id.asc()))
            .select(DeployedTag::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// Requirement rows pointing at any of `change_ids`.
    pub fn requiring(
        &self,
        conn: &mut SqliteConnection,
        change_ids: &[String],
    ) -> Result<Vec<DependencyRow>> {
        let rows = dependencies::table
            .filter(dependencies::dependency_type.eq("require"))
            .filter(dependencies::dependency_id.eq_any(change_ids.to_vec()))
            .select(DependencyRow::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// Dependency rows recorded for one deployed change.
    pub fn dependencies_of(
        &self,
        conn: &mut SqliteConnection,
        change_id: &str,
    ) -> Result<Vec<DependencyRow>> {
        let rows = dependencies::table
            .filter(dependencies::change_id.eq(change_id))
            .select(DependencyRow::as_select())
            .load(conn)?;
        Ok(rows)
    }

    /// Events matching `filter`, newest first. Each call starts a fresh
    /// sequence on its own connection.
    pub fn query_events(&self, filter: EventFilter) -> Result<EventIter> {
        Ok(EventIter::new(self.conn()?, filter))
    }
}

/// Fail when a registry table lacks a column this version writes.
fn check_shape(conn: &mut SqliteConnection) -> Result<()> {
    for (table, required) in REQUIRED_COLUMNS {
        let columns: Vec<PragmaTableInfo> =
            diesel::sql_query(format!("PRAGMA sqitch.table_info({})", table)).load(conn)?;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !columns.iter().any(|c| c.name == *name))
            .collect();
        if !missing.is_empty() {
            return Err(Error::RegistryCorruption(format!(
                "table sqitch.{} is missing column(s) {}",
                table,
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

fn parse_version(version: &str) -> Result<(u32, u32)> {
    let parsed = version.split_once('.').and_then(|(major, minor)| {
        Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?))
    });
    parsed.ok_or_else(|| {
        Error::RegistryCorruption(format!("unrecognised registry version \"{}\"", version))
    })
}

fn join_references<I: Iterator<Item = String>>(items: I) -> String {
    items.collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use tempfile::TempDir;

    const PLAN: &str = "%project=flipr\n\n\
        users 2025-01-01T00:00:00Z Jane <jane@example.com> # init\n\
        @v1.0 2025-01-01T00:00:01Z Jane <jane@example.com>\n\
        flips [users] 2025-01-02T00:00:00Z Jane <jane@example.com>\n";

    fn committer() -> Identity {
        Identity::new("Bob", "bob@example.com")
    }

    fn setup() -> (TempDir, Registry, Plan) {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().join("flipr.db"), dir.path());
        let registry = Registry::open(&target, "flipr").unwrap();
        registry.initialize(None, &committer()).unwrap();
        (dir, registry, Plan::parse(PLAN).unwrap())
    }

    fn deploy(registry: &Registry, plan: &Plan, name: &str, deps: &[ResolvedDependency]) {
        let change = plan.find(name).unwrap();
        let tags: Vec<&Tag> = plan.tags_of(&change.id).collect();
        let mut conn = registry.conn().unwrap();
        registry
            .record_deploy(&mut conn, change, &format!("hash-{}", name), deps, &tags, &committer())
            .unwrap();
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (_dir, registry, _plan) = setup();
        registry.initialize(None, &committer()).unwrap();

        let mut conn = registry.conn().unwrap();
        let versions: Vec<String> = releases::table
            .select(releases::version)
            .load(&mut conn)
            .unwrap();
        assert_eq!(versions, vec![REGISTRY_VERSION.to_string()]);
        let count: i64 = projects::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_project_uri_mismatch() {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().join("flipr.db"), dir.path());
        let registry = Registry::open(&target, "flipr").unwrap();
        registry
            .initialize(Some("https://example.com/flipr"), &committer())
            .unwrap();
        let err = registry
            .initialize(Some("https://example.com/other"), &committer())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_newer_registry_is_corruption() {
        let (_dir, registry, _plan) = setup();
        let mut conn = registry.conn().unwrap();
        conn.batch_execute(
            "INSERT INTO sqitch.releases VALUES ('9.0', '2030-01-01T00:00:00Z', 'x', 'x@x')",
        )
        .unwrap();
        drop(conn);
        let err = registry.initialize(None, &committer()).unwrap_err();
        assert!(matches!(err, Error::RegistryCorruption(_)));
    }

    #[test]
    fn test_missing_column_is_corruption() {
        let dir = TempDir::new().unwrap();
        let target = Target::new(dir.path().join("flipr.db"), dir.path());
        let registry = Registry::open(&target, "flipr").unwrap();
        {
            let mut conn = registry.conn().unwrap();
            conn.batch_execute("CREATE TABLE sqitch.changes (change_id TEXT PRIMARY KEY)")
                .unwrap();
        }
        let err = registry.initialize(None, &committer()).unwrap_err();
        assert!(err.to_string().contains("sqitch.changes"));
    }

    #[test]
    fn test_record_deploy_and_revert() {
        let (_dir, registry, plan) = setup();
        let users_id = plan.find("users").unwrap().id.clone();
        deploy(&registry, &plan, "users", &[]);
        deploy(
            &registry,
            &plan,
            "flips",
            &[ResolvedDependency {
                conflicts: false,
                reference: "users".to_string(),
                dependency_id: Some(users_id.clone()),
            }],
        );

        let mut conn = registry.conn().unwrap();
        let deployed = registry.query_deployed(&mut conn).unwrap();
        let names: Vec<&str> = deployed.iter().map(|c| c.change.as_str()).collect();
        assert_eq!(names, vec!["users", "flips"]);
        assert_eq!(deployed[0].note, "init");
        assert_eq!(deployed[0].planned_at, "2025-01-01T00:00:00Z");
        assert_eq!(deployed[0].committer_name, "Bob");
        assert!(deployed[0].committed_at < deployed[1].committed_at);

        let tags = registry.deployed_tags(&mut conn).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].tag, "@v1.0");
        assert_eq!(tags[0].change_id, users_id);

        let dependents = registry.requiring(&mut conn, &[users_id.clone()]).unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].dependency, "users");

        let flips = plan.find("flips").unwrap();
        registry.record_revert(&mut conn, flips, &[], &committer()).unwrap();
        assert!(registry.requiring(&mut conn, &[users_id]).unwrap().is_empty());
        assert_eq!(registry.query_deployed(&mut conn).unwrap().len(), 1);

        let err = registry
            .record_revert(&mut conn, flips, &[], &committer())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownChange(_)));
    }

    #[test]
    fn test_dependency_check_constraint() {
        let (_dir, registry, plan) = setup();
        deploy(&registry, &plan, "users", &[]);
        let flips = plan.find("flips").unwrap();
        let mut conn = registry.conn().unwrap();
        let result = conn.transaction::<_, Error, _>(|conn| {
            registry.record_deploy(
                conn,
                flips,
                "hash-flips",
                &[ResolvedDependency {
                    conflicts: false,
                    reference: "users".to_string(),
                    dependency_id: None,
                }],
                &[],
                &committer(),
            )
        });
        assert!(matches!(result, Err(Error::Registry(_))));
        assert_eq!(registry.query_deployed(&mut conn).unwrap().len(), 1);
    }

    #[test]
    fn test_events_newest_first_with_filters() {
        let (_dir, registry, plan) = setup();
        deploy(&registry, &plan, "users", &[]);
        {
            let mut conn = registry.conn().unwrap();
            let users = plan.find("users").unwrap();
            registry
                .record_fail(&mut conn, users, &[], &committer(), "boom")
                .unwrap();
        }

        let all: Vec<Event> = registry
            .query_events(EventFilter::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let kinds: Vec<&str> = all.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(kinds, vec!["fail", "deploy"]);
        assert_eq!(all[1].tags, "@v1.0");
        assert_eq!(all[0].kind(), Some(EventKind::Fail));

        let deploys: Vec<Event> = registry
            .query_events(EventFilter {
                events: vec![EventKind::Deploy],
                ..EventFilter::default()
            })
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(deploys.len(), 1);

        let none = registry
            .query_events(EventFilter {
                committer_pattern: Some(Regex::new("^Alice").unwrap()),
                ..EventFilter::default()
            })
            .unwrap()
            .count();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_events_page_lazily() {
        let (_dir, registry, plan) = setup();
        let users = plan.find("users").unwrap();
        {
            let mut conn = registry.conn().unwrap();
            for i in 0..(EVENT_PAGE_SIZE + 7) {
                registry
                    .record_fail(&mut conn, users, &[], &committer(), &i.to_string())
                    .unwrap();
            }
        }

        let events: Vec<Event> = registry
            .query_events(EventFilter::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(events.len() as i64, EVENT_PAGE_SIZE + 7);
        assert!(events.windows(2).all(|w| w[0].committed_at > w[1].committed_at));

        let limited = registry
            .query_events(EventFilter {
                limit: Some(3),
                ..EventFilter::default()
            })
            .unwrap()
            .count();
        assert_eq!(limited, 3);
    }

    #[test]
    fn test_clock_is_strictly_monotonic() {
        let (_dir, registry, _plan) = setup();
        let stamps: Vec<String> = (0..100).map(|_| registry.now()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert!(stamps[0].ends_with('Z'));
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("revert".parse::<EventKind>().unwrap(), EventKind::Revert);
        assert!("nope".parse::<EventKind>().is_err());
    }
}
