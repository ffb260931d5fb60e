//! Deployment orchestrator
//!
//! An [`Engine`] pairs a parsed plan with the registry of one target and
//! reconciles the two. Each change is applied on the single pooled
//! connection, so the script and the registry rows it produces commit or
//! roll back together.
//!
//! Scripts that manage their own transaction run bare; their registry rows
//! are written in a follow-up transaction.

mod deploy;
mod revert;
mod status;
mod verify;

pub use deploy::{DeployMode, DeployOptions, DeployReport};
pub use revert::{RevertOptions, RevertOutcome};
pub use status::Status;
pub use verify::{ChangeResult, VerifyReport};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::plan::{Change, Plan, Tag};
use crate::registry::{EventFilter, EventIter, Registry};
use crate::script::{Script, ScriptKind};
use crate::target::Target;
use diesel::connection::{Connection, SimpleConnection};
use diesel::sqlite::SqliteConnection;
use tracing::{debug, warn};

/// Per-change progress callbacks, used by the CLI to print `+ name .. ok`.
pub trait Progress {
    fn start(&mut self, _kind: ScriptKind, _change: &Change) {}
    fn finish(&mut self, _ok: bool) {}
}

/// Progress sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiet;

impl Progress for Quiet {}

pub struct Engine {
    plan: Plan,
    target: Target,
    registry: Registry,
    committer: Identity,
}

impl Engine {
    /// Open the target and make sure its registry knows the plan's project.
    pub fn open(plan: Plan, target: Target, committer: Identity) -> Result<Self> {
        let registry = Registry::open(&target, plan.project())?;
        registry.initialize(plan.uri(), &committer)?;
        Ok(Self {
            plan,
            target,
            registry,
            committer,
        })
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn committer(&self) -> &Identity {
        &self.committer
    }

    /// Events for this project, newest first.
    pub fn log(&self, mut filter: EventFilter) -> Result<EventIter> {
        if filter.project.is_none() {
            filter.project = Some(self.plan.project().to_string());
        }
        self.registry.query_events(filter)
    }

    fn load_script(&self, change: &Change, kind: ScriptKind) -> Result<Script> {
        Script::load(&self.target.script_path(change, kind))
    }

    fn tags_of(&self, change: &Change) -> Vec<&Tag> {
        self.plan.tags_of(&change.id).collect()
    }

    /// Run a script, then `record`, as one unit. Wrapped scripts share a
    /// transaction with `record`; self-managed scripts commit on their own
    /// and `record` gets a transaction of its own.
    fn apply<F>(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        kind: ScriptKind,
        script: &Script,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<()>,
    {
        if script.is_self_managed() {
            execute(conn, change, kind, script).inspect_err(|_| rollback_quietly(conn))?;
            conn.transaction(record)
        } else {
            conn.transaction(|conn| {
                execute(conn, change, kind, script)?;
                record(conn)
            })
        }
    }

    /// Append a `fail` event in a transaction of its own. Failing to record
    /// is logged; the caller already has an error to report.
    fn record_failure(&self, conn: &mut SqliteConnection, change: &Change, err: &Error) {
        let tags = self.tags_of(change);
        let reason = err.to_string();
        let recorded = conn.transaction(|conn| {
            self.registry
                .record_fail(conn, change, &tags, &self.committer, &reason)
        });
        if let Err(e) = recorded {
            warn!(change = %change.name, error = %e, "could not record failure");
        }
    }

    /// Run the revert script of a deployed change and delete its rows.
    fn revert_change(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        progress.start(ScriptKind::Revert, change);
        let script = match self.load_script(change, ScriptKind::Revert) {
            Ok(script) => script,
            Err(e) => {
                progress.finish(false);
                return Err(e);
            }
        };
        let tags = self.tags_of(change);
        let result = self.apply(conn, change, ScriptKind::Revert, &script, |conn| {
            self.registry
                .record_revert(conn, change, &tags, &self.committer)
        });
        progress.finish(result.is_ok());
        if let Err(err) = &result {
            self.record_failure(conn, change, err);
        }
        result
    }
}

/// Execute a script's whole body.
fn execute(
    conn: &mut SqliteConnection,
    change: &Change,
    kind: ScriptKind,
    script: &Script,
) -> Result<()> {
    debug!(
        change = %change.format_name(),
        script = %script.path.display(),
        self_managed = script.is_self_managed(),
        "running {} script",
        kind
    );
    conn.batch_execute(&script.content)
        .map_err(|source| Error::ScriptExecution {
            change: change.format_name(),
            kind: kind.dir(),
            script: script.path.clone(),
            source,
        })
}

/// Abort whatever a self-managed script left open. SQLite reports an error
/// when no transaction is active, which is fine here.
fn rollback_quietly(conn: &mut SqliteConnection) {
    if let Err(e) = conn.batch_execute("ROLLBACK") {
        debug!(error = %e, "no transaction to roll back");
    }
}
