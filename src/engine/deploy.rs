//! Deploy: apply pending changes in plan order

use super::verify::{verify_and_discard, verify_change};
use super::{execute, rollback_quietly, Engine, Progress};
use crate::error::{Error, Result};
use crate::plan::Change;
use crate::registry::ResolvedDependency;
use crate::script::{Script, ScriptKind};
use crate::validate::Validator;
use diesel::connection::Connection;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info};

/// What a failed deploy takes back with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Revert every change deployed by this run
    All,
    /// Revert to the last tag reached by this run
    Tag,
    /// Keep what succeeded, stop at the failure
    #[default]
    Change,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::All => "all",
            DeployMode::Tag => "tag",
            DeployMode::Change => "change",
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(DeployMode::All),
            "tag" => Ok(DeployMode::Tag),
            "change" => Ok(DeployMode::Change),
            other => Err(Error::Config(format!(
                "unknown deploy mode \"{}\" (expected all, tag or change)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Stop after this change (`name`, `@tag`, `name@tag` or an id)
    pub to: Option<String>,
    /// Deploy only the `to` change, none of the pending changes before it
    pub only: bool,
    pub mode: DeployMode,
    /// Run each verify script inside the deploy transaction
    pub verify: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    /// Changes deployed by this run, in order
    pub deployed: Vec<String>,
    /// Tags recorded for changes deployed by an earlier run
    pub tags: Vec<String>,
}

impl DeployReport {
    pub fn is_noop(&self) -> bool {
        self.deployed.is_empty() && self.tags.is_empty()
    }
}

/// Scripts needed for one change, loaded before anything runs.
struct Scripts {
    deploy: Script,
    verify: Option<Script>,
}

impl Engine {
    /// Deploy pending changes through `options.to`.
    ///
    /// Every pending change is checked against its dependencies, and its
    /// scripts are loaded, before the first script runs. On a script failure the transaction is rolled
    /// back, a `fail` event is recorded and the changes selected by
    /// `options.mode` are reverted.
    pub fn deploy(&self, options: &DeployOptions, progress: &mut dyn Progress) -> Result<DeployReport> {
        let plan = &self.plan;
        let mut conn = self.registry.conn()?;
        let deployed = self.registry.query_deployed(&mut conn)?;
        let mut validator = Validator::new(&deployed);

        let pending = self.pending(options, &validator)?;
        let mut preflight = validator.clone();
        let mut loaded = Vec::with_capacity(pending.len());
        for &position in &pending {
            let change = &plan.changes()[position];
            preflight.check_deploy(plan, position)?;
            preflight.mark_deployed(change);
            loaded.push((position, self.load_deploy_scripts(change, options.verify)?));
        }

        let mut report = DeployReport {
            tags: self.record_new_tags(&mut conn, &validator)?,
            ..DeployReport::default()
        };
        if pending.is_empty() {
            info!(project = plan.project(), "nothing to deploy");
            return Ok(report);
        }

        let mut done: Vec<usize> = Vec::new();
        for (position, scripts) in loaded {
            let change = &plan.changes()[position];
            let resolved = validator.check_deploy(plan, position)?;

            progress.start(ScriptKind::Deploy, change);
            match self.deploy_change(&mut conn, change, &scripts, &resolved) {
                Ok(()) => {
                    progress.finish(true);
                    info!(change = %change.format_name(), "deployed");
                    validator.mark_deployed(change);
                    report.deployed.push(change.format_name());
                    done.push(position);
                }
                Err(err) => {
                    progress.finish(false);
                    error!(change = %change.format_name(), error = %err, "deploy failed");
                    self.record_failure(&mut conn, change, &err);
                    self.unwind(&mut conn, &done, options.mode, progress);
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Plan positions to deploy, in plan order.
    fn pending(&self, options: &DeployOptions, validator: &Validator) -> Result<Vec<usize>> {
        let through = self.plan.changes_through(options.to.as_deref())?;
        if options.only {
            let last = through.len().checked_sub(1);
            return Ok(last
                .filter(|p| !validator.is_deployed(&through[*p].id))
                .into_iter()
                .collect());
        }
        Ok(through
            .iter()
            .enumerate()
            .filter(|(_, c)| !validator.is_deployed(&c.id))
            .map(|(i, _)| i)
            .collect())
    }

    fn load_deploy_scripts(&self, change: &Change, verify: bool) -> Result<Scripts> {
        Ok(Scripts {
            deploy: self.load_script(change, ScriptKind::Deploy)?,
            verify: if verify {
                Some(self.load_script(change, ScriptKind::Verify)?)
            } else {
                None
            },
        })
    }

    fn deploy_change(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        scripts: &Scripts,
        resolved: &[ResolvedDependency],
    ) -> Result<()> {
        let tags = self.tags_of(change);
        let hash = scripts.deploy.hash();
        let record = |conn: &mut SqliteConnection| {
            self.registry
                .record_deploy(conn, change, &hash, resolved, &tags, &self.committer)
        };

        if scripts.deploy.is_self_managed() {
            execute(conn, change, ScriptKind::Deploy, &scripts.deploy)
                .inspect_err(|_| rollback_quietly(conn))?;
            if let Some(verify) = &scripts.verify {
                if let Err(err) = verify_change(conn, change, verify) {
                    // The deploy already committed; take it back by hand
                    self.undo_self_managed(conn, change);
                    return Err(err);
                }
            }
            return conn.transaction(record);
        }

        conn.transaction(|conn| {
            execute(conn, change, ScriptKind::Deploy, &scripts.deploy)?;
            if let Some(verify) = &scripts.verify {
                verify_and_discard(conn, change, verify)?;
            }
            record(conn)
        })
    }

    fn undo_self_managed(&self, conn: &mut SqliteConnection, change: &Change) {
        let undone = self
            .load_script(change, ScriptKind::Revert)
            .and_then(|revert| {
                if revert.is_self_managed() {
                    execute(conn, change, ScriptKind::Revert, &revert)
                } else {
                    conn.transaction(|conn| execute(conn, change, ScriptKind::Revert, &revert))
                }
            });
        if let Err(e) = undone {
            error!(change = %change.format_name(), error = %e, "could not revert after failed verify");
        }
    }

    /// Revert what this run deployed, as far as `mode` asks.
    fn unwind(
        &self,
        conn: &mut SqliteConnection,
        done: &[usize],
        mode: DeployMode,
        progress: &mut dyn Progress,
    ) {
        let keep = match mode {
            DeployMode::Change => return,
            DeployMode::All => 0,
            DeployMode::Tag => done
                .iter()
                .rposition(|p| !self.plan.changes()[*p].tags.is_empty())
                .map_or(0, |i| i + 1),
        };

        for &position in done[keep..].iter().rev() {
            let change = &self.plan.changes()[position];
            if let Err(e) = self.revert_change(conn, change, progress) {
                error!(change = %change.format_name(), error = %e, "could not unwind deploy");
                return;
            }
            info!(change = %change.format_name(), mode = %mode, "reverted after failed deploy");
        }
    }

    /// Record plan tags added after their change was deployed.
    fn record_new_tags(&self, conn: &mut SqliteConnection, validator: &Validator) -> Result<Vec<String>> {
        let known: HashSet<String> = self
            .registry
            .deployed_tags(conn)?
            .into_iter()
            .map(|t| t.tag_id)
            .collect();
        let missing: Vec<_> = self
            .plan
            .tags()
            .iter()
            .filter(|t| validator.is_deployed(&t.change_id) && !known.contains(&t.id))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        conn.transaction(|conn| {
            for tag in &missing {
                self.registry.record_tag(conn, tag, &self.committer)?;
                info!(tag = %tag.format_name(), change = %tag.change, "recorded tag");
            }
            Ok(missing.iter().map(|t| t.format_name()).collect())
        })
    }
}
