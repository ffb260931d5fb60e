//! Verify: run every deployed change's verify script without committing

use super::{execute, rollback_quietly, Engine, Progress};
use crate::error::{Error, Result};
use crate::plan::Change;
use crate::script::{Script, ScriptKind};
use diesel::connection::Connection;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeResult {
    pub change: String,
    pub change_id: String,
    /// `None` when the verify script passed
    pub error: Option<String>,
}

impl ChangeResult {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub results: Vec<ChangeResult>,
}

impl VerifyReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(ChangeResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChangeResult> {
        self.results.iter().filter(|r| !r.passed())
    }
}

impl Engine {
    /// Verify every deployed change in deploy order. A failing change does
    /// not stop the run; each result is reported.
    pub fn verify(&self, progress: &mut dyn Progress) -> Result<VerifyReport> {
        let mut conn = self.registry.conn()?;
        let deployed = self.registry.query_deployed(&mut conn)?;
        let mut report = VerifyReport::default();

        for row in &deployed {
            let Some(change) = self.plan.change_by_id(&row.change_id) else {
                warn!(change = %row.change, id = %row.change_id, "deployed change missing from plan");
                report.results.push(ChangeResult {
                    change: row.change.clone(),
                    change_id: row.change_id.clone(),
                    error: Some(
                        Error::UnknownChange(format!("{} is deployed but not in the plan", row.change))
                            .to_string(),
                    ),
                });
                continue;
            };

            progress.start(ScriptKind::Verify, change);
            let outcome = self
                .load_script(change, ScriptKind::Verify)
                .and_then(|script| verify_change(&mut conn, change, &script));
            progress.finish(outcome.is_ok());

            report.results.push(ChangeResult {
                change: change.format_name(),
                change_id: change.id.clone(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        info!(
            checked = report.results.len(),
            failed = report.failures().count(),
            "verify finished"
        );
        Ok(report)
    }
}

/// Run a verify script and throw away whatever it did.
pub(super) fn verify_change(conn: &mut SqliteConnection, change: &Change, script: &Script) -> Result<()> {
    if script.is_self_managed() {
        let result = execute(conn, change, ScriptKind::Verify, script);
        rollback_quietly(conn);
        return result;
    }
    verify_and_discard(conn, change, script)
}

/// Run a verify script in a transaction that always rolls back. Inside an
/// open transaction this is a savepoint, so the outer work survives.
pub(super) fn verify_and_discard(conn: &mut SqliteConnection, change: &Change, script: &Script) -> Result<()> {
    let mut outcome = Ok(());
    let rolled_back = conn.transaction::<(), diesel::result::Error, _>(|conn| {
        outcome = execute(conn, change, ScriptKind::Verify, script);
        Err(diesel::result::Error::RollbackTransaction)
    });
    outcome?;
    match rolled_back {
        Err(diesel::result::Error::RollbackTransaction) | Ok(()) => Ok(()),
        Err(e) => Err(Error::Registry(e)),
    }
}
