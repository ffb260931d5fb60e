//! Revert: undo deployed changes, newest first

use super::{Engine, Progress};
use crate::error::{Error, Result};
use crate::plan::Change;
use crate::registry::DeployedChange;
use crate::validate::check_revert;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct RevertOptions {
    /// Keep this change and everything deployed before it
    pub to: Option<String>,
}

/// How a revert run ended. Declining the prompt is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    /// Changes reverted, in revert order
    Reverted(Vec<String>),
    Declined,
    NothingToRevert,
}

impl Engine {
    /// Revert deployed changes back to (not including) `options.to`, or all
    /// of them. `confirm` sees the changes in revert order and may decline.
    pub fn revert(
        &self,
        options: &RevertOptions,
        confirm: &mut dyn FnMut(&[&Change]) -> bool,
        progress: &mut dyn Progress,
    ) -> Result<RevertOutcome> {
        let mut conn = self.registry.conn()?;
        let deployed = self.registry.query_deployed(&mut conn)?;

        let keep = match options.to.as_deref() {
            None => 0,
            Some(reference) => {
                let change = self
                    .plan
                    .find(reference)
                    .ok_or_else(|| Error::UnknownChange(reference.to_string()))?;
                let index = deployed
                    .iter()
                    .position(|d| d.change_id == change.id)
                    .ok_or_else(|| {
                        Error::UnknownChange(format!("{} is not deployed", reference))
                    })?;
                index + 1
            }
        };

        let reverting: Vec<DeployedChange> = deployed[keep..].iter().rev().cloned().collect();
        if reverting.is_empty() {
            info!(project = self.plan.project(), "nothing to revert");
            return Ok(RevertOutcome::NothingToRevert);
        }

        let ids: Vec<String> = reverting.iter().map(|d| d.change_id.clone()).collect();
        let requiring = self.registry.requiring(&mut conn, &ids)?;
        check_revert(&reverting, &requiring, &deployed)?;

        let changes = reverting
            .iter()
            .map(|d| {
                self.plan.change_by_id(&d.change_id).ok_or_else(|| {
                    Error::UnknownChange(format!(
                        "{} ({}) is deployed but not in the plan",
                        d.change, d.change_id
                    ))
                })
            })
            .collect::<Result<Vec<&Change>>>()?;

        if !confirm(&changes) {
            info!("revert declined");
            return Ok(RevertOutcome::Declined);
        }

        let mut reverted = Vec::with_capacity(changes.len());
        for change in changes {
            self.revert_change(&mut conn, change, progress)?;
            info!(change = %change.format_name(), "reverted");
            reverted.push(change.format_name());
        }
        Ok(RevertOutcome::Reverted(reverted))
    }
}
