//! Status: where the target stands against the plan

use super::Engine;
use crate::error::Result;
use crate::registry::DeployedChange;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub project: String,
    pub target: String,
    /// Deployed changes in deploy order
    pub deployed: Vec<DeployedChange>,
    /// Planned changes not yet deployed, in plan order
    pub pending: Vec<String>,
    /// Tags recorded in the registry
    pub tags: Vec<String>,
}

impl Status {
    /// The most recently deployed change.
    pub fn last(&self) -> Option<&DeployedChange> {
        self.deployed.last()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Engine {
    pub fn status(&self) -> Result<Status> {
        let mut conn = self.registry.conn()?;
        let deployed = self.registry.query_deployed(&mut conn)?;
        let tags = self
            .registry
            .deployed_tags(&mut conn)?
            .into_iter()
            .map(|t| t.tag)
            .collect();

        let pending = self
            .plan
            .changes()
            .iter()
            .filter(|c| !deployed.iter().any(|d| d.change_id == c.id))
            .map(|c| c.format_name())
            .collect();

        Ok(Status {
            project: self.plan.project().to_string(),
            target: self.target.name.clone(),
            deployed,
            pending,
            tags,
        })
    }
}
