//! Strata - database schema change management
//!
//! Plan changes, deploy them, verify them, revert them, and keep an audit
//! trail of every step.
//!
//! # Overview
//!
//! A project keeps a plan file listing named changes in deploy order. Each
//! change has three SQL scripts under `deploy/`, `revert/` and `verify/`.
//! Deploying a change runs its deploy script and records it in a registry
//! attached to the target database; reverting runs the revert script and
//! removes the record. Every step is also appended to an event log.
//!
//! | Piece | Module |
//! |-------|--------|
//! | Plan file reader/writer | [`plan`] |
//! | Content-derived ids | [`id`] |
//! | Planner/committer identity | [`identity`] |
//! | Dependency checks | [`validate`] |
//! | Registry tables and events | [`registry`] |
//! | Deploy, revert, verify, status | [`engine`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use strata::{Engine, DeployOptions, Identity, Plan, Target, Quiet};
//!
//! let plan = Plan::load("sqitch.plan").unwrap();
//! let target = Target::new("app.db", ".");
//! let engine = Engine::open(plan, target, Identity::new("Jane", "jane@example.com")).unwrap();
//!
//! let report = engine.deploy(&DeployOptions::default(), &mut Quiet).unwrap();
//! println!("deployed {} change(s)", report.deployed.len());
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod id;
pub mod identity;
pub mod logging;
pub mod plan;
pub mod registry;
pub mod schema;
pub mod script;
pub mod target;
pub mod validate;

pub use config::Config;
pub use engine::{
    ChangeResult, DeployMode, DeployOptions, DeployReport, Engine, Progress, Quiet,
    RevertOptions, RevertOutcome, Status, VerifyReport,
};
pub use error::{Error, Result};
pub use identity::Identity;
pub use plan::{Change, Dependency, Plan, Planner, Tag};
pub use registry::{DeployedChange, Event, EventFilter, EventKind, Registry};
pub use script::{Script, ScriptKind};
pub use target::Target;
