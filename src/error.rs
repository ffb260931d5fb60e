//! Error types for strata operations.
//!
//! Structural errors (`Parse`, `Validation`, `DependencyUnsatisfied`,
//! `ConflictDeployed`, `RevertBlocked`) are raised before any target or
//! registry mutation. `ScriptExecution` is raised after the enclosing
//! transaction was rolled back and, for deploy and revert, after a `fail`
//! event was recorded.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing plans or driving deployments.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed plan text.
    #[error("plan syntax error at line {line}: {message}")]
    Parse {
        /// 1-based line number in the plan file.
        line: usize,
        /// What was wrong with the line.
        message: String,
    },

    /// Plan is well-formed but semantically invalid (duplicate names,
    /// unknown references, dependency cycles, bad mutation requests).
    #[error("{0}")]
    Validation(String),

    /// A required change is not deployed.
    #[error("cannot deploy \"{change}\": missing required change(s) {}", .missing.join(", "))]
    DependencyUnsatisfied {
        change: String,
        missing: Vec<String>,
    },

    /// A conflicting change is deployed.
    #[error("cannot deploy \"{change}\": conflicts with deployed change(s) {}", .conflicts.join(", "))]
    ConflictDeployed {
        change: String,
        conflicts: Vec<String>,
    },

    /// Reverting would orphan changes that still depend on the target.
    #[error("cannot revert \"{change}\": required by deployed change(s) {}", .dependents.join(", "))]
    RevertBlocked {
        change: String,
        dependents: Vec<String>,
    },

    /// A deploy, revert or verify script raised.
    #[error("{kind} script {} for \"{change}\" failed: {source}", .script.display())]
    ScriptExecution {
        change: String,
        kind: &'static str,
        script: PathBuf,
        #[source]
        source: diesel::result::Error,
    },

    /// A plan reference (`name`, `@tag`, `name@tag`) or registry row that
    /// cannot be matched against the plan.
    #[error("unknown change: {0}")]
    UnknownChange(String),

    /// The registry exists but does not have the expected shape.
    #[error("registry corrupted: {0}")]
    RegistryCorruption(String),

    /// Registry query failed.
    #[error("registry error: {0}")]
    Registry(#[from] diesel::result::Error),

    /// Could not open or attach a database.
    #[error("connection error: {0}")]
    Connection(String),

    /// Filesystem error with the offending path.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration file.
    #[error("config error: {0}")]
    Config(String),

    /// Could not render JSON output.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_message_names_missing_change() {
        let err = Error::DependencyUnsatisfied {
            change: "flips".to_string(),
            missing: vec!["users".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "cannot deploy \"flips\": missing required change(s) users"
        );
    }

    #[test]
    fn test_parse_message_has_line() {
        let err = Error::parse(7, "bad timestamp");
        assert!(err.to_string().contains("line 7"));
    }
}
