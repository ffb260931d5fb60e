//! Deployment targets
//!
//! A target names the database changes are deployed to, the registry file
//! attached next to it, and the top directory holding the scripts.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::plan::Change;
use crate::script::ScriptKind;
use std::path::{Path, PathBuf};

/// Registry file created next to the target database by default.
pub const DEFAULT_REGISTRY: &str = "sqitch.db";

/// URI prefix accepted for compatibility with reference-tool targets.
const SQLITE_URI_PREFIX: &str = "db:sqlite:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub database: PathBuf,
    pub registry: PathBuf,
    pub top_dir: PathBuf,
}

impl Target {
    /// Target with the default registry location.
    pub fn new(database: impl Into<PathBuf>, top_dir: impl Into<PathBuf>) -> Self {
        let database = database.into();
        let registry = default_registry(&database);
        Self {
            name: database.display().to_string(),
            database,
            registry,
            top_dir: top_dir.into(),
        }
    }

    pub fn with_registry(mut self, registry: impl Into<PathBuf>) -> Self {
        self.registry = registry.into();
        self
    }

    /// Resolve `name` (or the configured default) to a target.
    pub fn resolve(config: &Config, name: Option<&str>) -> Result<Self> {
        let name = name
            .or(config.core.target.as_deref())
            .ok_or_else(|| {
                Error::Config("no target given and [core] target is not set".to_string())
            })?;

        if let Some(named) = config.targets.get(name) {
            let database = config.resolve(&named.database);
            let mut target = Target::new(database, config.top_dir());
            if let Some(registry) = &named.registry {
                target.registry = config.resolve(registry);
            }
            target.name = name.to_string();
            return Ok(target);
        }

        let path = name.strip_prefix(SQLITE_URI_PREFIX).unwrap_or(name);
        if path.is_empty() {
            return Err(Error::Config(format!("target \"{}\" has no database path", name)));
        }
        let mut target = Target::new(config.resolve(Path::new(path)), config.top_dir());
        target.name = name.to_string();
        Ok(target)
    }

    /// Absolute location of a change's script.
    pub fn script_path(&self, change: &Change, kind: ScriptKind) -> PathBuf {
        self.top_dir.join(change.script_path(kind))
    }
}

fn default_registry(database: &Path) -> PathBuf {
    match database.parent() {
        Some(parent) => parent.join(DEFAULT_REGISTRY),
        None => PathBuf::from(DEFAULT_REGISTRY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn config() -> Config {
        Config {
            root: PathBuf::from("/srv/flipr"),
            ..Config::default()
        }
    }

    #[test]
    fn test_registry_defaults_next_to_database() {
        let target = Target::new("/data/flipr.db", "/srv/flipr");
        assert_eq!(target.registry, PathBuf::from("/data/sqitch.db"));
        let relative = Target::new("flipr.db", ".");
        assert_eq!(relative.registry, PathBuf::from("sqitch.db"));
    }

    #[test]
    fn test_resolve_database_path() {
        let target = Target::resolve(&config(), Some("db:sqlite:flipr.db")).unwrap();
        assert_eq!(target.database, PathBuf::from("/srv/flipr/flipr.db"));
        assert_eq!(target.registry, PathBuf::from("/srv/flipr/sqitch.db"));
        assert_eq!(target.top_dir, PathBuf::from("/srv/flipr/."));
    }

    #[test]
    fn test_resolve_named_target() {
        let mut config = config();
        config.targets.insert(
            "prod".to_string(),
            TargetConfig {
                database: PathBuf::from("/data/prod.db"),
                registry: Some(PathBuf::from("registry/prod.db")),
            },
        );
        config.core.target = Some("prod".to_string());

        let target = Target::resolve(&config, None).unwrap();
        assert_eq!(target.name, "prod");
        assert_eq!(target.database, PathBuf::from("/data/prod.db"));
        assert_eq!(target.registry, PathBuf::from("/srv/flipr/registry/prod.db"));
    }

    #[test]
    fn test_missing_target_is_config_error() {
        assert!(matches!(
            Target::resolve(&config(), None),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Target::resolve(&config(), Some("db:sqlite:")),
            Err(Error::Config(_))
        ));
    }
}
