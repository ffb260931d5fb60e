//! Configuration file support for strata
//!
//! Reads `strata.toml`, found by walking up from the current directory or
//! named by `STRATA_CONFIG`. Relative paths are resolved against the
//! directory holding the file.

use crate::engine::DeployMode;
use crate::error::{Error, Result};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the project config file.
pub const CONFIG_FILE: &str = "strata.toml";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,

    /// First rung of the identity chain
    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub revert: RevertConfig,

    /// Named targets
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub root: PathBuf,
}

/// Project layout settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CoreConfig {
    /// Directory holding the plan and the deploy/revert/verify trees
    /// Default: "."
    #[serde(default = "default_top_dir")]
    pub top_dir: PathBuf,

    /// Plan file, relative to `top_dir`
    /// Default: "sqitch.plan"
    #[serde(default = "default_plan_file")]
    pub plan_file: PathBuf,

    /// Default target: a `[targets]` name or a database path
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct UserConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct DeployConfig {
    /// What to revert when a deploy fails
    /// Default: change
    #[serde(default)]
    pub mode: DeployMode,

    /// Run verify scripts as part of each deploy
    #[serde(default)]
    pub verify: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RevertConfig {
    /// Ask before reverting
    /// Default: true
    #[serde(default = "default_true")]
    pub prompt: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TargetConfig {
    pub database: PathBuf,
    /// Registry file; defaults to `sqitch.db` next to the database
    #[serde(default)]
    pub registry: Option<PathBuf>,
}

fn default_top_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_plan_file() -> PathBuf {
    PathBuf::from("sqitch.plan")
}

fn default_true() -> bool {
    true
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            top_dir: default_top_dir(),
            plan_file: default_plan_file(),
            target: None,
        }
    }
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self { prompt: true }
    }
}

impl Config {
    /// Load `STRATA_CONFIG` or the nearest `strata.toml`.
    /// Returns default config rooted at the current directory if none exists.
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| Error::io(".", e))?;
        if let Some(path) = std::env::var_os("STRATA_CONFIG") {
            return Self::load_from(Path::new(&path));
        }
        match Self::find_config_path(&cwd) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self {
                root: cwd,
                ..Self::default()
            }),
        }
    }

    /// Parse a specific config file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Find strata.toml by walking up directory tree
    fn find_config_path(start: &Path) -> Option<PathBuf> {
        let mut dir = start;

        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Resolve a possibly relative path against the config root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn top_dir(&self) -> PathBuf {
        self.resolve(&self.core.top_dir)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.top_dir().join(&self.core.plan_file)
    }

    /// Identity for planning and committing, starting from `[user]`.
    pub fn identity(&self) -> Identity {
        Identity::resolve(self.user.name.as_deref(), self.user.email.as_deref())
    }

    /// Write the config to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(path, text).map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.core.top_dir, PathBuf::from("."));
        assert_eq!(config.core.plan_file, PathBuf::from("sqitch.plan"));
        assert_eq!(config.deploy.mode, DeployMode::Change);
        assert!(!config.deploy.verify);
        assert!(config.revert.prompt);
        assert!(config.targets.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[core]
top_dir = "db"
target = "dev"

[user]
name = "Jane"
email = "jane@example.com"

[deploy]
mode = "tag"
verify = true

[revert]
prompt = false

[targets.dev]
database = "dev.db"
registry = "dev-registry.db"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.core.top_dir, PathBuf::from("db"));
        assert_eq!(config.core.target.as_deref(), Some("dev"));
        assert_eq!(config.deploy.mode, DeployMode::Tag);
        assert!(config.deploy.verify);
        assert!(!config.revert.prompt);
        assert_eq!(
            config.targets["dev"].registry.as_deref(),
            Some(Path::new("dev-registry.db"))
        );
        assert_eq!(config.identity().name, "Jane");
    }

    #[test]
    fn test_invalid_mode_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[deploy]\nmode = \"sometimes\"\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[core]\ntop_dir = \"db\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.top_dir(), dir.path().join("db"));
        assert_eq!(config.plan_path(), dir.path().join("db").join("sqitch.plan"));
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            Config::find_config_path(&nested),
            Some(dir.path().join(CONFIG_FILE))
        );
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = Config::default();
        config.core.target = Some("flipr.db".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.core, config.core);
    }
}
