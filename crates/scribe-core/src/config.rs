use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::RunOptions;
use crate::steps::DEFAULT_BATCH_SIZE;

/// Directory holding the store and its config, relative to the project root.
pub const STORE_DIR: &str = ".scribe";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store database path; relative paths resolve against the project root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Version to migrate to; latest registered when unset.
    #[serde(default)]
    pub target_version: Option<u32>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            target_version: None,
            batch_size: default_batch_size(),
            deadline_secs: None,
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl MigrationConfig {
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            batch_size: self.batch_size,
            deadline: self.deadline_secs.map(Duration::from_secs),
        }
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// User-level defaults from `<config dir>/scribe/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl ProjectConfig {
    /// Absolute store path for `project_root`.
    #[must_use]
    pub fn store_path(&self, project_root: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            project_root.join(&self.store.path)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.migration.batch_size == 0 {
            bail!("migration.batch_size must be at least 1");
        }
        if self.migration.target_version == Some(0) {
            bail!("migration.target_version must be positive");
        }
        Ok(())
    }
}

/// Path of the project config file.
#[must_use]
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(STORE_DIR).join("config.toml")
}

/// Load `.scribe/config.toml`, falling back to defaults when it is missing.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, parsed, or fails
/// validation.
pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = project_config_path(project_root);
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let config = toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid {}", path.display()))?;
    Ok(config)
}

/// Load the user-level config, if any.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<UserConfig> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(UserConfig::default());
    };

    let path = config_dir.join("scribe/config.toml");
    if !path.exists() {
        return Ok(UserConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<UserConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Project config with the user-level store path applied when the project
/// file leaves it at the default.
///
/// # Errors
///
/// Returns an error if either config file is unreadable or invalid.
pub fn resolve_config(project_root: &Path) -> Result<ProjectConfig> {
    let mut project = load_project_config(project_root)?;
    let user = load_user_config()?;

    if let Some(path) = user.store_path.filter(|_| project.store.path == default_store_path()) {
        project.store.path = path;
    }
    Ok(project)
}

/// Write a default config file unless one already exists.
///
/// Returns `true` when a file was written.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn write_default_config(project_root: &Path) -> Result<bool> {
    let path = project_config_path(project_root);
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let content = toml::to_string_pretty(&ProjectConfig::default())
        .context("Failed to serialize default config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}

fn default_store_path() -> PathBuf {
    Path::new(STORE_DIR).join("store.sqlite3")
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_project_config(dir.path()).expect("load");
        assert_eq!(config, ProjectConfig::default());
        assert_eq!(
            config.store_path(dir.path()),
            dir.path().join(".scribe/store.sqlite3")
        );
        assert_eq!(config.migration.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(dir.path().join(STORE_DIR)).expect("mkdir");
        std::fs::write(
            project_config_path(dir.path()),
            "[migration]\ntarget_version = 15\ndeadline_secs = 30\n",
        )
        .expect("write");

        let config = load_project_config(dir.path()).expect("load");
        assert_eq!(config.migration.target_version, Some(15));
        assert_eq!(config.migration.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.migration.run_options().deadline,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.migration.lock_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(dir.path().join(STORE_DIR)).expect("mkdir");
        std::fs::write(project_config_path(dir.path()), "[migration]\nbatch_size = 0\n")
            .expect("write");

        let err = load_project_config(dir.path()).expect_err("must fail");
        assert!(format!("{err:#}").contains("batch_size"));
    }

    #[test]
    fn malformed_toml_reports_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(dir.path().join(STORE_DIR)).expect("mkdir");
        std::fs::write(project_config_path(dir.path()), "[store\npath = 1").expect("write");

        let err = load_project_config(dir.path()).expect_err("must fail");
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn default_config_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(write_default_config(dir.path()).expect("write"));
        assert!(!write_default_config(dir.path()).expect("second write"));
        assert_eq!(
            load_project_config(dir.path()).expect("load"),
            ProjectConfig::default()
        );
    }

    #[test]
    fn absolute_store_path_is_kept() {
        let mut config = ProjectConfig::default();
        config.store.path = PathBuf::from("/var/lib/scribe/store.sqlite3");
        assert_eq!(
            config.store_path(Path::new("/home/me/project")),
            PathBuf::from("/var/lib/scribe/store.sqlite3")
        );
    }
}
