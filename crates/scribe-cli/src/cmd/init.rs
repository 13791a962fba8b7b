use crate::output::{OutputMode, pretty_kv, render};
use anyhow::{Context as _, Result};
use scribe_core::adapter::SqliteStore;
use scribe_core::config::{self, STORE_DIR};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
struct InitReport {
    config_path: PathBuf,
    config_written: bool,
    store_path: PathBuf,
}

/// Execute `scribe init`:
///
/// ```text
/// .scribe/
///   config.toml      (default config, left alone if present)
///   store.sqlite3    (empty store, version unset)
/// ```
///
/// Re-running is safe; existing config and data are kept.
///
/// # Errors
///
/// Returns an error if the directory, config, or store cannot be created.
pub fn run_init(output: OutputMode, project_root: &Path) -> Result<()> {
    let store_dir = project_root.join(STORE_DIR);
    std::fs::create_dir_all(&store_dir)
        .with_context(|| format!("Failed to create {}", store_dir.display()))?;

    let config_written = config::write_default_config(project_root)?;
    let project = config::resolve_config(project_root)?;
    let store_path = project.store_path(project_root);
    SqliteStore::open(&store_path)?;

    tracing::info!(store = %store_path.display(), config_written, "initialized scribe store");

    let report = InitReport {
        config_path: config::project_config_path(project_root),
        config_written,
        store_path,
    };
    render(output, &report, |r, w| {
        writeln!(w, "✓ Initialized {STORE_DIR}/")?;
        pretty_kv(
            w,
            "config",
            format!(
                "{}{}",
                r.config_path.display(),
                if r.config_written { "" } else { " (kept)" }
            ),
        )?;
        pretty_kv(w, "store", r.store_path.display().to_string())?;
        writeln!(w)?;
        writeln!(w, "Next: run `scribe migrate` to bring the store up to date.")
    })
}
