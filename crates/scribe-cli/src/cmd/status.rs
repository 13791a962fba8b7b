use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use scribe_core::adapter::SqliteStore;
use scribe_core::runner::MigrationRunner;
use scribe_core::steps;
use serde::Serialize;

use super::{fail, load_initialized};
use crate::output::{CliError, OutputMode, pretty_kv, render};

#[derive(Debug, Serialize)]
struct StatusReport {
    store_path: PathBuf,
    current_version: u32,
    latest_version: u32,
    pending: Vec<u32>,
    collections: BTreeMap<String, u64>,
}

/// Execute `scribe status`.
///
/// # Errors
///
/// Returns an error if the project is not initialized or the store cannot be
/// read.
pub fn run_status(output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_initialized(project_root, output)?;
    let store_path = config.store_path(project_root);
    let store = SqliteStore::open(&store_path)?;
    let registry = steps::default_registry()?;
    let latest_version = registry.latest_version().unwrap_or_default();

    let runner = MigrationRunner::new(&registry, &store, &store);
    let versions = runner.current_version().and_then(|current| {
        runner
            .pending(latest_version)
            .map(|pending| (current, pending))
    });
    let (current_version, pending) = match versions {
        Ok(found) => found,
        Err(e) => return fail(output, CliError::coded(e.code(), e.to_string())),
    };
    let collections = match store.collection_counts() {
        Ok(counts) => counts,
        Err(e) => return fail(output, CliError::coded(e.code(), e.to_string())),
    };

    let report = StatusReport {
        store_path,
        current_version,
        latest_version,
        pending,
        collections,
    };
    render(output, &report, |r, w| {
        pretty_kv(w, "store", r.store_path.display().to_string())?;
        pretty_kv(w, "version", r.current_version.to_string())?;
        pretty_kv(w, "latest", r.latest_version.to_string())?;
        if r.pending.is_empty() {
            pretty_kv(w, "pending", "none")?;
        } else {
            let pending: Vec<String> = r.pending.iter().map(u32::to_string).collect();
            pretty_kv(w, "pending", pending.join(", "))?;
        }
        if !r.collections.is_empty() {
            writeln!(w)?;
            for (name, count) in &r.collections {
                writeln!(w, "  {name:<20} {count}")?;
            }
        }
        Ok(())
    })
}
