use std::io::Write;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use scribe_core::adapter::SqliteStore;
use scribe_core::error::ErrorCode;
use scribe_core::lock::{LockError, StoreLock};
use scribe_core::runner::{MigrationError, MigrationRunner, RunReport};
use scribe_core::steps::{self, LATEST_VERSION};

use super::{fail, load_initialized};
use crate::output::{CliError, OutputMode, render};

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Version to migrate to. Defaults to `migration.target_version`, then
    /// the latest registered version.
    #[arg(long)]
    pub target: Option<u32>,
}

/// Execute `scribe migrate`.
///
/// Holds the store lock for the whole run. On failure the store keeps the
/// last checkpoint and a coded diagnostic is printed.
///
/// # Errors
///
/// Returns an error if the project is not initialized, the lock is held
/// elsewhere, or any step fails.
pub fn run_migrate(args: &MigrateArgs, output: OutputMode, project_root: &Path) -> Result<()> {
    let config = load_initialized(project_root, output)?;
    let target = args
        .target
        .or(config.migration.target_version)
        .unwrap_or(LATEST_VERSION);
    if target == 0 {
        return fail(
            output,
            CliError::coded(ErrorCode::InvalidVersion, "target version must be positive"),
        );
    }

    let store_path = config.store_path(project_root);
    let lock = match StoreLock::acquire(
        &StoreLock::path_for(&store_path),
        config.migration.lock_timeout(),
    ) {
        Ok(lock) => lock,
        Err(e) => return fail(output, lock_error(&e)),
    };

    let store = match SqliteStore::open(&store_path) {
        Ok(store) => store,
        Err(e) => {
            return fail(
                output,
                CliError::coded(ErrorCode::StorageFailure, format!("{e:#}")),
            );
        }
    };
    let registry = steps::default_registry()?;
    let runner = MigrationRunner::new(&registry, &store, &store)
        .with_options(config.migration.run_options());

    let result = runner.run(target);
    lock.release();

    match result {
        Ok(report) => render(output, &report, render_report),
        Err(e) => {
            let at = runner.current_version().ok();
            fail(output, migration_error(&e, at))
        }
    }
}

fn render_report(report: &RunReport, w: &mut dyn Write) -> std::io::Result<()> {
    if report.is_noop() {
        return writeln!(
            w,
            "Store already at version {}; nothing to migrate.",
            report.to_version
        );
    }

    writeln!(
        w,
        "✓ Migrated store from version {} to {}.",
        report.from_version, report.to_version
    )?;
    for step in &report.applied {
        writeln!(
            w,
            "  v{:<4} {:<24} rows={} written={} skipped={} ({} ms)",
            step.version,
            step.name,
            step.stats.rows,
            step.stats.written,
            step.stats.skipped,
            step.elapsed_ms
        )?;
    }
    if report.to_version < report.target_version {
        writeln!(
            w,
            "No registered step reaches version {}; stopped at {}.",
            report.target_version, report.to_version
        )?;
    }
    Ok(())
}

fn lock_error(e: &LockError) -> CliError {
    let message = match e {
        LockError::Timeout { path, waited } => format!(
            "another migration holds {} (waited {waited:?})",
            path.display()
        ),
        LockError::Io(io) => format!("cannot open the store lock: {io}"),
    };
    CliError::coded(e.code(), message)
}

/// `at` is the stored version after the failure, when it could be read.
fn migration_error(e: &MigrationError, at: Option<u32>) -> CliError {
    let message = match (e.failed_version(), at) {
        (Some(version), Some(at)) => format!(
            "{e}. Store left at version {at}; local history may be partially migrated \
             and the next run retries from version {version}."
        ),
        (Some(version), None) => format!(
            "{e}. Local history may be partially migrated and the next run retries \
             from version {version}."
        ),
        (None, _) => e.to_string(),
    };
    CliError::coded(e.code(), message)
}
