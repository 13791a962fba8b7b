pub mod init;
pub mod migrate;
pub mod status;

use crate::output::{CliError, OutputMode, render_error};
use anyhow::Result;
use scribe_core::config::{self, ProjectConfig, STORE_DIR};
use scribe_core::error::ErrorCode;
use std::path::Path;

/// Resolve config for a project that has been through `scribe init`.
///
/// Failures are rendered as coded diagnostics before being returned.
pub fn load_initialized(project_root: &Path, output: OutputMode) -> Result<ProjectConfig> {
    if !project_root.join(STORE_DIR).is_dir() {
        return fail(
            output,
            CliError::coded(
                ErrorCode::StoreNotInitialized,
                format!("no {STORE_DIR}/ directory in {}", project_root.display()),
            ),
        );
    }

    match config::resolve_config(project_root) {
        Ok(config) => Ok(config),
        Err(e) => fail(
            output,
            CliError::coded(ErrorCode::ConfigParseError, format!("{e:#}")),
        ),
    }
}

/// Render `error` and return it as the command failure.
pub fn fail<T>(output: OutputMode, error: CliError) -> Result<T> {
    render_error(output, &error)?;
    anyhow::bail!("{}", error.message)
}
