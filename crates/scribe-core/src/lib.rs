//! scribe-core: versioned migrations for the embedded per-device message store.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums at library seams, each mapped to an
//!   [`error::ErrorCode`]; `anyhow::Result` where files are opened or parsed.
//! - **Logging**: `tracing` macros (`info!` per step, `warn!` per skipped
//!   row, `debug!` per batch).
//!
//! Wiring a store for a run:
//!
//! ```no_run
//! use scribe_core::{adapter::SqliteStore, runner::MigrationRunner, steps};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = SqliteStore::open(std::path::Path::new(".scribe/store.sqlite3"))?;
//! let registry = steps::default_registry()?;
//! let report = MigrationRunner::new(&registry, &store, &store).run(steps::LATEST_VERSION)?;
//! println!("now at version {}", report.to_version);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod lock;
pub mod record;
pub mod registry;
pub mod runner;
pub mod steps;
