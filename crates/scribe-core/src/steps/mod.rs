//! Migration steps and the per-row execution helpers they share.
//!
//! A step is bound to one target version and applies one self-contained
//! change through the injected [`QueryAdapter`]. Steps process rows in
//! bounded batches: every row operation of a batch is issued and its outcome
//! collected before the step decides whether to continue, and any row
//! failure fails the whole step once the batch has settled. Writes are
//! key-addressed upserts and removes, so re-running a step from scratch
//! after a partial failure converges on the same state.

pub mod consolidate_timeline;
pub mod reconcile_edits;
pub mod search_index;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::adapter::{QueryAdapter, StorageError};
use crate::registry::{MigrationRegistry, RegistryError};

pub use consolidate_timeline::ConsolidateTimeline;
pub use reconcile_edits::ReconcileEdits;
pub use search_index::BackfillSearchIndex;

/// Latest version registered by [`default_registry`].
pub const LATEST_VERSION: u32 = 16;

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Build the registry of every shipped migration step.
///
/// # Errors
///
/// Returns [`RegistryError`] if two steps claim the same version.
pub fn default_registry() -> Result<MigrationRegistry, RegistryError> {
    let mut builder = MigrationRegistry::builder();
    builder
        .register(10, ConsolidateTimeline::default())?
        .register(15, BackfillSearchIndex)?
        .register(LATEST_VERSION, ReconcileEdits)?;
    Ok(builder.build())
}

/// Everything a step may touch while it runs.
pub struct StepContext<'a> {
    pub adapter: &'a dyn QueryAdapter,
    pub version: u32,
    pub batch_size: usize,
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("version", &self.version)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// What happened to a single source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// The row produced at least one write.
    Written,
    /// The row was left alone on purpose (malformed, keyless, superseded).
    Skipped,
}

/// Row counts reported by a finished step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepStats {
    /// Source rows visited.
    pub rows: usize,
    /// Rows that produced writes.
    pub written: usize,
    /// Rows deliberately skipped.
    pub skipped: usize,
    /// Rows touched by bulk statements outside the per-row pass.
    pub bulk_updated: usize,
}

impl StepStats {
    fn record(&mut self, outcome: RowOutcome) {
        self.rows += 1;
        match outcome {
            RowOutcome::Written => self.written += 1,
            RowOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        self.rows += other.rows;
        self.written += other.written;
        self.skipped += other.skipped;
        self.bulk_updated += other.bulk_updated;
    }
}

/// A failed row operation, identified by the source row key when known.
#[derive(Debug)]
pub struct RowFailure {
    pub key: Option<String>,
    pub error: StorageError,
}

/// Failure of a single migration step.
#[derive(Debug, Error)]
pub enum StepError {
    /// A step-level storage call (select, bulk update) failed.
    #[error("storage call failed: {0}")]
    Storage(#[from] StorageError),

    /// One or more per-row operations failed; all of them are kept.
    #[error("{} of {attempted} row operations failed; first: {}", .failures.len(), first_failure(.failures))]
    Rows {
        attempted: usize,
        failures: Vec<RowFailure>,
    },
}

fn first_failure(failures: &[RowFailure]) -> String {
    failures.first().map_or_else(String::new, |failure| {
        format!(
            "{} ({})",
            failure.error,
            failure.key.as_deref().unwrap_or("<no key>")
        )
    })
}

/// One versioned transformation of the store.
pub trait MigrationStep: Send + Sync {
    /// Short stable name for logs and reports.
    fn name(&self) -> &'static str;

    /// Apply the change. Returns only after every storage call it issued
    /// has settled.
    ///
    /// # Errors
    ///
    /// Returns [`StepError`] if any storage call fails.
    fn apply(&self, ctx: &StepContext<'_>) -> Result<StepStats, StepError>;
}

/// Adapter turning a closure into a [`MigrationStep`].
pub struct FnStep<F> {
    name: &'static str,
    apply: F,
}

impl<F> FnStep<F>
where
    F: Fn(&StepContext<'_>) -> Result<StepStats, StepError> + Send + Sync,
{
    pub const fn new(name: &'static str, apply: F) -> Self {
        Self { name, apply }
    }
}

impl<F> MigrationStep for FnStep<F>
where
    F: Fn(&StepContext<'_>) -> Result<StepStats, StepError> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<StepStats, StepError> {
        (self.apply)(ctx)
    }
}

impl StepContext<'_> {
    /// Run `op` over `rows` in batches of `batch_size`.
    ///
    /// Within a batch every row is attempted regardless of earlier failures
    /// in the same batch. If a batch ends with failures, no further batch is
    /// started and all collected failures are returned together.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::Rows`] carrying every failed row.
    pub fn for_each_row<T>(
        &self,
        rows: Vec<T>,
        key_of: impl Fn(&T) -> Option<String>,
        mut op: impl FnMut(&T) -> Result<RowOutcome, StorageError>,
    ) -> Result<StepStats, StepError> {
        let batch_size = self.batch_size.max(1);
        let total = rows.len();
        let mut stats = StepStats::default();
        let mut failures = Vec::new();
        let mut attempted = 0;

        for (index, batch) in rows.chunks(batch_size).enumerate() {
            for row in batch {
                attempted += 1;
                match op(row) {
                    Ok(outcome) => stats.record(outcome),
                    Err(error) => failures.push(RowFailure {
                        key: key_of(row),
                        error,
                    }),
                }
            }

            tracing::debug!(
                version = self.version,
                batch = index,
                done = attempted,
                total,
                failed = failures.len(),
                "row batch settled"
            );

            if !failures.is_empty() {
                return Err(StepError::Rows {
                    attempted,
                    failures,
                });
            }
        }

        Ok(stats)
    }
}
