//! Migration runner: applies pending steps in order and checkpoints each one.
//!
//! # Checkpoints
//!
//! The stored version advances only after a step has fully settled. A
//! failed step leaves the marker at the last success, so the next run
//! resumes at the failed version instead of redoing earlier ones. No
//! rollback is attempted; steps are idempotent and simply run again.
//!
//! # Exclusivity
//!
//! At most one pipeline runs per store. The in-flight flag lives on the
//! store's [`VersionStore`], so a [`MigrationRunner::run`] call is rejected
//! with [`MigrationError::AlreadyRunning`] while any runner over the same
//! store is mid-run. Cross-process exclusion over an on-disk store is the
//! job of [`crate::lock::StoreLock`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::adapter::{QueryAdapter, StorageError, VersionStore};
use crate::error::ErrorCode;
use crate::registry::MigrationRegistry;
use crate::steps::{DEFAULT_BATCH_SIZE, StepContext, StepError, StepStats};

/// Runner lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Running(u32),
    Completed(u32),
    Failed(u32),
}

/// Reasons a run stops short of its target.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration to version {version} failed: {source}")]
    StepFailed {
        version: u32,
        #[source]
        source: StepError,
    },

    #[error("migration deadline of {deadline:?} exceeded before version {version} (elapsed {elapsed:?})")]
    Timeout {
        version: u32,
        deadline: Duration,
        elapsed: Duration,
    },

    #[error("version {version} applied but its checkpoint could not be saved: {source}")]
    Checkpoint {
        version: u32,
        #[source]
        source: StorageError,
    },

    #[error("could not read the stored schema version: {0}")]
    ReadVersion(#[source] StorageError),

    #[error("a migration run is already in progress for this store")]
    AlreadyRunning,
}

impl MigrationError {
    /// Version the run stopped at, when a step was involved.
    #[must_use]
    pub const fn failed_version(&self) -> Option<u32> {
        match self {
            Self::StepFailed { version, .. }
            | Self::Timeout { version, .. }
            | Self::Checkpoint { version, .. } => Some(*version),
            Self::ReadVersion(_) | Self::AlreadyRunning => None,
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::StepFailed { .. } => ErrorCode::StepFailed,
            Self::Timeout { .. } => ErrorCode::MigrationTimeout,
            Self::Checkpoint { source, .. } | Self::ReadVersion(source) => source.code(),
            Self::AlreadyRunning => ErrorCode::MigrationInFlight,
        }
    }
}

/// Tunables for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Rows per batch inside a step.
    pub batch_size: usize,
    /// Overall budget, checked before each step starts.
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            deadline: None,
        }
    }
}

/// Outcome of one applied step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedStep {
    pub version: u32,
    pub name: &'static str,
    pub stats: StepStats,
    pub elapsed_ms: u128,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub from_version: u32,
    pub to_version: u32,
    pub target_version: u32,
    pub applied: Vec<AppliedStep>,
    pub started_at: DateTime<Utc>,
}

impl RunReport {
    /// Returns `true` when nothing needed to run.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Clears the in-flight flag when a run ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Result<Self, MigrationError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MigrationError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Applies registered steps to a store.
pub struct MigrationRunner<'a> {
    registry: &'a MigrationRegistry,
    adapter: &'a dyn QueryAdapter,
    versions: &'a dyn VersionStore,
    options: RunOptions,
    state: Mutex<RunnerState>,
}

impl fmt::Debug for MigrationRunner<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("registry", self.registry)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<'a> MigrationRunner<'a> {
    #[must_use]
    pub fn new(
        registry: &'a MigrationRegistry,
        adapter: &'a dyn QueryAdapter,
        versions: &'a dyn VersionStore,
    ) -> Self {
        Self {
            registry,
            adapter,
            versions,
            options: RunOptions::default(),
            state: Mutex::new(RunnerState::Idle),
        }
    }

    #[must_use]
    pub const fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunnerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RunnerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Stored version, treating "never written" as 0.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::ReadVersion`] if the marker cannot be read.
    pub fn current_version(&self) -> Result<u32, MigrationError> {
        self.versions
            .read_version()
            .map(Option::unwrap_or_default)
            .map_err(MigrationError::ReadVersion)
    }

    /// Versions that a run to `target` would apply.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::ReadVersion`] if the marker cannot be read.
    pub fn pending(&self, target: u32) -> Result<Vec<u32>, MigrationError> {
        let current = self.current_version()?;
        Ok(self
            .registry
            .steps_after(current)
            .map(|(version, _)| version)
            .take_while(|version| *version <= target)
            .collect())
    }

    /// Apply every registered step with `current < version <= target`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] on the first failing step, on deadline
    /// expiry, on checkpoint failure, or when another run is in flight.
    pub fn run(&self, target: u32) -> Result<RunReport, MigrationError> {
        let _guard = InFlight::enter(self.versions.migration_flag())?;
        let started = Instant::now();
        let started_at = Utc::now();

        let from_version = self.current_version()?;
        let mut report = RunReport {
            from_version,
            to_version: from_version,
            target_version: target,
            applied: Vec::new(),
            started_at,
        };

        if from_version >= target {
            tracing::debug!(current = from_version, target, "store already at target version");
            self.set_state(RunnerState::Completed(from_version));
            return Ok(report);
        }

        tracing::info!(from = from_version, target, "starting store migration");

        let pending = self
            .registry
            .steps_after(from_version)
            .take_while(|(version, _)| *version <= target);

        for (version, step) in pending {
            if let Some(deadline) = self.options.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    tracing::error!(version, ?deadline, ?elapsed, "migration deadline exceeded");
                    self.set_state(RunnerState::Failed(version));
                    return Err(MigrationError::Timeout {
                        version,
                        deadline,
                        elapsed,
                    });
                }
            }

            self.set_state(RunnerState::Running(version));
            tracing::info!(version, step = step.name(), "applying migration step");
            let step_started = Instant::now();

            let ctx = StepContext {
                adapter: self.adapter,
                version,
                batch_size: self.options.batch_size,
            };
            let stats = step.apply(&ctx).map_err(|source| {
                tracing::error!(version, step = step.name(), error = %source, "migration step failed");
                self.set_state(RunnerState::Failed(version));
                MigrationError::StepFailed { version, source }
            })?;

            self.versions.write_version(version).map_err(|source| {
                self.set_state(RunnerState::Failed(version));
                MigrationError::Checkpoint { version, source }
            })?;

            let elapsed_ms = step_started.elapsed().as_millis();
            tracing::info!(
                version,
                step = step.name(),
                rows = stats.rows,
                written = stats.written,
                skipped = stats.skipped,
                elapsed_ms,
                "migration step applied"
            );

            report.to_version = version;
            report.applied.push(AppliedStep {
                version,
                name: step.name(),
                stats,
                elapsed_ms,
            });
        }

        self.set_state(RunnerState::Completed(report.to_version));
        tracing::info!(
            from = from_version,
            to = report.to_version,
            steps = report.applied.len(),
            "store migration complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryStore;
    use crate::steps::FnStep;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_step(
        name: &'static str,
        calls: Arc<AtomicUsize>,
    ) -> FnStep<impl Fn(&StepContext<'_>) -> Result<StepStats, StepError> + Send + Sync> {
        FnStep::new(name, move |_: &StepContext<'_>| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(StepStats::default())
        })
    }

    #[test]
    fn fresh_store_runs_every_step_and_checkpoints() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = MigrationRegistry::builder();
        builder
            .register(1, counting_step("one", Arc::clone(&calls)))
            .and_then(|b| b.register(3, counting_step("three", Arc::clone(&calls))))
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        let runner = MigrationRunner::new(&registry, &store, &store);
        assert_eq!(runner.state(), RunnerState::Idle);

        let report = runner.run(3).expect("run");
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, 3);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.read_version().expect("version"), Some(3));
        assert_eq!(runner.state(), RunnerState::Completed(3));
    }

    #[test]
    fn at_or_past_target_is_a_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = MigrationRegistry::builder();
        builder
            .register(5, counting_step("five", Arc::clone(&calls)))
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();
        store.write_version(5).expect("seed version");

        let report = MigrationRunner::new(&registry, &store, &store)
            .run(5)
            .expect("run");
        assert!(report.is_noop());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stops_at_target_even_with_later_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = MigrationRegistry::builder();
        builder
            .register(2, counting_step("two", Arc::clone(&calls)))
            .and_then(|b| b.register(4, counting_step("four", Arc::clone(&calls))))
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        let runner = MigrationRunner::new(&registry, &store, &store);
        assert_eq!(runner.pending(3).expect("pending"), vec![2]);
        let report = runner.run(3).expect("run");
        assert_eq!(report.to_version, 2);
        assert_eq!(store.read_version().expect("version"), Some(2));
    }

    #[test]
    fn failure_keeps_last_checkpoint() {
        let mut builder = MigrationRegistry::builder();
        builder
            .register(1, counting_step("ok", Arc::new(AtomicUsize::new(0))))
            .and_then(|b| {
                b.register(
                    2,
                    FnStep::new("boom", |_: &StepContext<'_>| {
                        Err(StepError::Storage(StorageError::Injected("boom".into())))
                    }),
                )
            })
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        let runner = MigrationRunner::new(&registry, &store, &store);
        let err = runner.run(2).expect_err("must fail");
        assert_eq!(err.failed_version(), Some(2));
        assert_eq!(err.code(), ErrorCode::StepFailed);
        assert_eq!(store.read_version().expect("version"), Some(1));
        assert_eq!(runner.state(), RunnerState::Failed(2));
    }

    #[test]
    fn zero_deadline_times_out_before_first_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = MigrationRegistry::builder();
        builder
            .register(1, counting_step("one", Arc::clone(&calls)))
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        let err = MigrationRunner::new(&registry, &store, &store)
            .with_options(RunOptions {
                batch_size: 8,
                deadline: Some(Duration::ZERO),
            })
            .run(1)
            .expect_err("must time out");
        assert!(matches!(err, MigrationError::Timeout { version: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.read_version().expect("version"), None);
    }

    #[test]
    fn checkpoint_failure_is_reported() {
        struct ReadOnlyVersions(AtomicBool);
        impl VersionStore for ReadOnlyVersions {
            fn read_version(&self) -> Result<Option<u32>, StorageError> {
                Ok(None)
            }
            fn write_version(&self, _version: u32) -> Result<(), StorageError> {
                Err(StorageError::Injected("read-only".into()))
            }
            fn migration_flag(&self) -> &AtomicBool {
                &self.0
            }
        }

        let mut builder = MigrationRegistry::builder();
        builder
            .register(1, counting_step("one", Arc::new(AtomicUsize::new(0))))
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        let err = MigrationRunner::new(&registry, &store, &ReadOnlyVersions(AtomicBool::new(false)))
            .run(1)
            .expect_err("must fail");
        assert!(matches!(err, MigrationError::Checkpoint { version: 1, .. }));
        assert_eq!(err.code(), ErrorCode::StorageFailure);
    }

    #[test]
    fn flag_is_cleared_after_success_and_failure() {
        let mut builder = MigrationRegistry::builder();
        builder
            .register(
                1,
                FnStep::new("boom", |_: &StepContext<'_>| {
                    Err(StepError::Storage(StorageError::Injected("boom".into())))
                }),
            )
            .expect("register");
        let registry = builder.build();
        let store = MemoryStore::new();

        MigrationRunner::new(&registry, &store, &store)
            .run(1)
            .expect_err("must fail");
        assert!(!store.migration_flag().load(Ordering::SeqCst));

        store.write_version(1).expect("skip failing step");
        MigrationRunner::new(&registry, &store, &store)
            .run(1)
            .expect("noop");
        assert!(!store.migration_flag().load(Ordering::SeqCst));
    }

    #[test]
    fn held_flag_rejects_a_fresh_runner() {
        let registry = MigrationRegistry::builder().build();
        let store = MemoryStore::new();
        store.migration_flag().store(true, Ordering::SeqCst);

        let err = MigrationRunner::new(&registry, &store, &store)
            .run(1)
            .expect_err("flag held");
        assert!(matches!(err, MigrationError::AlreadyRunning));
        assert_eq!(err.code(), ErrorCode::MigrationInFlight);
    }

    #[test]
    fn state_serializes_with_version() {
        let json = serde_json::to_value(RunnerState::Failed(11)).expect("serialize");
        assert_eq!(json, serde_json::json!({"state": "failed", "version": 11}));
    }
}
