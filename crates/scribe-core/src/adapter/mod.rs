//! Query adapter contract: the only path from migration steps to storage.
//!
//! Adapters are injected into the runner and every step; there is no
//! process-wide handle. Every collection is keyed by [`EVENT_ID`]. A call
//! returns only after the backend has settled the operation, so a step
//! observes its own writes in subsequent selects.

pub mod memory;
pub mod sqlite;

use std::sync::atomic::AtomicBool;

use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::record::{EVENT_ID, Record};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite backend error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored record is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("record with key {key:?} already exists in {collection}")]
    DuplicateKey { collection: String, key: String },

    #[error("record inserted into {collection} has no string `eventId` key")]
    MissingKey { collection: String },

    #[error("schema version {0} is out of range")]
    VersionOutOfRange(i64),

    #[error("store handle poisoned by a panicking writer")]
    Poisoned,

    #[error("injected fault: {0}")]
    Injected(String),
}

impl StorageError {
    /// Machine-readable code associated with this storage error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            Self::MissingKey { .. } => ErrorCode::MissingKey,
            Self::Poisoned => ErrorCode::InternalUnexpected,
            Self::Sqlite(_) | Self::Codec(_) | Self::VersionOutOfRange(_) | Self::Injected(_) => {
                ErrorCode::StorageFailure
            }
        }
    }
}

/// Conjunction of field equality predicates.
///
/// A record matches when every named field is present and equal to the
/// expected value. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    /// Filter matching every record.
    #[must_use]
    pub const fn all() -> Self {
        Self { terms: Vec::new() }
    }

    /// Filter with a single equality term.
    #[must_use]
    pub fn where_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    /// Filter selecting a record by key.
    #[must_use]
    pub fn key(event_id: &str) -> Self {
        Self::where_eq(EVENT_ID, event_id)
    }

    /// Add another equality term.
    #[must_use]
    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((field.into(), value.into()));
        self
    }

    /// Returns `true` when `record` satisfies every term.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.terms
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// Key value when the filter pins [`EVENT_ID`] to a string.
    #[must_use]
    pub fn key_term(&self) -> Option<&str> {
        self.terms
            .iter()
            .find(|(field, _)| field == EVENT_ID)
            .and_then(|(_, value)| value.as_str())
    }

    /// Returns `true` when the filter has no terms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// `select` options.
#[derive(Debug, Clone)]
pub struct Select<'a> {
    pub from: &'a str,
    pub filter: Filter,
    pub limit: Option<usize>,
}

impl<'a> Select<'a> {
    /// Select every record of a collection.
    #[must_use]
    pub const fn new(from: &'a str) -> Self {
        Self {
            from,
            filter: Filter::all(),
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// `insert` options.
#[derive(Debug, Clone)]
pub struct Insert<'a> {
    pub into: &'a str,
    /// Replace records whose key already exists instead of failing.
    pub upsert: bool,
    pub values: Vec<Record>,
}

impl<'a> Insert<'a> {
    /// Insert-or-replace keyed by [`EVENT_ID`].
    #[must_use]
    pub const fn upsert(into: &'a str, values: Vec<Record>) -> Self {
        Self {
            into,
            upsert: true,
            values,
        }
    }

    /// Strict insert; an existing key fails with [`StorageError::DuplicateKey`].
    #[must_use]
    pub const fn strict(into: &'a str, values: Vec<Record>) -> Self {
        Self {
            into,
            upsert: false,
            values,
        }
    }
}

/// `update` options. Fields in `set` overwrite the matching records' fields.
#[derive(Debug, Clone)]
pub struct Update<'a> {
    pub collection: &'a str,
    pub set: Record,
    pub filter: Filter,
}

/// `remove` options.
#[derive(Debug, Clone)]
pub struct Remove<'a> {
    pub from: &'a str,
    pub filter: Filter,
}

/// Storage operations available to migration steps.
pub trait QueryAdapter: Send + Sync {
    /// Return matching records in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend call fails.
    fn select(&self, query: &Select<'_>) -> Result<Vec<Record>, StorageError>;

    /// Insert records, replacing existing keys when `upsert` is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingKey`] for keyless records and
    /// [`StorageError::DuplicateKey`] for a strict insert of an existing key.
    fn insert(&self, query: Insert<'_>) -> Result<(), StorageError>;

    /// Overwrite fields of matching records and return how many matched.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend call fails.
    fn update(&self, query: &Update<'_>) -> Result<usize, StorageError>;

    /// Delete matching records and return how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the backend call fails.
    fn remove(&self, query: &Remove<'_>) -> Result<usize, StorageError>;
}

/// Persisted schema version marker, kept outside the migrated collections.
pub trait VersionStore: Send + Sync {
    /// Read the stored version; `None` when no version was ever written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the marker cannot be read.
    fn read_version(&self) -> Result<Option<u32>, StorageError>;

    /// Persist a new version marker.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the marker cannot be written.
    fn write_version(&self, version: u32) -> Result<(), StorageError>;

    /// Flag set while a migration pipeline runs over this store.
    ///
    /// Every runner built over the same store shares it, so at most one
    /// pipeline is in flight per store instance.
    fn migration_flag(&self) -> &AtomicBool;
}

/// Extract the string key of a record.
pub(crate) fn record_key<'r>(collection: &str, record: &'r Record) -> Result<&'r str, StorageError> {
    record
        .get(EVENT_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::MissingKey {
            collection: collection.to_owned(),
        })
}

/// Overwrite `target` fields with `set`.
pub(crate) fn apply_set(target: &mut Record, set: &Record) {
    for (field, value) in set {
        target.insert(field.clone(), value.clone());
    }
}
