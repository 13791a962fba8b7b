//! In-memory reference adapter.
//!
//! Collections are ordered vectors guarded by a single mutex, so every call
//! settles before it returns. Tests can inject faults to exercise partial
//! step failure.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};

use super::{
    Insert, QueryAdapter, Remove, Select, StorageError, Update, VersionStore, apply_set,
    record_key,
};
use crate::record::Record;

/// Storage operation kinds, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Select,
    Insert,
    Update,
    Remove,
}

/// Fails `times` calls of `op` on `collection` after letting `skip` succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub op: OpKind,
    pub collection: String,
    pub skip: usize,
    pub times: usize,
}

impl Fault {
    /// Fail every call of `op` on `collection`.
    #[must_use]
    pub fn always(op: OpKind, collection: &str) -> Self {
        Self {
            op,
            collection: collection.to_owned(),
            skip: 0,
            times: usize::MAX,
        }
    }

    /// Fail exactly one call of `op` on `collection`, after `skip` successes.
    #[must_use]
    pub fn once_after(op: OpKind, collection: &str, skip: usize) -> Self {
        Self {
            op,
            collection: collection.to_owned(),
            skip,
            times: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, Vec<Record>>,
    version: Option<u32>,
    faults: Vec<Fault>,
}

impl Inner {
    fn check_fault(&mut self, op: OpKind, collection: &str) -> Result<(), StorageError> {
        for fault in &mut self.faults {
            if fault.op != op || fault.collection != collection || fault.times == 0 {
                continue;
            }
            if fault.skip > 0 {
                fault.skip -= 1;
                continue;
            }
            fault.times -= 1;
            return Err(StorageError::Injected(format!("{op:?} on {collection}")));
        }
        Ok(())
    }
}

/// Mutex-guarded in-memory store implementing both storage traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    migrating: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Append records to a collection without key checks.
    ///
    /// Used to stage legacy data, including keyless rows that the adapter
    /// contract would otherwise reject.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] if the store mutex is poisoned.
    pub fn seed(&self, collection: &str, records: Vec<Record>) -> Result<(), StorageError> {
        self.lock()?
            .collections
            .entry(collection.to_owned())
            .or_default()
            .extend(records);
        Ok(())
    }

    /// Copy of a collection's rows in order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] if the store mutex is poisoned.
    pub fn rows(&self, collection: &str) -> Result<Vec<Record>, StorageError> {
        Ok(self
            .lock()?
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    /// Row count per non-empty collection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] if the store mutex is poisoned.
    pub fn collection_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        Ok(self
            .lock()?
            .collections
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, rows)| (name.clone(), rows.len() as u64))
            .collect())
    }

    /// Register a fault to inject on later calls.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] if the store mutex is poisoned.
    pub fn inject(&self, fault: Fault) -> Result<(), StorageError> {
        self.lock()?.faults.push(fault);
        Ok(())
    }

    /// Drop all pending faults.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Poisoned`] if the store mutex is poisoned.
    pub fn clear_faults(&self) -> Result<(), StorageError> {
        self.lock()?.faults.clear();
        Ok(())
    }
}

impl QueryAdapter for MemoryStore {
    fn select(&self, query: &Select<'_>) -> Result<Vec<Record>, StorageError> {
        let mut inner = self.lock()?;
        inner.check_fault(OpKind::Select, query.from)?;

        let Some(rows) = inner.collections.get(query.from) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| query.filter.matches(row))
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn insert(&self, query: Insert<'_>) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.check_fault(OpKind::Insert, query.into)?;

        for value in &query.values {
            record_key(query.into, value)?;
        }

        let rows = inner.collections.entry(query.into.to_owned()).or_default();
        if !query.upsert {
            let mut seen = HashSet::new();
            for value in &query.values {
                let key = record_key(query.into, value)?;
                let taken = rows
                    .iter()
                    .any(|row| record_key(query.into, row).is_ok_and(|k| k == key));
                if taken || !seen.insert(key) {
                    return Err(StorageError::DuplicateKey {
                        collection: query.into.to_owned(),
                        key: key.to_owned(),
                    });
                }
            }
        }

        for value in query.values {
            let key = record_key(query.into, &value)?.to_owned();
            let existing = rows
                .iter()
                .position(|row| record_key(query.into, row).is_ok_and(|k| k == key));
            match existing {
                Some(index) if query.upsert => rows[index] = value,
                Some(_) => {
                    return Err(StorageError::DuplicateKey {
                        collection: query.into.to_owned(),
                        key,
                    });
                }
                None => rows.push(value),
            }
        }
        Ok(())
    }

    fn update(&self, query: &Update<'_>) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        inner.check_fault(OpKind::Update, query.collection)?;

        let Some(rows) = inner.collections.get_mut(query.collection) else {
            return Ok(0);
        };
        let mut affected = 0;
        for row in rows.iter_mut().filter(|row| query.filter.matches(row)) {
            apply_set(row, &query.set);
            affected += 1;
        }
        Ok(affected)
    }

    fn remove(&self, query: &Remove<'_>) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        inner.check_fault(OpKind::Remove, query.from)?;

        let Some(rows) = inner.collections.get_mut(query.from) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !query.filter.matches(row));
        Ok(before - rows.len())
    }
}

impl VersionStore for MemoryStore {
    fn read_version(&self) -> Result<Option<u32>, StorageError> {
        Ok(self.lock()?.version)
    }

    fn write_version(&self, version: u32) -> Result<(), StorageError> {
        self.lock()?.version = Some(version);
        Ok(())
    }

    fn migration_flag(&self) -> &AtomicBool {
        &self.migrating
    }
}
