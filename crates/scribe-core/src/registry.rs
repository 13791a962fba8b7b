//! Ordered version → step mapping.
//!
//! Versions are positive and unique; gaps are allowed and mean "nothing to
//! do at that version". The registry is assembled once through
//! [`RegistryBuilder`] and is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::error::ErrorCode;
use crate::steps::MigrationStep;

/// Registry misconfiguration, fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("migration version {version} registered twice ({existing} and {duplicate})")]
    DuplicateVersion {
        version: u32,
        existing: &'static str,
        duplicate: &'static str,
    },

    #[error("migration versions must be positive, got 0 for {step}")]
    ZeroVersion { step: &'static str },
}

impl RegistryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::DuplicateVersion { .. } => ErrorCode::DuplicateVersion,
            Self::ZeroVersion { .. } => ErrorCode::InvalidVersion,
        }
    }
}

/// Collects steps before freezing them into a [`MigrationRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    steps: BTreeMap<u32, Box<dyn MigrationStep>>,
}

impl RegistryBuilder {
    /// Register `step` as the migration to `version`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateVersion`] if `version` is taken and
    /// [`RegistryError::ZeroVersion`] for version 0.
    pub fn register(
        &mut self,
        version: u32,
        step: impl MigrationStep + 'static,
    ) -> Result<&mut Self, RegistryError> {
        if version == 0 {
            return Err(RegistryError::ZeroVersion { step: step.name() });
        }
        if let Some(existing) = self.steps.get(&version) {
            return Err(RegistryError::DuplicateVersion {
                version,
                existing: existing.name(),
                duplicate: step.name(),
            });
        }
        self.steps.insert(version, Box::new(step));
        Ok(self)
    }

    /// Freeze the registered steps.
    #[must_use]
    pub fn build(self) -> MigrationRegistry {
        MigrationRegistry { steps: self.steps }
    }
}

/// Immutable, strictly increasing sequence of migration steps.
pub struct MigrationRegistry {
    steps: BTreeMap<u32, Box<dyn MigrationStep>>,
}

impl MigrationRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Steps with `version > current`, ascending.
    pub fn steps_after(&self, current: u32) -> impl Iterator<Item = (u32, &dyn MigrationStep)> {
        self.steps
            .range(current.saturating_add(1)..)
            .filter(move |_| current < u32::MAX)
            .map(|(version, step)| (*version, step.as_ref()))
    }

    /// Highest registered version, if any.
    #[must_use]
    pub fn latest_version(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }

    /// All registered versions, ascending.
    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.steps.iter().map(|(version, step)| (version, step.name())))
            .finish()
    }
}
