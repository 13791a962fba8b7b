use std::fmt;

/// Machine-readable error codes surfaced by the CLI and embedding applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    StoreNotInitialized,
    ConfigParseError,
    DuplicateVersion,
    InvalidVersion,
    StorageFailure,
    DuplicateKey,
    MissingKey,
    StepFailed,
    MigrationTimeout,
    MigrationInFlight,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::StoreNotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::DuplicateVersion => "E2001",
            Self::InvalidVersion => "E2002",
            Self::StorageFailure => "E3001",
            Self::DuplicateKey => "E3002",
            Self::MissingKey => "E3003",
            Self::StepFailed => "E4001",
            Self::MigrationTimeout => "E4002",
            Self::MigrationInFlight => "E5001",
            Self::LockContention => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::StoreNotInitialized => "Store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::DuplicateVersion => "Duplicate migration version",
            Self::InvalidVersion => "Invalid migration version",
            Self::StorageFailure => "Storage backend failure",
            Self::DuplicateKey => "Duplicate record key",
            Self::MissingKey => "Record has no key",
            Self::StepFailed => "Migration step failed",
            Self::MigrationTimeout => "Migration deadline exceeded",
            Self::MigrationInFlight => "Migration already running",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::StoreNotInitialized => Some("Run `scribe init` to create the store directory."),
            Self::ConfigParseError => Some("Fix syntax in .scribe/config.toml and retry."),
            Self::DuplicateVersion | Self::InvalidVersion => {
                Some("Register each migration step under a unique positive version.")
            }
            Self::StorageFailure => Some("Check disk space and permissions, then retry."),
            Self::DuplicateKey | Self::MissingKey => None,
            Self::StepFailed => Some(
                "Local history may be partially migrated. The next run retries from the last checkpoint.",
            ),
            Self::MigrationTimeout => {
                Some("Raise migration.deadline_secs or rerun; completed steps are kept.")
            }
            Self::MigrationInFlight | Self::LockContention => {
                Some("Retry after the other migration run finishes.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
