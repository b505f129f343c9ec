use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub type ProvisionResult<T> = Result<T, ProvisioningError>;

/// Every outcome `ensure_ready` can report. Cloned to all waiters of a shared
/// attempt, so I/O causes are held behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    #[error("Unsupported configuration: {0}")] Configuration(String),
    #[error("Bundled asset {name} is unavailable")]
    SourceUnavailable {
        name: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },
    #[error("Copied asset at {} is empty", path.display())] CopyIncomplete { path: PathBuf },
    #[error("Copied asset is only {size} bytes, expected at least {expected}")]
    CopySizeAnomaly { size: u64, expected: u64 },
    #[error("Copied asset at {} failed the integrity check", path.display())]
    CorruptAfterCopy { path: PathBuf },
    #[error("Asset at {} is still invalid after a forced re-copy", path.display())]
    CorruptAfterRecopy { path: PathBuf },
    #[error("Could not write version marker {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("Filesystem operation '{op}' failed on {}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("Provisioning attempt ended without reporting an outcome")] Interrupted,
}

impl ProvisioningError {
    pub(crate) fn filesystem(op: &'static str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Filesystem { op, path: path.into(), source: Arc::new(err) }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "PRV-1000",
            Self::SourceUnavailable { .. } => "PRV-1001",
            Self::CopyIncomplete { .. } => "PRV-1002",
            Self::CopySizeAnomaly { .. } => "PRV-1003",
            Self::CorruptAfterCopy { .. } => "PRV-1004",
            Self::CorruptAfterRecopy { .. } => "PRV-1005",
            Self::Persistence { .. } => "PRV-1006",
            Self::Filesystem { .. } => "PRV-1007",
            Self::Interrupted => "PRV-1099",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "The running platform has no known location for the dictionary.",
            Self::SourceUnavailable { .. } => "The dictionary shipped with the application could not be read.",
            Self::CopyIncomplete { .. } => "Copying the dictionary produced an empty file.",
            Self::CopySizeAnomaly { .. } => "The copied dictionary is much smaller than the shipped one.",
            Self::CorruptAfterCopy { .. } => "The copied dictionary is not a valid database file.",
            Self::CorruptAfterRecopy { .. } => "The dictionary stayed invalid after copying it a second time.",
            Self::Persistence { .. } => "The installed dictionary version could not be recorded.",
            Self::Filesystem { .. } => "The dictionary directory could not be prepared.",
            Self::Interrupted => "The dictionary setup stopped unexpectedly.",
        }
    }

    /// Only configuration problems are permanent; everything else may succeed
    /// on a later `ensure_ready` call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}
