//! Sidecar marker recording which bundled dictionary version is installed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::spawn_blocking;

use crate::errors::{ProvisionResult, ProvisioningError};

pub const MARKER_FILE: &str = ".version";

#[derive(Debug, Clone)]
pub struct VersionStore {
    marker: PathBuf,
}

impl VersionStore {
    pub fn new(destination_dir: &Path) -> Self {
        Self { marker: destination_dir.join(MARKER_FILE) }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    /// Missing, unreadable and garbled markers all read as `0`, i.e. never installed.
    pub async fn installed_version(&self) -> u32 {
        match tokio::fs::read_to_string(&self.marker).await {
            Ok(raw) => raw.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Replace the marker with `version`. The value lands in a temp file first
    /// and is renamed into place, so readers never observe a torn write.
    pub async fn set_installed_version(&self, version: u32) -> ProvisionResult<()> {
        let marker = self.marker.clone();
        spawn_blocking(move || write_marker(&marker, version))
            .await
            .map_err(|err| persistence(&self.marker, std::io::Error::other(err.to_string())))?
    }

    pub async fn clear(&self) -> ProvisionResult<()> {
        match tokio::fs::remove_file(&self.marker).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence(&self.marker, err)),
        }
    }
}

fn write_marker(marker: &Path, version: u32) -> ProvisionResult<()> {
    let parent = marker
        .parent()
        .ok_or_else(|| persistence(marker, std::io::Error::other("marker has no parent directory")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| persistence(marker, err))?;
    tmp.write_all(version.to_string().as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| persistence(marker, err))?;
    tmp.persist(marker).map_err(|err| persistence(marker, err.error))?;
    Ok(())
}

fn persistence(marker: &Path, err: std::io::Error) -> ProvisioningError {
    ProvisioningError::Persistence { path: marker.to_path_buf(), source: Arc::new(err) }
}
