//! The `ensure_ready` state machine.
//!
//! One attempt runs at a time per [`SingleFlight`]. An attempt decides whether
//! the destination needs a fresh copy (missing file, older marker, failed
//! integrity check, checked in that order), copies from a clean slate,
//! verifies the result and only then records the bundle version. A file that
//! looked fine but fails the second look is deleted and copied once more;
//! there is no further retry inside the same call.

mod flight;

pub use flight::{FlightError, SingleFlight};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::Level;
use serde::Serialize;
use serde_json::json;

use crate::config::{AssetDescriptor, ProvisionConfig};
use crate::errors::{ProvisionResult, ProvisioningError};
use crate::integrity::{AssetCheck, IntegrityChecker};
use crate::locator::{PackagedAssets, Platform, SourceLocator};
use crate::logging::log_event;
use crate::version::VersionStore;

const MODULE: &str = "provision";

pub type ProvisionFlight = SingleFlight<ProvisionResult<()>>;

/// Diagnostic snapshot, shaped for JSON consumers.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionStatus {
    pub destination: PathBuf,
    pub installed_version: u32,
    pub bundle_version: u32,
    pub valid: bool,
    pub in_flight: bool,
}

/// Cheap to clone; clones share the same in-flight slot.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
    flight: Arc<ProvisionFlight>,
}

struct Inner {
    descriptor: AssetDescriptor,
    destination: PathBuf,
    locator: SourceLocator,
    checker: Arc<dyn AssetCheck>,
    versions: VersionStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    Recopy,
}

enum Step {
    Done,
    Recopy,
}

impl Provisioner {
    pub fn builder(config: ProvisionConfig) -> ProvisionerBuilder {
        ProvisionerBuilder::new(config)
    }

    /// Make sure a verified copy of the current bundle version sits at
    /// [`destination_path`](Self::destination_path). Concurrent callers share
    /// one attempt and all receive its outcome.
    pub async fn ensure_ready(&self) -> ProvisionResult<()> {
        let inner = Arc::clone(&self.inner);
        match self.flight.run(move || async move { inner.provision().await }).await {
            Ok(outcome) => outcome,
            Err(FlightError::NoRuntime) => Err(ProvisioningError::Configuration(
                "ensure_ready must be awaited inside a tokio runtime".to_string(),
            )),
            Err(FlightError::Abandoned) => Err(ProvisioningError::Interrupted),
        }
    }

    /// Forget the installed version so the next `ensure_ready` copies again.
    ///
    /// Runs while holding the in-flight slot: a running attempt finishes
    /// first, and attempts requested meanwhile start only after the marker
    /// is gone.
    pub async fn invalidate(&self) -> ProvisionResult<()> {
        let versions = &self.inner.versions;
        self.flight.exclusive(|| versions.clear()).await?;
        log_event(Level::Info, "PRV-0170", MODULE, "version marker cleared", None);
        Ok(())
    }

    pub async fn status(&self) -> ProvisionStatus {
        ProvisionStatus {
            destination: self.inner.destination.clone(),
            installed_version: self.inner.versions.installed_version().await,
            bundle_version: self.inner.descriptor.bundle_version,
            valid: self.inner.checker.is_valid(&self.inner.destination).await,
            in_flight: self.flight.in_flight(),
        }
    }

    pub fn destination_path(&self) -> &Path {
        &self.inner.destination
    }

    pub fn destination_dir(&self) -> &Path {
        self.inner.locator.destination_dir()
    }

    pub fn descriptor(&self) -> &AssetDescriptor {
        &self.inner.descriptor
    }
}

impl Inner {
    async fn provision(&self) -> ProvisionResult<()> {
        log_event(
            Level::Info,
            "PRV-0100",
            MODULE,
            "provisioning attempt started",
            Some(json!({
                "destination": self.destination.display().to_string(),
                "bundle_version": self.descriptor.bundle_version,
                "source": self.locator.source().describe(),
            })),
        );
        let result = self.run_passes().await;
        match &result {
            Ok(()) => log_event(Level::Info, "PRV-0160", MODULE, "dictionary ready", None),
            Err(err) => log_event(
                Level::Error,
                err.code(),
                MODULE,
                "provisioning attempt failed",
                Some(json!({ "error": err.to_string(), "explain": err.explain() })),
            ),
        }
        result
    }

    async fn run_passes(&self) -> ProvisionResult<()> {
        match self.attempt(Pass::First).await? {
            Step::Done => Ok(()),
            Step::Recopy => match self.attempt(Pass::Recopy).await? {
                Step::Done => Ok(()),
                Step::Recopy => Err(ProvisioningError::CorruptAfterRecopy { path: self.destination.clone() }),
            },
        }
    }

    async fn attempt(&self, pass: Pass) -> ProvisionResult<Step> {
        let dir = self.locator.destination_dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| ProvisioningError::filesystem("create_dir_all", dir, err))?;

        let installed = self.versions.installed_version().await;
        if let Some(reason) = self.copy_reason(installed).await {
            log_event(
                Level::Info,
                "PRV-0110",
                MODULE,
                "copy required",
                Some(json!({ "reason": reason, "installed_version": installed, "pass": format!("{pass:?}") })),
            );
            if let Err(err) = self.copy_and_verify(pass).await {
                self.discard_partial().await;
                return Err(err);
            }
            self.versions.set_installed_version(self.descriptor.bundle_version).await?;
            log_event(
                Level::Info,
                "PRV-0150",
                MODULE,
                "installed version recorded",
                Some(json!({ "version": self.descriptor.bundle_version })),
            );
            return Ok(Step::Done);
        }

        // Something may have touched the file since the decision was made.
        let second_look = self.checker.inspect(&self.destination).await;
        if !second_look.is_valid() {
            log_event(
                Level::Warn,
                "PRV-0140",
                MODULE,
                "existing dictionary failed revalidation, forcing re-copy",
                Some(json!({ "reason": second_look.label(), "pass": format!("{pass:?}") })),
            );
            remove_if_present(&self.destination).await?;
            return Ok(Step::Recopy);
        }
        if installed != self.descriptor.bundle_version {
            self.versions.set_installed_version(self.descriptor.bundle_version).await?;
        }
        log_event(
            Level::Debug,
            "PRV-0111",
            MODULE,
            "dictionary already installed",
            Some(json!({ "installed_version": installed })),
        );
        Ok(Step::Done)
    }

    async fn copy_reason(&self, installed: u32) -> Option<&'static str> {
        if !tokio::fs::try_exists(&self.destination).await.unwrap_or(false) {
            return Some("missing");
        }
        if installed < self.descriptor.bundle_version {
            return Some("outdated");
        }
        let inspection = self.checker.inspect(&self.destination).await;
        if !inspection.is_valid() {
            return Some(inspection.label());
        }
        None
    }

    async fn copy_and_verify(&self, pass: Pass) -> ProvisionResult<()> {
        if remove_if_present(&self.destination).await? {
            log_event(Level::Info, "PRV-0120", MODULE, "removed stale dictionary before copy", None);
        }

        self.locator.source().fetch_into(&self.destination).await?;

        let size = match tokio::fs::metadata(&self.destination).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(ProvisioningError::filesystem("stat", &self.destination, err)),
        };
        log_event(Level::Info, "PRV-0121", MODULE, "dictionary copied", Some(json!({ "bytes": size })));

        if size == 0 {
            return Err(ProvisioningError::CopyIncomplete { path: self.destination.clone() });
        }
        if size < self.descriptor.minimum_copy_size_bytes {
            return Err(ProvisioningError::CopySizeAnomaly {
                size,
                expected: self.descriptor.minimum_copy_size_bytes,
            });
        }
        if !self.checker.is_valid(&self.destination).await {
            return Err(match pass {
                Pass::First => ProvisioningError::CorruptAfterCopy { path: self.destination.clone() },
                Pass::Recopy => ProvisioningError::CorruptAfterRecopy { path: self.destination.clone() },
            });
        }
        Ok(())
    }

    /// Best effort: a failed cleanup is logged and never replaces the error
    /// that triggered it.
    async fn discard_partial(&self) {
        if let Err(err) = remove_if_present(&self.destination).await {
            log_event(
                Level::Warn,
                "PRV-0131",
                MODULE,
                "failed to remove partial dictionary",
                Some(json!({ "error": err.to_string() })),
            );
        }
    }
}

/// Returns whether a file was actually removed.
async fn remove_if_present(path: &Path) -> ProvisionResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ProvisioningError::filesystem("remove_file", path, err)),
    }
}

pub struct ProvisionerBuilder {
    config: ProvisionConfig,
    platform: Option<Platform>,
    packaged: Option<Arc<dyn PackagedAssets>>,
    locator: Option<SourceLocator>,
    checker: Option<Arc<dyn AssetCheck>>,
    flight: Option<Arc<ProvisionFlight>>,
    bundle_version: Option<u32>,
}

impl ProvisionerBuilder {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            config,
            platform: None,
            packaged: None,
            locator: None,
            checker: None,
            flight: None,
            bundle_version: None,
        }
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn packaged_assets(mut self, assets: Arc<dyn PackagedAssets>) -> Self {
        self.packaged = Some(assets);
        self
    }

    /// Bypass platform resolution entirely.
    pub fn locator(mut self, locator: SourceLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn checker(mut self, checker: Arc<dyn AssetCheck>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Share an in-flight slot between several provisioners.
    pub fn single_flight(mut self, flight: Arc<ProvisionFlight>) -> Self {
        self.flight = Some(flight);
        self
    }

    pub fn bundle_version(mut self, version: u32) -> Self {
        self.bundle_version = Some(version);
        self
    }

    pub fn build(self) -> ProvisionResult<Provisioner> {
        let mut descriptor = self.config.asset.clone();
        if let Some(version) = self.bundle_version {
            descriptor.bundle_version = version;
        }
        if descriptor.expected_name.is_empty() {
            return Err(ProvisioningError::Configuration("asset name is empty".to_string()));
        }
        let locator = match self.locator {
            Some(locator) => locator,
            None => {
                let platform = match self.platform {
                    Some(platform) => platform,
                    None => Platform::current()?,
                };
                SourceLocator::for_platform(platform, &self.config, self.packaged)?
            }
        };
        let destination = locator.destination_dir().join(&descriptor.expected_name);
        let checker = self
            .checker
            .unwrap_or_else(|| Arc::new(IntegrityChecker::new(&descriptor)));
        let versions = VersionStore::new(locator.destination_dir());
        Ok(Provisioner {
            inner: Arc::new(Inner { descriptor, destination, locator, checker, versions }),
            flight: self.flight.unwrap_or_else(SingleFlight::new),
        })
    }
}
