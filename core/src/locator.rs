//! Where the bundled dictionary comes from and where its writable copy lives.
//!
//! The platform is a static switch with two outcomes:
//! - Android keeps the asset inside the package. It can only be reached through
//!   an asset-copy primitive ([`PackagedAssets`]) and is copied into the fixed
//!   private directory `/data/data/<package>/files`.
//! - Every other supported platform ships it as a plain file under a read-only
//!   bundle root and copies it into `<app data dir>/<subdirectory>`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use directories::ProjectDirs;
use tokio::io::AsyncWriteExt;

use crate::config::ProvisionConfig;
use crate::errors::{ProvisionResult, ProvisioningError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Android,
    Ios,
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    pub fn from_identifier(id: &str) -> ProvisionResult<Self> {
        match id.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "macos" => Ok(Self::MacOs),
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(ProvisioningError::Configuration(format!("unsupported platform '{other}'"))),
        }
    }

    pub fn current() -> ProvisionResult<Self> {
        Self::from_identifier(std::env::consts::OS)
    }

    pub fn uses_packaged_assets(&self) -> bool {
        matches!(self, Self::Android)
    }
}

/// Opaque access to assets packed inside the application package, for
/// platforms where they have no ordinary filesystem path.
#[async_trait]
pub trait PackagedAssets: Send + Sync {
    async fn exists(&self, name: &str) -> bool;

    /// Write the whole asset `name` to `dest`, which must not exist yet.
    async fn copy_to(&self, name: &str, dest: &Path) -> std::io::Result<()>;
}

/// Asset table compiled into (or loaded by) the host binary.
#[derive(Clone, Default)]
pub struct EmbeddedAssets {
    assets: HashMap<String, Arc<[u8]>>,
}

impl EmbeddedAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.assets.insert(name.into(), bytes.into());
        self
    }
}

#[async_trait]
impl PackagedAssets for EmbeddedAssets {
    async fn exists(&self, name: &str) -> bool {
        self.assets.contains_key(name)
    }

    async fn copy_to(&self, name: &str, dest: &Path) -> std::io::Result<()> {
        let bytes = self.assets.get(name).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no packaged asset {name}"))
        })?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .await?;
        file.write_all(&bytes).await?;
        file.sync_all().await
    }
}

/// One of the two retrieval strategies, chosen once at startup.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Materialise the complete original at `dest`.
    async fn fetch_into(&self, dest: &Path) -> ProvisionResult<()>;

    fn describe(&self) -> String;
}

pub struct PackagedAssetSource {
    name: String,
    assets: Arc<dyn PackagedAssets>,
}

impl PackagedAssetSource {
    pub fn new(name: impl Into<String>, assets: Arc<dyn PackagedAssets>) -> Self {
        Self { name: name.into(), assets }
    }
}

#[async_trait]
impl AssetSource for PackagedAssetSource {
    async fn fetch_into(&self, dest: &Path) -> ProvisionResult<()> {
        if !self.assets.exists(&self.name).await {
            return Err(ProvisioningError::SourceUnavailable { name: self.name.clone(), source: None });
        }
        self.assets.copy_to(&self.name, dest).await.map_err(|err| {
            ProvisioningError::SourceUnavailable { name: self.name.clone(), source: Some(Arc::new(err)) }
        })
    }

    fn describe(&self) -> String {
        format!("packaged:{}", self.name)
    }
}

pub struct BundleFileSource {
    path: PathBuf,
}

impl BundleFileSource {
    pub fn new(bundle_root: &Path, name: &str) -> Self {
        Self { path: bundle_root.join(name) }
    }
}

#[async_trait]
impl AssetSource for BundleFileSource {
    async fn fetch_into(&self, dest: &Path) -> ProvisionResult<()> {
        let unavailable = |err: std::io::Error| ProvisioningError::SourceUnavailable {
            name: self.path.display().to_string(),
            source: Some(Arc::new(err)),
        };
        let meta = tokio::fs::metadata(&self.path).await.map_err(unavailable)?;
        if !meta.is_file() {
            return Err(ProvisioningError::SourceUnavailable {
                name: self.path.display().to_string(),
                source: None,
            });
        }
        tokio::fs::copy(&self.path, dest).await.map_err(unavailable)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("bundle:{}", self.path.display())
    }
}

/// Resolved destination directory plus the strategy that fills it.
#[derive(Clone)]
pub struct SourceLocator {
    destination_dir: PathBuf,
    source: Arc<dyn AssetSource>,
}

impl fmt::Debug for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceLocator")
            .field("destination_dir", &self.destination_dir)
            .field("source", &self.source.describe())
            .finish()
    }
}

impl SourceLocator {
    pub fn new(destination_dir: impl Into<PathBuf>, source: Arc<dyn AssetSource>) -> Self {
        Self { destination_dir: destination_dir.into(), source }
    }

    /// `packaged` is required on Android and ignored elsewhere.
    pub fn for_platform(
        platform: Platform,
        config: &ProvisionConfig,
        packaged: Option<Arc<dyn PackagedAssets>>,
    ) -> ProvisionResult<Self> {
        let destination_dir = resolve_destination_dir(platform, config)?;
        let name = config.asset.expected_name.as_str();
        let source: Arc<dyn AssetSource> = if platform.uses_packaged_assets() {
            let assets = packaged.ok_or_else(|| {
                ProvisioningError::Configuration("no packaged asset reader supplied".to_string())
            })?;
            Arc::new(PackagedAssetSource::new(name, assets))
        } else {
            Arc::new(BundleFileSource::new(&resolve_bundle_root(config)?, name))
        };
        Ok(Self { destination_dir, source })
    }

    pub fn destination_dir(&self) -> &Path {
        &self.destination_dir
    }

    pub fn source(&self) -> &dyn AssetSource {
        self.source.as_ref()
    }
}

pub fn resolve_destination_dir(platform: Platform, config: &ProvisionConfig) -> ProvisionResult<PathBuf> {
    if platform.uses_packaged_assets() {
        return Ok(match &config.data_dir_override {
            Some(dir) => dir.clone(),
            None => PathBuf::from(format!("/data/data/{}/files", config.android_package)),
        });
    }
    let base = match &config.data_dir_override {
        Some(dir) => dir.clone(),
        None => ProjectDirs::from(&config.qualifier, &config.organization, &config.application)
            .map(|proj| proj.data_dir().to_path_buf())
            .ok_or_else(|| {
                ProvisioningError::Configuration("no application data directory on this platform".to_string())
            })?,
    };
    Ok(base.join(&config.subdirectory))
}

fn resolve_bundle_root(config: &ProvisionConfig) -> ProvisionResult<PathBuf> {
    if let Some(root) = &config.bundle_root {
        return Ok(root.clone());
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .ok_or_else(|| ProvisioningError::Configuration("cannot locate the application bundle".to_string()))
}
