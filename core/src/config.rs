//! Build-time asset constants and the serde-loadable provisioning settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Bumped by the release process whenever the shipped dictionary changes.
pub const BUNDLE_VERSION: u32 = 5;
pub const ASSET_NAME: &str = "ejdict.sqlite3";
pub const SQLITE_SIGNATURE: &[u8] = b"SQLite format 3\0";

/// What a correct copy of the bundled asset looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetDescriptor {
    pub expected_name: String,
    /// Not read from config files: the compiled constant always wins.
    #[serde(skip)]
    pub bundle_version: u32,
    pub minimum_valid_size_bytes: u64,
    /// Post-copy floor, calibrated against the shipped ~6.7 MB dictionary.
    pub minimum_copy_size_bytes: u64,
    pub format_signature: Vec<u8>,
}

impl Default for AssetDescriptor {
    fn default() -> Self {
        Self {
            expected_name: ASSET_NAME.to_string(),
            bundle_version: BUNDLE_VERSION,
            minimum_valid_size_bytes: 512,
            minimum_copy_size_bytes: 1024 * 1024,
            format_signature: SQLITE_SIGNATURE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub qualifier: String,
    pub organization: String,
    pub application: String,
    pub android_package: String,
    pub subdirectory: String,
    pub asset: AssetDescriptor,
    /// Replaces the platform data directory; bundle platforms still append `subdirectory`.
    pub data_dir_override: Option<PathBuf>,
    /// Read-only root the bundle-file strategy copies from.
    pub bundle_root: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            qualifier: "com".to_string(),
            organization: "Lexis".to_string(),
            application: "Lexis".to_string(),
            android_package: "com.lexis".to_string(),
            subdirectory: "LocalDatabase".to_string(),
            asset: AssetDescriptor::default(),
            data_dir_override: None,
            bundle_root: None,
        }
    }
}

impl ProvisionConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(raw).context("failed to parse provisioning config")?;
        config.asset.bundle_version = BUNDLE_VERSION;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config = ProvisionConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ProvisionConfig::default());
        assert_eq!(config.asset.bundle_version, BUNDLE_VERSION);
    }

    #[test]
    fn partial_asset_override_keeps_compiled_version() {
        let config = ProvisionConfig::from_json_str(
            r#"{"subdirectory": "Dict", "asset": {"minimum_copy_size_bytes": 4096, "bundle_version": 99}}"#,
        )
        .unwrap();
        assert_eq!(config.subdirectory, "Dict");
        assert_eq!(config.asset.minimum_copy_size_bytes, 4096);
        assert_eq!(config.asset.expected_name, ASSET_NAME);
        assert_eq!(config.asset.bundle_version, BUNDLE_VERSION);
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(ProvisionConfig::from_json_str("{not json").is_err());
    }
}
