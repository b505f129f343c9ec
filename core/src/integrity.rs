//! Cheap plausibility checks for a copied asset: it exists, clears a size
//! floor, and starts with the expected format signature.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::config::AssetDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inspection {
    Valid { size: u64 },
    Missing,
    TooSmall { size: u64 },
    BadSignature,
    Unreadable,
}

impl Inspection {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Valid { .. } => "valid",
            Self::Missing => "missing",
            Self::TooSmall { .. } => "too_small",
            Self::BadSignature => "bad_signature",
            Self::Unreadable => "unreadable",
        }
    }
}

/// Verdict source used by the coordinator. Never mutates the file and never
/// fails: I/O problems surface as an invalid [`Inspection`].
#[async_trait]
pub trait AssetCheck: Send + Sync {
    async fn inspect(&self, path: &Path) -> Inspection;

    async fn is_valid(&self, path: &Path) -> bool {
        self.inspect(path).await.is_valid()
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    minimum_size: u64,
    signature: Vec<u8>,
}

impl IntegrityChecker {
    pub fn new(descriptor: &AssetDescriptor) -> Self {
        Self {
            minimum_size: descriptor.minimum_valid_size_bytes,
            signature: descriptor.format_signature.clone(),
        }
    }
}

#[async_trait]
impl AssetCheck for IntegrityChecker {
    async fn inspect(&self, path: &Path) -> Inspection {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Inspection::Unreadable,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Inspection::Missing,
            Err(_) => return Inspection::Unreadable,
        };
        let size = meta.len();
        if size < self.minimum_size || size < self.signature.len() as u64 {
            return Inspection::TooSmall { size };
        }

        match read_header(path, self.signature.len()).await {
            Ok(header) if header == self.signature => Inspection::Valid { size },
            Ok(_) => Inspection::BadSignature,
            Err(_) => Inspection::Unreadable,
        }
    }
}

async fn read_header(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let mut header = vec![0u8; len];
    let mut file = tokio::fs::File::open(path).await?;
    file.read_exact(&mut header).await?;
    Ok(header)
}
