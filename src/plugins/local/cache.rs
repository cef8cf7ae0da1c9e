use anyhow::Context;
use async_trait::async_trait;
use sanitize_filename::sanitize;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

use crate::core::model::CrxFileInfo;
use crate::plugins::registry::{CachedCrx, ExtensionCache};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    version: String,
    hash_sha256: String,
}

/// Keeps the last verified CRX of each extension as `<id>.crx` with a
/// `<id>.json` sidecar.
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn crx_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.crx", sanitize(id)))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(id)))
    }
}

#[async_trait]
impl ExtensionCache for DirCache {
    async fn get_extension(&self, id: &str, expected_hash: Option<&str>) -> Option<CachedCrx> {
        let raw = tokio::fs::read(self.meta_path(id)).await.ok()?;
        let meta: CacheMeta = serde_json::from_slice(&raw).ok()?;
        if let Some(expected) = expected_hash {
            if !meta.hash_sha256.eq_ignore_ascii_case(expected) {
                debug!(extension_id = id, "cached crx has a different hash");
                return None;
            }
        }
        let path = self.crx_path(id);
        tokio::fs::metadata(&path).await.ok()?;
        Some(CachedCrx { path, version: meta.version })
    }

    async fn put_extension(&self, info: &CrxFileInfo) -> anyhow::Result<()> {
        let dst = self.crx_path(&info.extension_id);
        if dst == info.path {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await
            .with_context(|| format!("create_dir_all {}", self.dir.display()))?;
        let bytes = tokio::fs::read(&info.path).await
            .with_context(|| format!("read {}", info.path.display()))?;
        let meta = CacheMeta {
            version: info.expected_version.clone(),
            hash_sha256: format!("{:x}", Sha256::digest(&bytes)),
        };
        tokio::fs::write(&dst, &bytes).await?;
        tokio::fs::write(self.meta_path(&info.extension_id), serde_json::to_vec(&meta)?).await?;
        debug!(extension_id = %info.extension_id, version = %meta.version, "crx cached");
        Ok(())
    }
}
