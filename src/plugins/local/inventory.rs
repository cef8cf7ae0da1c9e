//! Installed and pending extensions kept in a JSON file.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::model::{ExtensionId, ExtensionInfo, ExtensionState, PendingExtensionInfo};
use crate::plugins::registry::{ExtensionService, PendingExtensionRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    #[serde(flatten)]
    pub info: ExtensionInfo,
    /// Updates to an in-use extension are staged until it goes idle.
    #[serde(default)]
    pub in_use: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedInstall {
    pub version: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryFile {
    #[serde(default)]
    pub installed: Vec<InstalledRecord>,
    #[serde(default)]
    pub pending: Vec<PendingExtensionInfo>,
    #[serde(default)]
    pub delayed: BTreeMap<ExtensionId, DelayedInstall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDisposition {
    Installed,
    Delayed,
}

pub struct Inventory {
    path: Option<PathBuf>,
    state: RwLock<InventoryFile>,
}

impl Inventory {
    /// A missing file is an empty inventory; it is created on first write.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let file = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("parse inventory {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => InventoryFile::default(),
            Err(e) => return Err(e).with_context(|| format!("read inventory {}", path.display())),
        };
        Ok(Self { path: Some(path.to_path_buf()), state: RwLock::new(file) })
    }

    pub fn in_memory(file: InventoryFile) -> Self {
        Self { path: None, state: RwLock::new(file) }
    }

    pub async fn snapshot(&self) -> InventoryFile {
        self.state.read().await.clone()
    }

    pub async fn knows(&self, id: &str) -> bool {
        let s = self.state.read().await;
        s.installed.iter().any(|r| r.info.id == id) || s.pending.iter().any(|p| p.id == id)
    }

    async fn save(&self, file: &InventoryFile) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(file)?).await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path).await
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    /// Applies (or stages) a freshly installed version. A pending extension
    /// becomes an installed one.
    pub async fn record_install(
        &self,
        id: &str,
        version: &str,
        path: &Path,
        install_immediately: bool,
    ) -> anyhow::Result<InstallDisposition> {
        let mut s = self.state.write().await;

        if let Some(rec) = s.installed.iter_mut().find(|r| r.info.id == id) {
            if rec.in_use && !install_immediately {
                debug!(extension_id = id, version, "extension in use, staging update");
                s.delayed.insert(id.to_string(), DelayedInstall { version: version.to_string(), path: path.to_path_buf() });
                self.save(&s).await?;
                return Ok(InstallDisposition::Delayed);
            }
            rec.info.version = version.to_string();
        } else {
            let pos = s.pending.iter().position(|p| p.id == id)
                .ok_or_else(|| anyhow::anyhow!("extension {} is neither installed nor pending", id))?;
            let pending = s.pending.remove(pos);
            s.installed.push(InstalledRecord {
                info: ExtensionInfo {
                    id: pending.id,
                    version: version.to_string(),
                    location: pending.install_source,
                    update_url: pending.update_url,
                    converted_from_user_script: false,
                    state: ExtensionState::Enabled,
                },
                in_use: false,
            });
        }
        s.delayed.remove(id);
        self.save(&s).await?;
        Ok(InstallDisposition::Installed)
    }

    pub async fn set_in_use(&self, id: &str, in_use: bool) -> anyhow::Result<()> {
        let mut s = self.state.write().await;
        let rec = s.installed.iter_mut().find(|r| r.info.id == id)
            .ok_or_else(|| anyhow::anyhow!("extension {} is not installed", id))?;
        rec.in_use = in_use;
        self.save(&s).await
    }
}

#[async_trait]
impl ExtensionService for Inventory {
    async fn installed_extensions(&self) -> Vec<ExtensionInfo> {
        self.state.read().await.installed.iter().map(|r| r.info.clone()).collect()
    }

    async fn get_extension(&self, id: &str) -> Option<ExtensionInfo> {
        self.state.read().await.installed.iter().find(|r| r.info.id == id).map(|r| r.info.clone())
    }

    async fn is_extension_enabled(&self, id: &str) -> bool {
        self.state.read().await.installed.iter()
            .any(|r| r.info.id == id && r.info.state == ExtensionState::Enabled)
    }

    async fn pending_update_version(&self, id: &str) -> Option<String> {
        self.state.read().await.delayed.get(id).map(|d| d.version.clone())
    }

    async fn finish_delayed_installation_if_ready(&self, id: &str, install_immediately: bool) -> bool {
        let mut s = self.state.write().await;
        let Some(delayed) = s.delayed.get(id).cloned() else {
            return false;
        };
        let Some(rec) = s.installed.iter_mut().find(|r| r.info.id == id) else {
            return false;
        };
        if rec.in_use && !install_immediately {
            return false;
        }
        rec.info.version = delayed.version.clone();
        s.delayed.remove(id);
        if let Err(e) = self.save(&s).await {
            tracing::warn!(extension_id = id, error = %e, "failed to persist inventory");
        }
        info!(extension_id = id, version = %delayed.version, "applied delayed update");
        true
    }
}

#[async_trait]
impl PendingExtensionRegistry for Inventory {
    async fn pending_ids_for_update_check(&self) -> Vec<ExtensionId> {
        self.state.read().await.pending.iter().map(|p| p.id.clone()).collect()
    }

    async fn get_pending(&self, id: &str) -> Option<PendingExtensionInfo> {
        self.state.read().await.pending.iter().find(|p| p.id == id).cloned()
    }

    async fn is_id_pending(&self, id: &str) -> bool {
        self.state.read().await.pending.iter().any(|p| p.id == id)
    }

    async fn has_high_priority_pending(&self) -> bool {
        self.state.read().await.pending.iter().any(|p| p.high_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::InstallLocation;

    fn installed(id: &str, version: &str, in_use: bool) -> InstalledRecord {
        InstalledRecord {
            info: ExtensionInfo {
                id: id.to_string(),
                version: version.to_string(),
                location: InstallLocation::Internal,
                update_url: None,
                converted_from_user_script: false,
                state: ExtensionState::Enabled,
            },
            in_use,
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_created_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inv.json");
        let inv = Inventory::load(&path).await.unwrap();
        assert!(inv.installed_extensions().await.is_empty());

        inv.state.write().await.pending.push(PendingExtensionInfo {
            id: "p".into(),
            update_url: None,
            install_source: InstallLocation::ExternalPolicyDownload,
            corrupt_reinstall_expected: false,
            high_priority: true,
        });
        assert!(inv.has_high_priority_pending().await);
        assert_eq!(inv.record_install("p", "1.0", Path::new("/x.crx"), false).await.unwrap(), InstallDisposition::Installed);

        let reloaded = Inventory::load(&path).await.unwrap();
        let ext = reloaded.get_extension("p").await.unwrap();
        assert_eq!(ext.version, "1.0");
        assert_eq!(ext.location, InstallLocation::ExternalPolicyDownload);
        assert!(!reloaded.is_id_pending("p").await);
    }

    #[tokio::test]
    async fn in_use_extension_gets_a_delayed_update() {
        let inv = Inventory::in_memory(InventoryFile { installed: vec![installed("a", "1.0", true)], ..Default::default() });
        assert_eq!(inv.record_install("a", "2.0", Path::new("/a.crx"), false).await.unwrap(), InstallDisposition::Delayed);
        assert_eq!(inv.get_extension("a").await.unwrap().version, "1.0");
        assert_eq!(inv.pending_update_version("a").await.as_deref(), Some("2.0"));

        assert!(!inv.finish_delayed_installation_if_ready("a", false).await);
        assert!(inv.finish_delayed_installation_if_ready("a", true).await);
        assert_eq!(inv.get_extension("a").await.unwrap().version, "2.0");
        assert_eq!(inv.pending_update_version("a").await, None);
    }

    #[tokio::test]
    async fn install_immediately_skips_staging() {
        let inv = Inventory::in_memory(InventoryFile { installed: vec![installed("a", "1.0", true)], ..Default::default() });
        assert_eq!(inv.record_install("a", "2.0", Path::new("/a.crx"), true).await.unwrap(), InstallDisposition::Installed);
        assert_eq!(inv.get_extension("a").await.unwrap().version, "2.0");
    }

    #[tokio::test]
    async fn unknown_extension_cannot_be_recorded() {
        let inv = Inventory::in_memory(InventoryFile::default());
        assert!(inv.record_install("ghost", "1.0", Path::new("/g.crx"), false).await.is_err());
        assert!(!inv.knows("ghost").await);
    }

    #[test]
    fn parses_flattened_records() {
        let f: InventoryFile = serde_json::from_str(
            r#"{"installed": [{"id": "a", "version": "1.0", "location": "internal", "in_use": true,
                               "update_url": "https://example.com/u"}],
                "pending": [{"id": "b", "install_source": "external_pref"}]}"#,
        )
        .unwrap();
        assert!(f.installed[0].in_use);
        assert_eq!(f.installed[0].info.state, ExtensionState::Enabled);
        assert_eq!(f.pending[0].install_source, InstallLocation::ExternalPref);
    }
}
