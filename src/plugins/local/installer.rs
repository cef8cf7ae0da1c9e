use async_trait::async_trait;
use sanitize_filename::sanitize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::model::{CrxFileInfo, InstallOptions, InstallOutcome};
use crate::core::sequence::InstallNotifier;
use crate::plugins::local::inventory::{InstallDisposition, Inventory};
use crate::plugins::registry::Installer;

/// Installs a CRX by placing it at `<install_dir>/<id>/<version>.crx` and
/// recording the version in the inventory. Nothing is unpacked.
pub struct DirectoryInstaller {
    install_dir: PathBuf,
    inventory: Arc<Inventory>,
}

impl DirectoryInstaller {
    pub fn new(install_dir: PathBuf, inventory: Arc<Inventory>) -> Self {
        Self { install_dir, inventory }
    }

    fn target_path(&self, file: &CrxFileInfo) -> PathBuf {
        self.install_dir
            .join(sanitize(&file.extension_id))
            .join(format!("{}.crx", sanitize(&file.expected_version)))
    }
}

async fn place(src: &Path, dst: &Path, owned: bool) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if owned && tokio::fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dst).await?;
    if owned {
        tokio::fs::remove_file(src).await?;
    }
    Ok(())
}

async fn discard(path: &Path, owned: bool) {
    if owned {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to delete crx");
        }
    }
}

#[async_trait]
impl Installer for DirectoryInstaller {
    fn name(&self) -> &'static str {
        "directory-installer"
    }

    async fn update_extension(
        &self,
        file: CrxFileInfo,
        file_ownership_passed: bool,
        options: InstallOptions,
        notifier: InstallNotifier,
    ) -> bool {
        if !self.inventory.knows(&file.extension_id).await {
            debug!(extension_id = %file.extension_id, "not in inventory, refusing install");
            return false;
        }
        if tokio::fs::metadata(&file.path).await.is_err() {
            warn!(path = %file.path.display(), "crx to install does not exist");
            return false;
        }

        let target = self.target_path(&file);
        let inventory = self.inventory.clone();
        tokio::spawn(async move {
            let bytes = match tokio::fs::read(&file.path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "read crx failed");
                    notifier.done(InstallOutcome::failed());
                    return;
                }
            };
            if let Some(expected) = &file.expected_hash {
                let actual = format!("{:x}", Sha256::digest(&bytes));
                if !actual.eq_ignore_ascii_case(expected) {
                    warn!(extension_id = %file.extension_id, "crx does not match expected hash");
                    discard(&file.path, file_ownership_passed).await;
                    notifier.done(InstallOutcome::verification_failed());
                    return;
                }
            }
            notifier.expectations_verified().await;

            if let Err(e) = place(&file.path, &target, file_ownership_passed).await {
                warn!(target = %target.display(), error = %e, "placing crx failed");
                discard(&file.path, file_ownership_passed).await;
                notifier.done(InstallOutcome::failed());
                return;
            }

            match inventory
                .record_install(&file.extension_id, &file.expected_version, &target, options.install_immediately)
                .await
            {
                Ok(disposition) => {
                    let staged = disposition == InstallDisposition::Delayed;
                    debug!(extension_id = %file.extension_id, staged, "crx installed");
                    notifier.done(InstallOutcome::installed(file.expected_version.clone()));
                }
                Err(e) => {
                    warn!(extension_id = %file.extension_id, error = %e, "recording install failed");
                    notifier.done(InstallOutcome::failed());
                }
            }
        });
        true
    }
}
