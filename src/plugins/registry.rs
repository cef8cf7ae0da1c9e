use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use crate::core::error::UpdateServiceError;
use crate::core::model::{
    CrxFileInfo, ExtensionId, ExtensionInfo, InstallOptions, PendingExtensionInfo, PendingFetch,
    UpdateCheckParams, UpdateCheckReport,
};
use crate::core::sequence::{DelegateHandle, InstallNotifier};

/// Per-extension fetcher. Outcomes are reported through the `DelegateHandle`
/// it was built with, never by return value.
pub trait Downloader: Send {
    fn name(&self) -> &'static str;

    /// Queues a fetch. `false` means the extension is not eligible and will
    /// produce no callback.
    fn add_pending(&mut self, fetch: PendingFetch) -> bool;

    fn start_all_pending(&mut self, cache: Option<Arc<dyn ExtensionCache>>);
}

pub type DownloaderFactory = Box<dyn Fn(DelegateHandle) -> Box<dyn Downloader> + Send + Sync>;

/// Batched update path: one call covers many extensions.
#[async_trait]
pub trait UpdateService: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start_update_check(&self, params: UpdateCheckParams) -> Result<UpdateCheckReport, UpdateServiceError>;
}

/// Installed-extension registry plus the delayed-install hooks of the service
/// that owns it.
#[async_trait]
pub trait ExtensionService: Send + Sync {
    async fn installed_extensions(&self) -> Vec<ExtensionInfo>;
    async fn get_extension(&self, id: &str) -> Option<ExtensionInfo>;
    async fn is_extension_enabled(&self, id: &str) -> bool;

    /// Version of an update that was staged but not yet applied.
    async fn pending_update_version(&self, id: &str) -> Option<String>;
    async fn finish_delayed_installation_if_ready(&self, id: &str, install_immediately: bool) -> bool;
}

#[async_trait]
pub trait PendingExtensionRegistry: Send + Sync {
    async fn pending_ids_for_update_check(&self) -> Vec<ExtensionId>;
    async fn get_pending(&self, id: &str) -> Option<PendingExtensionInfo>;
    async fn is_id_pending(&self, id: &str) -> bool;
    async fn has_high_priority_pending(&self) -> bool;
}

#[async_trait]
pub trait Installer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` takes ownership of the install; the notifier must then be
    /// finished exactly once. `false` leaves the file with the caller.
    /// Must return without waiting on the notifier.
    async fn update_extension(
        &self,
        file: CrxFileInfo,
        file_ownership_passed: bool,
        options: InstallOptions,
        notifier: InstallNotifier,
    ) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCrx {
    pub path: PathBuf,
    pub version: String,
}

#[async_trait]
pub trait ExtensionCache: Send + Sync {
    async fn get_extension(&self, id: &str, expected_hash: Option<&str>) -> Option<CachedCrx>;
    async fn put_extension(&self, info: &CrxFileInfo) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PrefsStore: Send + Sync {
    async fn last_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn set_last_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()>;
    async fn last_active_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>>;
    async fn set_last_active_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()>;
    async fn active_bit(&self, id: &str) -> anyhow::Result<bool>;
    async fn set_active_bit(&self, id: &str, active: bool) -> anyhow::Result<()>;
    async fn disable_reasons(&self, id: &str) -> anyhow::Result<u32>;
    async fn update_url_data(&self, id: &str) -> anyhow::Result<Option<String>>;
}

/// Everything the coordinator talks to, handed over at construction.
pub struct Collaborators {
    pub service: Arc<dyn ExtensionService>,
    pub pending: Arc<dyn PendingExtensionRegistry>,
    pub prefs: Arc<dyn PrefsStore>,
    pub installer: Arc<dyn Installer>,
    pub update_service: Option<Arc<dyn UpdateService>>,
    pub cache: Option<Arc<dyn ExtensionCache>>,
    pub downloader_factory: DownloaderFactory,
}

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            user_agent: "OrangeUpdater/0.1".to_string(),
            timeout_secs: 60,
            retries: 2,
            retry_backoff_ms: 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdaterCliConfig {
    pub fetch: FetchContext,
    pub webstore_url: Option<Url>,
    pub inventory: PathBuf,
    pub data_dir: PathBuf,
    pub use_update_service: bool,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut UpdaterCliConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::plugins::local::cli::LocalCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins.iter().fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, cfg: &mut UpdaterCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, cfg)?;
        }
        Ok(())
    }
}
