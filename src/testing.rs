//! In-memory collaborators for driving an `UpdateCoordinator` in tests.
//!
//! Every fake records what it was asked to do and exposes a probe so a test
//! can play the other side: answer as the downloader, finish an install, or
//! release a held update-service call.
//!
//! ```ignore
//! let bed = TestBed::new().with_update_service(ScriptedUpdateService::ok());
//! bed.extensions.add_installed(installed("a", "1.0"));
//! let coordinator = UpdateCoordinator::new(UpdaterConfig::default(), bed.collaborators());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use url::Url;

use crate::core::config::WEBSTORE_UPDATE_URL;
use crate::core::error::UpdateServiceError;
use crate::core::model::{
    CrxFileInfo, ExtensionId, ExtensionInfo, ExtensionState, InstallLocation, InstallOptions, InstallOutcome,
    PendingExtensionInfo, PendingFetch, UpdateCheckParams, UpdateCheckReport,
};
use crate::core::sequence::{DelegateHandle, InstallNotifier};
use crate::core::store::MemoryPrefs;
use crate::plugins::registry::{
    CachedCrx, Collaborators, Downloader, DownloaderFactory, ExtensionCache, ExtensionService, Installer,
    PendingExtensionRegistry, UpdateService,
};

/// Installed extension with its own (non-gallery) update URL.
pub fn installed(id: &str, version: &str) -> ExtensionInfo {
    ExtensionInfo {
        id: id.to_string(),
        version: version.to_string(),
        location: InstallLocation::Internal,
        update_url: Some(Url::parse(&format!("https://updates.example.com/{}", id)).expect("test url")),
        converted_from_user_script: false,
        state: ExtensionState::Enabled,
    }
}

/// Installed extension updating from the gallery.
pub fn webstore_installed(id: &str, version: &str) -> ExtensionInfo {
    ExtensionInfo {
        update_url: Some(Url::parse(WEBSTORE_UPDATE_URL).expect("webstore url")),
        ..installed(id, version)
    }
}

pub fn pending(id: &str) -> PendingExtensionInfo {
    PendingExtensionInfo {
        id: id.to_string(),
        update_url: Some(Url::parse(&format!("https://updates.example.com/{}", id)).expect("test url")),
        install_source: InstallLocation::ExternalPolicyDownload,
        corrupt_reinstall_expected: false,
        high_priority: false,
    }
}

#[derive(Default)]
struct ExtensionsState {
    installed: Vec<ExtensionInfo>,
    pending: Vec<PendingExtensionInfo>,
    delayed: HashMap<ExtensionId, String>,
    finished_delayed: Vec<(ExtensionId, bool)>,
}

/// `ExtensionService` and `PendingExtensionRegistry` over plain vectors.
#[derive(Default)]
pub struct FakeExtensions {
    state: Mutex<ExtensionsState>,
}

impl FakeExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_installed(&self, info: ExtensionInfo) {
        self.state.lock().installed.push(info);
    }

    pub fn add_pending(&self, info: PendingExtensionInfo) {
        self.state.lock().pending.push(info);
    }

    pub fn set_delayed(&self, id: &str, version: &str) {
        self.state.lock().delayed.insert(id.to_string(), version.to_string());
    }

    /// Calls made to `finish_delayed_installation_if_ready`.
    pub fn finished_delayed(&self) -> Vec<(ExtensionId, bool)> {
        self.state.lock().finished_delayed.clone()
    }
}

#[async_trait]
impl ExtensionService for FakeExtensions {
    async fn installed_extensions(&self) -> Vec<ExtensionInfo> {
        self.state.lock().installed.clone()
    }

    async fn get_extension(&self, id: &str) -> Option<ExtensionInfo> {
        self.state.lock().installed.iter().find(|e| e.id == id).cloned()
    }

    async fn is_extension_enabled(&self, id: &str) -> bool {
        self.state.lock().installed.iter().any(|e| e.id == id && e.state == ExtensionState::Enabled)
    }

    async fn pending_update_version(&self, id: &str) -> Option<String> {
        self.state.lock().delayed.get(id).cloned()
    }

    async fn finish_delayed_installation_if_ready(&self, id: &str, install_immediately: bool) -> bool {
        let mut s = self.state.lock();
        s.finished_delayed.push((id.to_string(), install_immediately));
        s.delayed.remove(id).is_some()
    }
}

#[async_trait]
impl PendingExtensionRegistry for FakeExtensions {
    async fn pending_ids_for_update_check(&self) -> Vec<ExtensionId> {
        self.state.lock().pending.iter().map(|p| p.id.clone()).collect()
    }

    async fn get_pending(&self, id: &str) -> Option<PendingExtensionInfo> {
        self.state.lock().pending.iter().find(|p| p.id == id).cloned()
    }

    async fn is_id_pending(&self, id: &str) -> bool {
        self.state.lock().pending.iter().any(|p| p.id == id)
    }

    async fn has_high_priority_pending(&self) -> bool {
        self.state.lock().pending.iter().any(|p| p.high_priority)
    }
}

#[derive(Default)]
struct DownloaderLog {
    added: Vec<PendingFetch>,
    starts: usize,
    created: usize,
    delegate: Option<DelegateHandle>,
    reject: HashSet<ExtensionId>,
}

/// Shared view of whatever `RecordingDownloader` the coordinator created.
#[derive(Clone, Default)]
pub struct DownloaderProbe {
    log: Arc<Mutex<DownloaderLog>>,
}

impl DownloaderProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> DownloaderFactory {
        let log = self.log.clone();
        Box::new(move |delegate: DelegateHandle| -> Box<dyn Downloader> {
            let mut l = log.lock();
            l.created += 1;
            l.delegate = Some(delegate);
            Box::new(RecordingDownloader { log: log.clone() })
        })
    }

    /// `add_pending` for this id will return `false`.
    pub fn reject(&self, id: &str) {
        self.log.lock().reject.insert(id.to_string());
    }

    pub fn added(&self) -> Vec<PendingFetch> {
        self.log.lock().added.clone()
    }

    pub fn added_ids(&self) -> Vec<ExtensionId> {
        self.log.lock().added.iter().map(|f| f.id.clone()).collect()
    }

    pub fn starts(&self) -> usize {
        self.log.lock().starts
    }

    pub fn created(&self) -> usize {
        self.log.lock().created
    }

    /// Handle of the most recently created downloader.
    pub fn delegate(&self) -> Option<DelegateHandle> {
        self.log.lock().delegate.clone()
    }
}

pub struct RecordingDownloader {
    log: Arc<Mutex<DownloaderLog>>,
}

impl Downloader for RecordingDownloader {
    fn name(&self) -> &'static str {
        "recording-downloader"
    }

    fn add_pending(&mut self, fetch: PendingFetch) -> bool {
        let mut l = self.log.lock();
        if l.reject.contains(&fetch.id) {
            return false;
        }
        l.added.push(fetch);
        true
    }

    fn start_all_pending(&mut self, _cache: Option<Arc<dyn ExtensionCache>>) {
        self.log.lock().starts += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerMode {
    /// Accept and immediately report the expected version installed.
    AutoComplete,
    /// Accept and hold the notifier until the test finishes it.
    Manual,
    Reject,
}

#[derive(Debug, Clone)]
pub struct InstallCall {
    pub file: CrxFileInfo,
    pub file_ownership_passed: bool,
    pub options: InstallOptions,
}

pub struct RecordingInstaller {
    mode: Mutex<InstallerMode>,
    calls: Mutex<Vec<InstallCall>>,
    held: Mutex<Vec<InstallNotifier>>,
}

impl RecordingInstaller {
    pub fn new(mode: InstallerMode) -> Self {
        Self { mode: Mutex::new(mode), calls: Mutex::new(vec![]), held: Mutex::new(vec![]) }
    }

    pub fn set_mode(&self, mode: InstallerMode) {
        *self.mode.lock() = mode;
    }

    pub fn calls(&self) -> Vec<InstallCall> {
        self.calls.lock().clone()
    }

    /// Oldest install still waiting to be finished (manual mode).
    pub fn take_held(&self) -> Option<InstallNotifier> {
        let mut held = self.held.lock();
        if held.is_empty() {
            None
        } else {
            Some(held.remove(0))
        }
    }
}

#[async_trait]
impl Installer for RecordingInstaller {
    fn name(&self) -> &'static str {
        "recording-installer"
    }

    async fn update_extension(
        &self,
        file: CrxFileInfo,
        file_ownership_passed: bool,
        options: InstallOptions,
        notifier: InstallNotifier,
    ) -> bool {
        let mode = *self.mode.lock();
        if mode == InstallerMode::Reject {
            return false;
        }
        let version = file.expected_version.clone();
        self.calls.lock().push(InstallCall { file, file_ownership_passed, options });
        match mode {
            InstallerMode::AutoComplete => notifier.done(InstallOutcome::installed(version)),
            _ => self.held.lock().push(notifier),
        }
        true
    }
}

/// Update service returning a fixed answer, optionally held until released.
pub struct ScriptedUpdateService {
    result: Mutex<Result<UpdateCheckReport, UpdateServiceError>>,
    calls: Mutex<Vec<UpdateCheckParams>>,
    gate: Option<Notify>,
}

impl ScriptedUpdateService {
    pub fn ok() -> Self {
        Self::with_result(Ok(UpdateCheckReport::default()))
    }

    pub fn with_result(result: Result<UpdateCheckReport, UpdateServiceError>) -> Self {
        Self { result: Mutex::new(result), calls: Mutex::new(vec![]), gate: None }
    }

    /// Calls block until `release` is called once per call.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Notify::new());
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<UpdateCheckParams> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpdateService for ScriptedUpdateService {
    fn name(&self) -> &'static str {
        "scripted-update-service"
    }

    async fn start_update_check(&self, params: UpdateCheckParams) -> Result<UpdateCheckReport, UpdateServiceError> {
        self.calls.lock().push(params);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.result.lock().clone()
    }
}

/// Cache that remembers what was put and serves configured hits.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<ExtensionId, CachedCrx>>,
    puts: Mutex<Vec<CrxFileInfo>>,
}

impl MemoryCache {
    pub fn insert(&self, id: &str, crx: CachedCrx) {
        self.entries.lock().insert(id.to_string(), crx);
    }

    pub fn puts(&self) -> Vec<CrxFileInfo> {
        self.puts.lock().clone()
    }
}

#[async_trait]
impl ExtensionCache for MemoryCache {
    async fn get_extension(&self, id: &str, _expected_hash: Option<&str>) -> Option<CachedCrx> {
        self.entries.lock().get(id).cloned()
    }

    async fn put_extension(&self, info: &CrxFileInfo) -> anyhow::Result<()> {
        self.puts.lock().push(info.clone());
        Ok(())
    }
}

/// All fakes wired together.
pub struct TestBed {
    pub extensions: Arc<FakeExtensions>,
    pub prefs: Arc<MemoryPrefs>,
    pub installer: Arc<RecordingInstaller>,
    pub downloader: DownloaderProbe,
    pub update_service: Option<Arc<ScriptedUpdateService>>,
    pub cache: Option<Arc<MemoryCache>>,
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBed {
    pub fn new() -> Self {
        Self {
            extensions: Arc::new(FakeExtensions::new()),
            prefs: Arc::new(MemoryPrefs::new()),
            installer: Arc::new(RecordingInstaller::new(InstallerMode::AutoComplete)),
            downloader: DownloaderProbe::new(),
            update_service: None,
            cache: None,
        }
    }

    pub fn with_update_service(mut self, service: ScriptedUpdateService) -> Self {
        self.update_service = Some(Arc::new(service));
        self
    }

    pub fn with_cache(mut self) -> Self {
        self.cache = Some(Arc::new(MemoryCache::default()));
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            service: self.extensions.clone(),
            pending: self.extensions.clone(),
            prefs: self.prefs.clone(),
            installer: self.installer.clone(),
            update_service: self.update_service.clone().map(|s| s as Arc<dyn UpdateService>),
            cache: self.cache.clone().map(|c| c as Arc<dyn ExtensionCache>),
            downloader_factory: self.downloader.factory(),
        }
    }
}
