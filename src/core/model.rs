use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use url::Url;

pub type ExtensionId = String;
pub type RequestId = u64;
pub type InstallerId = u64;

/// Fired once when every part of a check has resolved.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handed back to the downloader after an install attempt. `true` asks it to
/// retry the fetch for the same requests.
pub type InstallCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Sentinel for "never pinged" in rollcall/active day counts.
pub const NEVER_PINGED: i32 = -1;

pub mod disable_reason {
    pub const USER_ACTION: u32 = 1;
    pub const REMOTELY_FOR_MALWARE: u32 = 1 << 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallLocation {
    Internal,
    ExternalPref,
    ExternalRegistry,
    ExternalPrefDownload,
    ExternalPolicy,
    ExternalPolicyDownload,
    ExternalComponent,
    Component,
    Unpacked,
    CommandLine,
}

impl InstallLocation {
    pub fn is_external(self) -> bool {
        matches!(
            self,
            Self::ExternalPref
                | Self::ExternalRegistry
                | Self::ExternalPrefDownload
                | Self::ExternalPolicy
                | Self::ExternalPolicyDownload
                | Self::ExternalComponent
        )
    }

    /// Only internal and external installs are kept up to date.
    pub fn is_auto_updateable(self) -> bool {
        self == Self::Internal || self.is_external()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    #[default]
    Enabled,
    Disabled,
    Blocklisted,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub id: ExtensionId,
    pub version: String,
    pub location: InstallLocation,
    /// Effective update URL, after any policy override.
    #[serde(default)]
    pub update_url: Option<Url>,
    #[serde(default)]
    pub converted_from_user_script: bool,
    #[serde(default)]
    pub state: ExtensionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExtensionInfo {
    pub id: ExtensionId,
    #[serde(default)]
    pub update_url: Option<Url>,
    pub install_source: InstallLocation,
    #[serde(default)]
    pub corrupt_reinstall_expected: bool,
    #[serde(default)]
    pub high_priority: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FetchPriority {
    #[default]
    Background,
    Foreground,
}

/// Parameters of one `check_now` call. Empty `ids` means "check everything".
#[derive(Default)]
pub struct CheckParams {
    pub ids: Vec<ExtensionId>,
    pub install_immediately: bool,
    pub fetch_priority: FetchPriority,
    pub callback: Option<CompletionCallback>,
}

impl CheckParams {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ExtensionId>,
    {
        Self { ids: ids.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn install_immediately(mut self, v: bool) -> Self {
        self.install_immediately = v;
        self
    }

    pub fn priority(mut self, p: FetchPriority) -> Self {
        self.fetch_priority = p;
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for CheckParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckParams")
            .field("ids", &self.ids)
            .field("install_immediately", &self.install_immediately)
            .field("fetch_priority", &self.fetch_priority)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    pub did_ping: bool,
    pub day_start: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingData {
    pub rollcall_days: i32,
    pub active_days: i32,
    pub is_enabled: bool,
    pub disable_reasons: u32,
}

impl Default for PingData {
    fn default() -> Self {
        Self { rollcall_days: NEVER_PINGED, active_days: 0, is_enabled: true, disable_reasons: 0 }
    }
}

/// One extension queued for the direct downloader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFetch {
    pub id: ExtensionId,
    pub update_url: Option<Url>,
    pub location: InstallLocation,
    pub is_corrupt_reinstall: bool,
    pub request_id: RequestId,
    pub priority: FetchPriority,
    /// Installed version; `None` for not-yet-installed extensions.
    pub version: Option<String>,
    pub update_url_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrxFileInfo {
    pub extension_id: ExtensionId,
    pub path: PathBuf,
    pub expected_version: String,
    pub expected_hash: Option<String>,
}

/// A downloaded CRX together with the checks waiting on it.
pub struct FetchedArtifact {
    pub info: CrxFileInfo,
    pub file_ownership_passed: bool,
    pub request_ids: BTreeSet<RequestId>,
    pub install_callback: Option<InstallCallback>,
}

impl fmt::Debug for FetchedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedArtifact")
            .field("info", &self.info)
            .field("file_ownership_passed", &self.file_ownership_passed)
            .field("request_ids", &self.request_ids)
            .field("install_callback", &self.install_callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtensionUpdateData {
    pub is_corrupt_reinstall: bool,
}

/// Input of the single batched update-service call of a check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateCheckParams {
    pub update_info: BTreeMap<ExtensionId, ExtensionUpdateData>,
    pub priority: FetchPriority,
    pub install_immediately: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateCheckReport {
    pub updates_available: Vec<(ExtensionId, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstallOptions {
    pub install_immediately: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallOutcome {
    /// Version now installed (or staged); `None` when nothing was installed.
    pub installed_version: Option<String>,
    pub verification_check_failed: bool,
}

impl InstallOutcome {
    pub fn installed(version: impl Into<String>) -> Self {
        Self { installed_version: Some(version.into()), verification_check_failed: false }
    }

    pub fn verification_failed() -> Self {
        Self { installed_version: None, verification_check_failed: true }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStage {
    Pending,
    QueuedForManifest,
    DownloadingManifest,
    ParsingManifest,
    ManifestLoaded,
    QueuedForCrx,
    DownloadingCrx,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Disabled,
    Miss,
    HitOnManifestFetchFailure,
    Hit,
}

/// Dotted numeric version ("1.2.0.15"), compared component-wise with
/// missing trailing components treated as zero.
#[derive(Debug, Clone)]
pub struct ExtensionVersion(Vec<u32>);

impl ExtensionVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let parts = s
            .split('.')
            .map(|p| p.parse::<u32>().ok())
            .collect::<Option<Vec<u32>>>()?;
        Some(Self(parts))
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl Ord for ExtensionVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let n = self.0.len().max(other.0.len());
        for i in 0..n {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                o => return o,
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for ExtensionVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ExtensionVersion {}

impl PartialOrd for ExtensionVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExtensionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}
