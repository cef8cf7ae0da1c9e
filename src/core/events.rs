use crate::core::error::DownloadError;
use crate::core::model::{CacheStatus, DownloadStage, ExtensionId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    Downloading,
    Installing,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    DownloaderAddFailed,
    CrxFetchFailed,
    CrxFetchUrlEmpty,
    CrxFetchUrlInvalid,
    ManifestFetchFailed,
    ManifestInvalid,
    NoUpdate,
    InstallRejected,
}

impl FailureReason {
    /// `Disabled` is not a failure of the check itself and reports nothing.
    pub fn from_download_error(err: DownloadError) -> Option<Self> {
        match err {
            DownloadError::CrxFetchFailed => Some(Self::CrxFetchFailed),
            DownloadError::CrxFetchUrlEmpty => Some(Self::CrxFetchUrlEmpty),
            DownloadError::CrxFetchUrlInvalid => Some(Self::CrxFetchUrlInvalid),
            DownloadError::ManifestFetchFailed => Some(Self::ManifestFetchFailed),
            DownloadError::ManifestInvalid => Some(Self::ManifestInvalid),
            DownloadError::NoUpdateAvailable => Some(Self::NoUpdate),
            DownloadError::Disabled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    /// A check covering every extension has begun.
    UpdatingStarted,
    CheckStarted { request_id: RequestId, explicit_ids: usize },
    CheckFinished { request_id: RequestId },
    ChecksAbandoned { count: usize },
    InstallStage { extension_id: ExtensionId, stage: InstallStage },
    DownloadStage { extension_id: ExtensionId, stage: DownloadStage },
    CacheStatus { extension_id: ExtensionId, status: CacheStatus },
    Failure { extension_id: ExtensionId, reason: FailureReason, detail: Option<String> },
    UpdateAvailable { extension_id: ExtensionId, version: String },
    Installed { extension_id: ExtensionId, version: String },
    Error { scope: String, message: String },
}
