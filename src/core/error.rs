use crate::core::model::RequestId;

#[derive(thiserror::Error, Debug)]
pub enum UpdaterError {
    #[error("updater is not running")]
    NotRunning,

    #[error("updater is already running")]
    AlreadyRunning,

    #[error("updater sequence has shut down")]
    SequenceClosed,

    /// The check was dropped by `stop()` before it resolved.
    #[error("update check {0} was abandoned before completion")]
    Abandoned(RequestId),
}

/// Why a single extension's fetch ended without a CRX.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadError {
    #[error("crx fetch failed")]
    CrxFetchFailed,
    #[error("crx fetch url empty")]
    CrxFetchUrlEmpty,
    #[error("crx fetch url invalid")]
    CrxFetchUrlInvalid,
    #[error("manifest fetch failed")]
    ManifestFetchFailed,
    #[error("manifest invalid")]
    ManifestInvalid,
    #[error("no update available")]
    NoUpdateAvailable,
    /// Updates are turned off; nothing was attempted.
    #[error("updates disabled")]
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureData {
    pub response_code: Option<u16>,
    pub fetch_tries: u32,
    pub additional_info: Option<String>,
    pub manifest_invalid_error: Option<String>,
}

impl FailureData {
    pub fn with_info(info: impl Into<String>) -> Self {
        Self { additional_info: Some(info.into()), ..Self::default() }
    }

    pub fn manifest_invalid(err: impl Into<String>) -> Self {
        Self { manifest_invalid_error: Some(err.into()), ..Self::default() }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateServiceError {
    #[error("update service unavailable: {0}")]
    Unavailable(String),

    #[error("update service returned an invalid response: {0}")]
    InvalidResponse(String),
}
