//! Message plumbing between the coordinator's owning task and everything
//! that runs outside it.
//!
//! Collaborators never touch coordinator state. They post a `Command` tagged
//! with the epoch their handle was minted in; once `stop()` bumps the epoch
//! (and cancels the token) those commands are dropped on arrival.

use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::error::{DownloadError, FailureData, UpdateServiceError, UpdaterError};
use crate::core::model::{
    CacheStatus, CheckParams, CrxFileInfo, DownloadStage, ExtensionId, InstallCallback, InstallOutcome,
    InstallerId, PingData, PingResult, RequestId, UpdateCheckReport,
};
use crate::core::tracker::CheckSnapshot;

pub(crate) type Ack<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Start { ack: Ack<Result<(), UpdaterError>> },
    Stop { ack: Ack<()> },
    CheckNow { params: CheckParams, ack: Ack<Result<RequestId, UpdaterError>> },
    CheckSoon { ack: Ack<Result<(), UpdaterError>> },
    WillCheckSoon { ack: Ack<bool> },
    Snapshot { ack: Ack<Vec<CheckSnapshot>> },
    Shutdown { ack: Ack<()> },
    Scheduled { epoch: u64, task: ScheduledTask },
    Downloader { epoch: u64, event: DownloaderEvent },
    Query { epoch: u64, query: DelegateQuery },
    UpdateServiceFinished {
        epoch: u64,
        request_id: RequestId,
        batched: Vec<ExtensionId>,
        result: Result<UpdateCheckReport, UpdateServiceError>,
    },
    Installer { epoch: u64, installer_id: InstallerId, event: InstallerEvent },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScheduledTask {
    NextCheck,
    DoCheckSoon,
}

pub(crate) enum DownloaderEvent {
    Failed {
        id: ExtensionId,
        error: DownloadError,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        data: FailureData,
    },
    Finished {
        file: CrxFileInfo,
        file_ownership_passed: bool,
        download_url: Url,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        install_callback: Option<InstallCallback>,
    },
    StageChanged { id: ExtensionId, stage: DownloadStage },
    CacheStatus { id: ExtensionId, status: CacheStatus },
}

pub(crate) enum DelegateQuery {
    PingData { id: ExtensionId, reply: Ack<PingData> },
    IsPending { id: ExtensionId, reply: Ack<bool> },
    ExistingVersion { id: ExtensionId, reply: Ack<Option<String>> },
}

pub(crate) enum InstallerEvent {
    ExpectationsVerified { ack: Ack<()> },
    Done(InstallOutcome),
}

/// Weak route back into the owning task, valid for one epoch.
#[derive(Clone)]
pub struct SequenceHandle {
    tx: mpsc::WeakUnboundedSender<Command>,
    epoch: u64,
    token: CancellationToken,
}

impl SequenceHandle {
    pub(crate) fn new(tx: mpsc::WeakUnboundedSender<Command>, epoch: u64, token: CancellationToken) -> Self {
        Self { tx, epoch, token }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Late posts after shutdown are dropped silently.
    pub(crate) fn post(&self, cmd: Command) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        match self.tx.upgrade() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }
}

/// What a `Downloader` uses to report back and to ask about extensions.
#[derive(Clone)]
pub struct DelegateHandle {
    seq: SequenceHandle,
}

impl DelegateHandle {
    pub(crate) fn new(seq: SequenceHandle) -> Self {
        Self { seq }
    }

    pub fn is_cancelled(&self) -> bool {
        self.seq.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.seq.cancelled().await
    }

    pub fn download_failed(
        &self,
        id: &str,
        error: DownloadError,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        data: FailureData,
    ) {
        self.send(DownloaderEvent::Failed { id: id.to_string(), error, ping, request_ids, data });
    }

    pub fn download_finished(
        &self,
        file: CrxFileInfo,
        file_ownership_passed: bool,
        download_url: Url,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        install_callback: Option<InstallCallback>,
    ) {
        self.send(DownloaderEvent::Finished {
            file,
            file_ownership_passed,
            download_url,
            ping,
            request_ids,
            install_callback,
        });
    }

    pub fn stage_changed(&self, id: &str, stage: DownloadStage) {
        self.send(DownloaderEvent::StageChanged { id: id.to_string(), stage });
    }

    pub fn cache_status(&self, id: &str, status: CacheStatus) {
        self.send(DownloaderEvent::CacheStatus { id: id.to_string(), status });
    }

    /// `None` once the coordinator has stopped.
    pub async fn ping_data(&self, id: &str) -> Option<PingData> {
        let (reply, rx) = oneshot::channel();
        self.query(DelegateQuery::PingData { id: id.to_string(), reply });
        rx.await.ok()
    }

    pub async fn is_extension_pending(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        self.query(DelegateQuery::IsPending { id: id.to_string(), reply });
        rx.await.unwrap_or(false)
    }

    pub async fn existing_version(&self, id: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.query(DelegateQuery::ExistingVersion { id: id.to_string(), reply });
        rx.await.ok().flatten()
    }

    fn send(&self, event: DownloaderEvent) {
        self.seq.post(Command::Downloader { epoch: self.seq.epoch, event });
    }

    fn query(&self, query: DelegateQuery) {
        self.seq.post(Command::Query { epoch: self.seq.epoch, query });
    }
}

/// Handed to an `Installer` with each accepted install. `done` consumes it,
/// so completion is reported at most once.
pub struct InstallNotifier {
    seq: SequenceHandle,
    installer_id: InstallerId,
}

impl InstallNotifier {
    pub(crate) fn new(seq: SequenceHandle, installer_id: InstallerId) -> Self {
        Self { seq, installer_id }
    }

    /// The CRX matched the manifest's expectations and may be cached.
    /// Resolves once the coordinator is done with the file, so the installer
    /// may move or delete it afterwards.
    pub async fn expectations_verified(&self) {
        let (ack, rx) = oneshot::channel();
        self.post(InstallerEvent::ExpectationsVerified { ack });
        let _ = rx.await;
    }

    pub fn done(self, outcome: InstallOutcome) {
        self.post(InstallerEvent::Done(outcome));
    }

    fn post(&self, event: InstallerEvent) {
        self.seq.post(Command::Installer { epoch: self.seq.epoch, installer_id: self.installer_id, event });
    }
}
