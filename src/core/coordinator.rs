//! The update coordinator: periodic scheduling, check-soon coalescing, and the
//! single owning task that every downloader, installer and update-service
//! result is funnelled through.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::UpdaterConfig;
use crate::core::error::{DownloadError, FailureData, UpdateServiceError, UpdaterError};
use crate::core::events::{FailureReason, InstallStage, UpdaterEvent};
use crate::core::fanout::{DispatchParams, FanOutScheduler};
use crate::core::model::{
    CheckParams, CompletionCallback, CrxFileInfo, ExtensionId, FetchedArtifact, InstallCallback, InstallOptions,
    InstallOutcome, InstallerId, PingData, PingResult, RequestId, UpdateCheckReport,
};
use crate::core::ping;
use crate::core::planner;
use crate::core::sequence::{
    Ack, Command, DelegateHandle, DelegateQuery, DownloaderEvent, InstallNotifier, InstallerEvent, ScheduledTask,
    SequenceHandle,
};
use crate::core::tracker::{CheckSnapshot, RequestTracker};
use crate::plugins::registry::{Collaborators, Downloader};

/// Cloneable front end. State lives in the task spawned by `new`, which must
/// be called from inside a tokio runtime. The task ends on `shutdown()` or
/// when the last clone is dropped.
#[derive(Clone)]
pub struct UpdateCoordinator {
    tx: mpsc::UnboundedSender<Command>,
    event_tx: broadcast::Sender<UpdaterEvent>,
}

impl UpdateCoordinator {
    pub fn new(config: UpdaterConfig, collab: Collaborators) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (tx, rx) = mpsc::unbounded_channel();
        let sequence = Sequence::new(config, collab, tx.downgrade(), event_tx.clone());
        tokio::spawn(sequence.run(rx));
        Self { tx, event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.event_tx.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(Ack<T>) -> Command) -> Result<T, UpdaterError> {
        let (ack, rx) = oneshot::channel();
        self.tx.send(make(ack)).map_err(|_| UpdaterError::SequenceClosed)?;
        rx.await.map_err(|_| UpdaterError::SequenceClosed)
    }

    pub async fn start(&self) -> Result<(), UpdaterError> {
        self.call(|ack| Command::Start { ack }).await?
    }

    /// Outstanding checks are dropped without running their callbacks.
    pub async fn stop(&self) -> Result<(), UpdaterError> {
        self.call(|ack| Command::Stop { ack }).await
    }

    /// Returns once the check is dispatched. If nothing needed fetching the
    /// callback has already run by then.
    pub async fn check_now(&self, params: CheckParams) -> Result<RequestId, UpdaterError> {
        self.call(move |ack| Command::CheckNow { params, ack }).await?
    }

    /// Like `check_now`, but waits for the check to resolve.
    pub async fn check_and_wait(&self, mut params: CheckParams) -> Result<RequestId, UpdaterError> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let user_cb = params.callback.take();
        params.callback = Some(Box::new(move || {
            if let Some(cb) = user_cb {
                cb();
            }
            let _ = done_tx.send(());
        }));
        let request_id = self.check_now(params).await?;
        done_rx.await.map_err(|_| UpdaterError::Abandoned(request_id))?;
        Ok(request_id)
    }

    pub async fn check_soon(&self) -> Result<(), UpdaterError> {
        self.call(|ack| Command::CheckSoon { ack }).await?
    }

    pub async fn will_check_soon(&self) -> Result<bool, UpdaterError> {
        self.call(|ack| Command::WillCheckSoon { ack }).await
    }

    pub async fn in_progress(&self) -> Result<Vec<CheckSnapshot>, UpdaterError> {
        self.call(|ack| Command::Snapshot { ack }).await
    }

    pub async fn shutdown(&self) -> Result<(), UpdaterError> {
        self.call(|ack| Command::Shutdown { ack }).await
    }
}

struct Sequence {
    config: UpdaterConfig,
    collab: Collaborators,
    tracker: RequestTracker,
    downloader: Option<Box<dyn Downloader>>,
    running_installs: HashMap<InstallerId, FetchedArtifact>,
    next_installer_id: InstallerId,
    alive: bool,
    will_check_soon: bool,
    epoch: u64,
    token: CancellationToken,
    tx: mpsc::WeakUnboundedSender<Command>,
    event_tx: broadcast::Sender<UpdaterEvent>,
}

impl Sequence {
    fn new(
        config: UpdaterConfig,
        collab: Collaborators,
        tx: mpsc::WeakUnboundedSender<Command>,
        event_tx: broadcast::Sender<UpdaterEvent>,
    ) -> Self {
        Self {
            config,
            collab,
            tracker: RequestTracker::new(),
            downloader: None,
            running_installs: HashMap::new(),
            next_installer_id: 1,
            alive: false,
            will_check_soon: false,
            epoch: 0,
            token: CancellationToken::new(),
            tx,
            event_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            if !self.handle_command(cmd).await {
                break;
            }
        }
        self.stop();
        debug!("update sequence ended");
    }

    fn emit(&self, event: UpdaterEvent) {
        let _ = self.event_tx.send(event);
    }

    fn sequence_handle(&self) -> SequenceHandle {
        SequenceHandle::new(self.tx.clone(), self.epoch, self.token.clone())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.alive && epoch == self.epoch
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { ack } => {
                let r = self.start().await;
                let _ = ack.send(r);
            }
            Command::Stop { ack } => {
                self.stop();
                let _ = ack.send(());
            }
            Command::CheckNow { params, ack } => {
                let r = self.check_now(params).await;
                let _ = ack.send(r);
            }
            Command::CheckSoon { ack } => {
                let _ = ack.send(self.check_soon());
            }
            Command::WillCheckSoon { ack } => {
                let _ = ack.send(self.will_check_soon);
            }
            Command::Snapshot { ack } => {
                let _ = ack.send(self.tracker.snapshot());
            }
            Command::Shutdown { ack } => {
                self.stop();
                let _ = ack.send(());
                return false;
            }
            Command::Scheduled { epoch, task } => {
                if self.is_current(epoch) {
                    match task {
                        ScheduledTask::NextCheck => self.next_check().await,
                        ScheduledTask::DoCheckSoon => self.do_check_soon().await,
                    }
                }
            }
            Command::Downloader { epoch, event } => {
                if self.is_current(epoch) {
                    self.on_downloader_event(event).await;
                }
            }
            Command::Query { epoch, query } => {
                // a stale query's reply channel is dropped unanswered
                if self.is_current(epoch) {
                    self.answer(query).await;
                }
            }
            Command::UpdateServiceFinished { epoch, request_id, batched, result } => {
                if self.is_current(epoch) {
                    self.on_update_service_finished(request_id, batched, result);
                }
            }
            Command::Installer { epoch, installer_id, event } => {
                if self.is_current(epoch) {
                    match event {
                        InstallerEvent::ExpectationsVerified { ack } => {
                            self.on_expectations_verified(installer_id).await;
                            let _ = ack.send(());
                        }
                        InstallerEvent::Done(outcome) => self.on_install_done(installer_id, outcome),
                    }
                }
            }
        }
        true
    }

    async fn start(&mut self) -> Result<(), UpdaterError> {
        if self.alive {
            return Err(UpdaterError::AlreadyRunning);
        }
        self.alive = true;
        self.epoch += 1;
        self.token = CancellationToken::new();
        info!(
            epoch = self.epoch,
            frequency_secs = self.config.effective_frequency().as_secs(),
            "extension updater started"
        );

        if !self.config.skip_scheduled_checks {
            if self.config.update_immediately_on_start {
                self.check_now(CheckParams::all()).await?;
            } else {
                self.check_soon()?;
            }
            self.schedule_next_check();
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.token.cancel();
        let was_alive = self.alive;
        self.alive = false;
        self.will_check_soon = false;
        self.downloader = None;
        self.running_installs.clear();

        let abandoned = self.tracker.abandon_all();
        if abandoned > 0 {
            info!(abandoned, "dropping unfinished update checks");
            self.emit(UpdaterEvent::ChecksAbandoned { count: abandoned });
        }
        if was_alive {
            info!("extension updater stopped");
        }
    }

    fn schedule_next_check(&self) {
        let delay = planner::jittered_delay(self.config.effective_frequency(), &mut rand::thread_rng());
        debug!(delay_ms = delay.as_millis() as u64, "scheduling next update check");
        let seq = self.sequence_handle();
        tokio::spawn(async move {
            tokio::select! {
                _ = seq.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    seq.post(Command::Scheduled { epoch: seq.epoch(), task: ScheduledTask::NextCheck });
                }
            }
        });
    }

    async fn next_check(&mut self) {
        if let Err(e) = self.check_now(CheckParams::all()).await {
            warn!(error = %e, "scheduled update check failed to start");
        }
        self.schedule_next_check();
    }

    fn check_soon(&mut self) -> Result<(), UpdaterError> {
        if !self.alive {
            return Err(UpdaterError::NotRunning);
        }
        if self.will_check_soon {
            return Ok(());
        }
        let seq = self.sequence_handle();
        if seq.post(Command::Scheduled { epoch: self.epoch, task: ScheduledTask::DoCheckSoon }) {
            self.will_check_soon = true;
        }
        Ok(())
    }

    async fn do_check_soon(&mut self) {
        if !self.will_check_soon {
            // a full check ran in between
            return;
        }
        if let Err(e) = self.check_now(CheckParams::all()).await {
            warn!(error = %e, "check-soon failed to start");
        }
    }

    async fn check_now(&mut self, params: CheckParams) -> Result<RequestId, UpdaterError> {
        if !self.alive {
            return Err(UpdaterError::NotRunning);
        }
        let CheckParams { ids, install_immediately, fetch_priority, callback } = params;
        if ids.is_empty() {
            // a full check makes any queued check-soon redundant
            self.will_check_soon = false;
        }

        let request_id = self.tracker.next_request_id();
        let events = self.event_tx.clone();
        let on_done: CompletionCallback = Box::new(move || {
            let _ = events.send(UpdaterEvent::CheckFinished { request_id });
            if let Some(cb) = callback {
                cb();
            }
        });
        let assigned = self.tracker.begin_request(&ids, install_immediately, Some(on_done));
        debug_assert_eq!(assigned, request_id);

        debug!(request_id, explicit_ids = ids.len(), "starting update check");
        self.emit(UpdaterEvent::CheckStarted { request_id, explicit_ids: ids.len() });
        if ids.is_empty() {
            self.emit(UpdaterEvent::UpdatingStarted);
        }

        let seq = self.sequence_handle();
        let factory = &self.collab.downloader_factory;
        let downloader = self.downloader.get_or_insert_with(|| {
            let d = factory(DelegateHandle::new(seq.clone()));
            debug!(downloader = d.name(), "created downloader");
            d
        });

        let mut fanout = FanOutScheduler::new(
            &self.config,
            &mut self.tracker,
            downloader.as_mut(),
            &self.collab,
            &self.event_tx,
            &seq,
        );
        let candidates = fanout.collect(&ids).await;
        let counts = fanout
            .dispatch(request_id, candidates, DispatchParams { fetch_priority, install_immediately })
            .await;
        debug!(request_id, direct = counts.direct, batched = counts.batched, "update check dispatched");
        Ok(request_id)
    }

    async fn on_downloader_event(&mut self, event: DownloaderEvent) {
        match event {
            DownloaderEvent::Failed { id, error, ping, request_ids, data } => {
                self.on_download_failed(id, error, ping, request_ids, data).await
            }
            DownloaderEvent::Finished { file, file_ownership_passed, download_url, ping, request_ids, install_callback } => {
                self.on_download_finished(file, file_ownership_passed, download_url, ping, request_ids, install_callback)
                    .await
            }
            DownloaderEvent::StageChanged { id, stage } => {
                self.emit(UpdaterEvent::DownloadStage { extension_id: id, stage });
            }
            DownloaderEvent::CacheStatus { id, status } => {
                self.emit(UpdaterEvent::CacheStatus { extension_id: id, status });
            }
        }
    }

    async fn on_download_failed(
        &mut self,
        id: ExtensionId,
        error: DownloadError,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        data: FailureData,
    ) {
        if let Some(reason) = FailureReason::from_download_error(error) {
            let detail = data.additional_info.or(data.manifest_invalid_error);
            self.emit(UpdaterEvent::Failure { extension_id: id.clone(), reason, detail });
        }
        debug!(extension_id = %id, error = %error, "extension download ended without an update");

        self.update_ping_data(&id, &ping).await;

        let mut install_immediately = false;
        for request_id in &request_ids {
            install_immediately |= self.tracker.install_immediately(*request_id);
            self.tracker.mark_extension_resolved(*request_id, &id);
        }

        // an update queued by an earlier check may be applied now
        if install_immediately && self.collab.service.pending_update_version(&id).await.is_some() {
            self.collab.service.finish_delayed_installation_if_ready(&id, true).await;
        }
    }

    async fn on_download_finished(
        &mut self,
        file: CrxFileInfo,
        file_ownership_passed: bool,
        download_url: Url,
        ping: PingResult,
        request_ids: BTreeSet<RequestId>,
        install_callback: Option<InstallCallback>,
    ) {
        self.emit(UpdaterEvent::InstallStage { extension_id: file.extension_id.clone(), stage: InstallStage::Installing });
        self.update_ping_data(&file.extension_id, &ping).await;
        debug!(url = %download_url, path = %file.path.display(), "crx downloaded");

        self.install_crx_file(FetchedArtifact { info: file, file_ownership_passed, request_ids, install_callback })
            .await;
    }

    async fn install_crx_file(&mut self, artifact: FetchedArtifact) {
        let id = artifact.info.extension_id.clone();
        debug!(extension_id = %id, path = %artifact.info.path.display(), "updating extension");

        let install_immediately = artifact.request_ids.iter().any(|r| self.tracker.install_immediately(*r));
        let installer_id = self.next_installer_id;
        self.next_installer_id += 1;
        let notifier = InstallNotifier::new(self.sequence_handle(), installer_id);

        let accepted = self
            .collab
            .installer
            .update_extension(
                artifact.info.clone(),
                artifact.file_ownership_passed,
                InstallOptions { install_immediately },
                notifier,
            )
            .await;
        if accepted {
            self.running_installs.insert(installer_id, artifact);
            return;
        }

        warn!(extension_id = %id, installer = self.collab.installer.name(), "installer rejected update");
        self.emit(UpdaterEvent::Failure { extension_id: id.clone(), reason: FailureReason::InstallRejected, detail: None });
        if artifact.file_ownership_passed {
            if let Err(e) = tokio::fs::remove_file(&artifact.info.path).await {
                warn!(path = %artifact.info.path.display(), error = %e, "failed to delete rejected crx");
            }
        }
        for request_id in &artifact.request_ids {
            self.tracker.mark_extension_resolved(*request_id, &id);
        }
    }

    async fn on_expectations_verified(&mut self, installer_id: InstallerId) {
        let Some(cache) = self.collab.cache.clone() else {
            return;
        };
        let Some(info) = self.running_installs.get(&installer_id).map(|a| a.info.clone()) else {
            return;
        };
        if let Err(e) = cache.put_extension(&info).await {
            warn!(extension_id = %info.extension_id, error = %e, "failed to cache crx");
        }
    }

    fn on_install_done(&mut self, installer_id: InstallerId, outcome: InstallOutcome) {
        let Some(mut artifact) = self.running_installs.remove(&installer_id) else {
            warn!(installer_id, "install finished for an unknown installer");
            return;
        };
        let id = artifact.info.extension_id.clone();

        if outcome.installed_version.is_none() && outcome.verification_check_failed {
            if let Some(retry) = artifact.install_callback.take() {
                // the downloader fetches again and reports for the same checks
                debug!(extension_id = %id, "crx failed verification, asking downloader to retry");
                retry(true);
                return;
            }
        }

        match &outcome.installed_version {
            Some(version) => {
                info!(extension_id = %id, version = %version, "extension updated");
                self.emit(UpdaterEvent::Installed { extension_id: id.clone(), version: version.clone() });
                self.emit(UpdaterEvent::InstallStage { extension_id: id.clone(), stage: InstallStage::Complete });
            }
            None => {
                self.emit(UpdaterEvent::Error {
                    scope: format!("install({})", id),
                    message: "installer finished without installing".to_string(),
                });
            }
        }

        for request_id in &artifact.request_ids {
            self.tracker.mark_extension_resolved(*request_id, &id);
        }
        if let Some(cb) = artifact.install_callback.take() {
            cb(false);
        }
    }

    fn on_update_service_finished(
        &mut self,
        request_id: RequestId,
        batched: Vec<ExtensionId>,
        result: Result<UpdateCheckReport, UpdateServiceError>,
    ) {
        match result {
            Ok(report) => {
                for (extension_id, version) in report.updates_available {
                    self.emit(UpdaterEvent::UpdateAvailable { extension_id, version });
                }
            }
            Err(e) => {
                warn!(request_id, error = %e, "batched update check failed");
                for extension_id in batched {
                    self.emit(UpdaterEvent::Failure {
                        extension_id,
                        reason: FailureReason::NoUpdate,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }
        self.tracker.mark_external_service_resolved(request_id);
    }

    async fn answer(&mut self, query: DelegateQuery) {
        match query {
            DelegateQuery::PingData { id, reply } => {
                let data = match ping::ping_data_for(
                    self.collab.prefs.as_ref(),
                    self.collab.service.as_ref(),
                    &id,
                    Utc::now(),
                )
                .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(extension_id = %id, error = %e, "reading ping data failed");
                        PingData::default()
                    }
                };
                let _ = reply.send(data);
            }
            DelegateQuery::IsPending { id, reply } => {
                let _ = reply.send(self.collab.pending.is_id_pending(&id).await);
            }
            DelegateQuery::ExistingVersion { id, reply } => {
                let version = match self.collab.service.get_extension(&id).await {
                    Some(ext) => Some(self.collab.service.pending_update_version(&id).await.unwrap_or(ext.version)),
                    None => None,
                };
                let _ = reply.send(version);
            }
        }
    }

    async fn update_ping_data(&mut self, id: &str, ping: &PingResult) {
        if let Err(e) = ping::update_ping_data(self.collab.prefs.as_ref(), id, ping).await {
            warn!(extension_id = id, error = %e, "failed to record ping data");
        }
    }
}
