//! Splits one check between the per-extension downloader and the batched
//! update service, registering every accepted extension with the tracker.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::config::UpdaterConfig;
use crate::core::events::{FailureReason, InstallStage, UpdaterEvent};
use crate::core::model::{
    disable_reason, ExtensionId, ExtensionInfo, ExtensionState, ExtensionUpdateData, FetchPriority,
    PendingExtensionInfo, PendingFetch, RequestId, UpdateCheckParams,
};
use crate::core::sequence::{Command, SequenceHandle};
use crate::core::tracker::RequestTracker;
use crate::plugins::registry::{Collaborators, Downloader, ExtensionService, UpdateService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Not installed yet; comes from policy or an external provider.
    Pending { info: PendingExtensionInfo, high_priority_pending: bool },
    Installed(ExtensionInfo),
}

impl Candidate {
    pub fn id(&self) -> &str {
        match self {
            Candidate::Pending { info, .. } => &info.id,
            Candidate::Installed(info) => &info.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchCounts {
    pub direct: usize,
    pub batched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchParams {
    pub fetch_priority: FetchPriority,
    pub install_immediately: bool,
}

/// Only installed extensions updating from the webstore (or with no update
/// URL at all, unless converted from a user script) may take the batched path.
pub async fn can_use_update_service(config: &UpdaterConfig, service: &dyn ExtensionService, id: &str) -> bool {
    if config.force_update_service {
        return true;
    }
    if id.is_empty() {
        return false;
    }
    let Some(ext) = service.get_extension(id).await else {
        return false;
    };
    match &ext.update_url {
        None => !ext.converted_from_user_script,
        Some(url) => config.is_webstore_update_url(url),
    }
}

pub struct FanOutScheduler<'a> {
    config: &'a UpdaterConfig,
    tracker: &'a mut RequestTracker,
    downloader: &'a mut dyn Downloader,
    collab: &'a Collaborators,
    events: &'a broadcast::Sender<UpdaterEvent>,
    sequence: &'a SequenceHandle,
}

impl<'a> FanOutScheduler<'a> {
    pub fn new(
        config: &'a UpdaterConfig,
        tracker: &'a mut RequestTracker,
        downloader: &'a mut dyn Downloader,
        collab: &'a Collaborators,
        events: &'a broadcast::Sender<UpdaterEvent>,
        sequence: &'a SequenceHandle,
    ) -> Self {
        Self { config, tracker, downloader, collab, events, sequence }
    }

    /// Explicit ids resolve to installed extensions only. An empty list means
    /// every pending extension, then enabled, disabled and remotely-disabled
    /// blocklisted installs.
    pub async fn collect(&mut self, ids: &[ExtensionId]) -> Vec<Candidate> {
        let mut out = vec![];
        if !ids.is_empty() {
            for id in ids {
                match self.collab.service.get_extension(id).await {
                    Some(ext) => out.push(Candidate::Installed(ext)),
                    None => debug!(extension_id = %id, "requested extension is not installed"),
                }
            }
            return out;
        }

        let pending_ids = self.collab.pending.pending_ids_for_update_check().await;
        let high_priority_pending = self.collab.pending.has_high_priority_pending().await;
        for id in &pending_ids {
            if let Some(info) = self.collab.pending.get_pending(id).await {
                out.push(Candidate::Pending { info, high_priority_pending });
            }
        }

        let pending: BTreeSet<&str> = pending_ids.iter().map(String::as_str).collect();
        let installed = self.collab.service.installed_extensions().await;
        for state in [ExtensionState::Enabled, ExtensionState::Disabled, ExtensionState::Blocklisted] {
            for ext in installed.iter().filter(|e| e.state == state) {
                // a pending fetch under the same id (e.g. policy override) wins
                if pending.contains(ext.id.as_str()) {
                    continue;
                }
                if state == ExtensionState::Blocklisted && !self.remotely_disabled(&ext.id).await {
                    continue;
                }
                out.push(Candidate::Installed(ext.clone()));
            }
        }
        out
    }

    async fn remotely_disabled(&mut self, id: &str) -> bool {
        match self.collab.prefs.disable_reasons(id).await {
            Ok(r) => r & disable_reason::REMOTELY_FOR_MALWARE != 0,
            Err(e) => {
                warn!(extension_id = id, error = %e, "reading disable reasons failed");
                false
            }
        }
    }

    /// Routes each candidate, starts the downloader and, if nothing ended up
    /// outstanding, resolves the check before returning.
    pub async fn dispatch(
        &mut self,
        request_id: RequestId,
        candidates: Vec<Candidate>,
        params: DispatchParams,
    ) -> DispatchCounts {
        let mut counts = DispatchCounts::default();
        let mut update_check = UpdateCheckParams::default();

        for candidate in candidates {
            match candidate {
                Candidate::Pending { info, high_priority_pending } => {
                    if !info.install_source.is_auto_updateable() {
                        debug!(extension_id = %info.id, "extension is not auto updateable");
                        continue;
                    }
                    if can_use_update_service(self.config, self.collab.service.as_ref(), &info.id).await {
                        update_check.update_info.insert(
                            info.id.clone(),
                            ExtensionUpdateData { is_corrupt_reinstall: info.corrupt_reinstall_expected },
                        );
                        counts.batched += 1;
                        continue;
                    }
                    // any high priority pending install forces foreground fetches
                    let priority = if high_priority_pending { FetchPriority::Foreground } else { params.fetch_priority };
                    let fetch = PendingFetch {
                        id: info.id.clone(),
                        update_url: info.update_url.clone(),
                        location: info.install_source,
                        is_corrupt_reinstall: info.corrupt_reinstall_expected,
                        request_id,
                        priority,
                        version: None,
                        update_url_data: None,
                    };
                    if self.downloader.add_pending(fetch) {
                        self.tracker.mark_extension_pending(request_id, &info.id);
                        counts.direct += 1;
                        self.emit(UpdaterEvent::InstallStage { extension_id: info.id, stage: InstallStage::Downloading });
                    } else {
                        self.emit(UpdaterEvent::Failure {
                            extension_id: info.id,
                            reason: FailureReason::DownloaderAddFailed,
                            detail: None,
                        });
                    }
                }
                Candidate::Installed(ext) => {
                    if !ext.location.is_auto_updateable() {
                        debug!(extension_id = %ext.id, "extension is not auto updateable");
                        continue;
                    }
                    if can_use_update_service(self.config, self.collab.service.as_ref(), &ext.id).await {
                        update_check.update_info.insert(ext.id.clone(), ExtensionUpdateData::default());
                        counts.batched += 1;
                    } else if self.add_extension_to_downloader(&ext, request_id, params.fetch_priority).await {
                        self.tracker.mark_extension_pending(request_id, &ext.id);
                        counts.direct += 1;
                    }
                }
            }
        }

        // The downloader reports back through the sequence, so nothing it
        // does during start can resolve this check before we look.
        let empty_downloader = !self.tracker.has_pending_extensions(request_id);
        let awaiting_update_service = !update_check.update_info.is_empty();
        if awaiting_update_service {
            self.tracker.mark_external_service_pending(request_id);
        }

        self.downloader.start_all_pending(self.collab.cache.clone());

        if awaiting_update_service {
            update_check.priority = params.fetch_priority;
            update_check.install_immediately = params.install_immediately;
            self.issue_batched(request_id, update_check);
        } else if empty_downloader {
            self.tracker.resolve_if_finished(request_id);
        }

        counts
    }

    async fn add_extension_to_downloader(&mut self, ext: &ExtensionInfo, request_id: RequestId, priority: FetchPriority) -> bool {
        if ext.converted_from_user_script && ext.update_url.is_none() {
            return false;
        }
        // gallery updates ignore any extra update-url data
        let from_gallery = ext.update_url.as_ref().map(|u| self.config.is_webstore_update_url(u)).unwrap_or(true);
        let update_url_data = if from_gallery {
            None
        } else {
            match self.collab.prefs.update_url_data(&ext.id).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(extension_id = %ext.id, error = %e, "reading update url data failed");
                    None
                }
            }
        };
        self.downloader.add_pending(PendingFetch {
            id: ext.id.clone(),
            update_url: ext.update_url.clone(),
            location: ext.location,
            is_corrupt_reinstall: false,
            request_id,
            priority,
            version: Some(ext.version.clone()),
            update_url_data,
        })
    }

    fn issue_batched(&mut self, request_id: RequestId, params: UpdateCheckParams) {
        let batched: Vec<ExtensionId> = params.update_info.keys().cloned().collect();
        let Some(service) = self.collab.update_service.clone() else {
            warn!(request_id, count = batched.len(), "no update service; treating batched extensions as up to date");
            for id in batched {
                self.emit(UpdaterEvent::Failure {
                    extension_id: id,
                    reason: FailureReason::NoUpdate,
                    detail: Some("update service unavailable".to_string()),
                });
            }
            self.tracker.mark_external_service_resolved(request_id);
            return;
        };

        debug!(request_id, service = service.name(), count = batched.len(), "starting batched update check");
        let seq = self.sequence.clone();
        tokio::spawn(run_batched(service, seq, request_id, batched, params));
    }

    fn emit(&self, event: UpdaterEvent) {
        let _ = self.events.send(event);
    }
}

async fn run_batched(
    service: Arc<dyn UpdateService>,
    seq: SequenceHandle,
    request_id: RequestId,
    batched: Vec<ExtensionId>,
    params: UpdateCheckParams,
) {
    let result = tokio::select! {
        _ = seq.cancelled() => return,
        r = service.start_update_check(params) => r,
    };
    seq.post(Command::UpdateServiceFinished { epoch: seq.epoch(), request_id, batched, result });
}
