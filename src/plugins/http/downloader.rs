//! Per-extension downloader speaking the JSON manifest protocol.
//!
//! Pending fetches are grouped by update URL and priority so each server gets
//! one manifest request per priority and `start_all_pending`. An extension that is already in
//! flight is not fetched again; the new request id joins the running fetch and
//! is reported with it.

use chrono::Utc;
use parking_lot::Mutex;
use sanitize_filename::sanitize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::{DownloadError, FailureData};
use crate::core::model::{
    CacheStatus, CrxFileInfo, DownloadStage, ExtensionId, ExtensionVersion, FetchPriority, InstallCallback,
    PendingFetch, PingResult, RequestId,
};
use crate::core::sequence::DelegateHandle;
use crate::plugins::http::client::HttpFetcher;
use crate::plugins::http::manifest::{build_fetch_url, ping_param, ManifestEntry, ManifestQuery, UpdateManifest};
use crate::plugins::registry::{Downloader, DownloaderFactory, ExtensionCache};

pub struct HttpDownloader {
    inner: Arc<Inner>,
    pending: Vec<PendingFetch>,
}

struct Inner {
    fetcher: HttpFetcher,
    download_dir: PathBuf,
    default_update_url: Url,
    delegate: DelegateHandle,
    in_flight: Mutex<HashMap<ExtensionId, BTreeSet<RequestId>>>,
}

/// What the manifest said to fetch for one extension.
#[derive(Debug, Clone)]
struct CrxTarget {
    id: ExtensionId,
    url: Url,
    version: String,
    hash: Option<String>,
    priority: FetchPriority,
}

impl HttpDownloader {
    pub fn new(fetcher: HttpFetcher, download_dir: PathBuf, default_update_url: Url, delegate: DelegateHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                download_dir,
                default_update_url,
                delegate,
                in_flight: Mutex::new(HashMap::new()),
            }),
            pending: vec![],
        }
    }

    pub fn factory(fetcher: HttpFetcher, download_dir: PathBuf, default_update_url: Url) -> DownloaderFactory {
        Box::new(move |delegate: DelegateHandle| -> Box<dyn Downloader> {
            Box::new(HttpDownloader::new(fetcher.clone(), download_dir.clone(), default_update_url.clone(), delegate))
        })
    }
}

impl Downloader for HttpDownloader {
    fn name(&self) -> &'static str {
        "http-downloader"
    }

    fn add_pending(&mut self, fetch: PendingFetch) -> bool {
        if fetch.id.is_empty() {
            return false;
        }
        if let Some(url) = &fetch.update_url {
            if url.scheme() != "http" && url.scheme() != "https" {
                debug!(extension_id = %fetch.id, url = %url, "unsupported update url");
                return false;
            }
        }
        self.inner.delegate.stage_changed(&fetch.id, DownloadStage::Pending);
        self.pending.push(fetch);
        true
    }

    fn start_all_pending(&mut self, cache: Option<Arc<dyn ExtensionCache>>) {
        let mut batches: BTreeMap<(Url, FetchPriority), Vec<PendingFetch>> = BTreeMap::new();
        {
            let mut in_flight = self.inner.in_flight.lock();
            for fetch in self.pending.drain(..) {
                if let Some(ids) = in_flight.get_mut(&fetch.id) {
                    debug!(extension_id = %fetch.id, request_id = fetch.request_id, "joining in-flight fetch");
                    ids.insert(fetch.request_id);
                    continue;
                }
                in_flight.insert(fetch.id.clone(), BTreeSet::from([fetch.request_id]));
                let url = fetch.update_url.clone().unwrap_or_else(|| self.inner.default_update_url.clone());
                batches.entry((url, fetch.priority)).or_default().push(fetch);
            }
        }

        for ((url, priority), fetches) in batches {
            for f in &fetches {
                self.inner.delegate.stage_changed(&f.id, DownloadStage::QueuedForManifest);
            }
            let inner = self.inner.clone();
            let cache = cache.clone();
            tokio::spawn(async move {
                let delegate = inner.delegate.clone();
                tokio::select! {
                    _ = delegate.cancelled() => {}
                    _ = inner.fetch_batch(url, priority, fetches, cache) => {}
                }
            });
        }
    }
}

impl Inner {
    fn take_request_ids(&self, id: &str) -> BTreeSet<RequestId> {
        self.in_flight.lock().remove(id).unwrap_or_default()
    }

    fn fail(&self, id: &str, error: DownloadError, ping: PingResult, data: FailureData) {
        let request_ids = self.take_request_ids(id);
        debug!(extension_id = id, error = %error, "fetch failed");
        self.delegate.download_failed(id, error, ping, request_ids, data);
    }

    fn finish(&self, file: CrxFileInfo, url: Url, ping: PingResult) {
        let request_ids = self.take_request_ids(&file.extension_id);
        self.delegate.stage_changed(&file.extension_id, DownloadStage::Finished);
        self.delegate.download_finished(file, true, url, ping, request_ids, None);
    }

    /// Hands over a cached copy. The coordinator answers through the retry
    /// callback once the installer has looked at it.
    fn finish_from_cache(self: Arc<Self>, file: CrxFileInfo, target: CrxTarget, ping: PingResult) {
        let request_ids = self.take_request_ids(&file.extension_id);
        let url = target.url.clone();
        let retry = self.clone().retry_callback(target, ping, request_ids.clone());
        self.delegate.stage_changed(&file.extension_id, DownloadStage::Finished);
        self.delegate.download_finished(file, false, url, ping, request_ids, Some(retry));
    }

    async fn fetch_batch(
        self: Arc<Self>,
        base: Url,
        priority: FetchPriority,
        fetches: Vec<PendingFetch>,
        cache: Option<Arc<dyn ExtensionCache>>,
    ) {
        let mut queries = Vec::with_capacity(fetches.len());
        for f in &fetches {
            let Some(ping) = self.delegate.ping_data(&f.id).await else {
                return;
            };
            queries.push(ManifestQuery {
                id: f.id.clone(),
                version: f.version.clone(),
                ping: Some(ping),
                update_url_data: f.update_url_data.clone(),
            });
        }
        let url = build_fetch_url(&base, &queries);

        for f in &fetches {
            self.delegate.stage_changed(&f.id, DownloadStage::DownloadingManifest);
        }
        let now = Utc::now();
        let body = match self.fetcher.get(&url, priority).await {
            Ok((body, _)) => body,
            Err((e, tries)) => {
                warn!(url = %base, error = %e, "manifest fetch failed");
                let data = FailureData {
                    response_code: e.status_code(),
                    fetch_tries: tries,
                    additional_info: Some(e.to_string()),
                    manifest_invalid_error: None,
                };
                let ping = PingResult { did_ping: false, day_start: now };
                for f in fetches {
                    self.clone().manifest_fetch_failed(f, ping, data.clone(), cache.clone()).await;
                }
                return;
            }
        };

        for f in &fetches {
            self.delegate.stage_changed(&f.id, DownloadStage::ParsingManifest);
        }
        let manifest = match UpdateManifest::parse(&body) {
            Ok(m) => m,
            Err(e) => {
                warn!(url = %base, error = %e, "manifest invalid");
                let ping = PingResult { did_ping: false, day_start: now };
                for f in &fetches {
                    self.fail(&f.id, DownloadError::ManifestInvalid, ping, FailureData::manifest_invalid(e.to_string()));
                }
                return;
            }
        };

        let mut work = vec![];
        for (f, q) in fetches.into_iter().zip(queries) {
            self.delegate.stage_changed(&f.id, DownloadStage::ManifestLoaded);
            let sent_ping = q.ping.as_ref().and_then(ping_param).is_some();
            let ping = manifest.ping_result(sent_ping, now);
            let entry = manifest.entry(&f.id).cloned();
            work.push(self.clone().handle_entry(f, entry, ping, cache.clone()));
        }
        futures::future::join_all(work).await;
    }

    async fn manifest_fetch_failed(
        self: Arc<Self>,
        fetch: PendingFetch,
        ping: PingResult,
        data: FailureData,
        cache: Option<Arc<dyn ExtensionCache>>,
    ) {
        if let Some(cache) = cache {
            if let Some(hit) = cache.get_extension(&fetch.id, None).await {
                let newer = match (&fetch.version, ExtensionVersion::parse(&hit.version)) {
                    (Some(installed), Some(cached)) => {
                        ExtensionVersion::parse(installed).map(|v| cached.is_newer_than(&v)).unwrap_or(false)
                    }
                    (None, Some(_)) => true,
                    _ => false,
                };
                if newer {
                    self.delegate.cache_status(&fetch.id, CacheStatus::HitOnManifestFetchFailure);
                    let target = CrxTarget {
                        id: fetch.id.clone(),
                        url: fetch.update_url.clone().unwrap_or_else(|| self.default_update_url.clone()),
                        version: hit.version.clone(),
                        hash: None,
                        priority: fetch.priority,
                    };
                    let file = CrxFileInfo {
                        extension_id: fetch.id.clone(),
                        path: hit.path,
                        expected_version: hit.version,
                        expected_hash: None,
                    };
                    self.finish_from_cache(file, target, ping);
                    return;
                }
            }
        }
        self.fail(&fetch.id, DownloadError::ManifestFetchFailed, ping, data);
    }

    async fn handle_entry(
        self: Arc<Self>,
        fetch: PendingFetch,
        entry: Option<ManifestEntry>,
        ping: PingResult,
        cache: Option<Arc<dyn ExtensionCache>>,
    ) {
        let id = fetch.id.clone();
        let entry = match entry {
            Some(e) if e.is_ok() => e,
            Some(e) => {
                self.fail(&id, DownloadError::NoUpdateAvailable, ping, FailureData::with_info(e.status));
                return;
            }
            None => {
                self.fail(&id, DownloadError::NoUpdateAvailable, ping, FailureData::default());
                return;
            }
        };
        let Some(offered) = entry.version.as_deref() else {
            self.fail(&id, DownloadError::NoUpdateAvailable, ping, FailureData::default());
            return;
        };
        let Some(new_version) = ExtensionVersion::parse(offered) else {
            let data = FailureData::manifest_invalid(format!("unparsable version {:?}", offered));
            self.fail(&id, DownloadError::ManifestInvalid, ping, data);
            return;
        };

        // pending installs and corrupt reinstalls take whatever the server offers
        let take_any =
            fetch.version.is_none() || fetch.is_corrupt_reinstall || self.delegate.is_extension_pending(&id).await;
        if !take_any {
            // a staged but unapplied update counts as what we already have
            let existing = match self.delegate.existing_version(&id).await {
                Some(v) => Some(v),
                None => fetch.version.clone(),
            };
            if let Some(existing) = existing.as_deref().and_then(ExtensionVersion::parse) {
                if !new_version.is_newer_than(&existing) {
                    debug!(extension_id = %id, version = %new_version, "already up to date");
                    self.fail(&id, DownloadError::NoUpdateAvailable, ping, FailureData::default());
                    return;
                }
            }
        }

        let codebase = entry.codebase.as_deref().map(str::trim).unwrap_or_default();
        if codebase.is_empty() {
            self.fail(&id, DownloadError::CrxFetchUrlEmpty, ping, FailureData::default());
            return;
        }
        let url = match Url::parse(codebase) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => u,
            _ => {
                self.fail(&id, DownloadError::CrxFetchUrlInvalid, ping, FailureData::with_info(codebase));
                return;
            }
        };

        let target = CrxTarget {
            id,
            url,
            version: new_version.to_string(),
            hash: entry.hash_sha256.clone(),
            priority: fetch.priority,
        };
        self.delegate.stage_changed(&target.id, DownloadStage::QueuedForCrx);

        match cache {
            Some(cache) => {
                if let Some(hit) = cache.get_extension(&target.id, target.hash.as_deref()).await {
                    if hit.version == target.version {
                        self.delegate.cache_status(&target.id, CacheStatus::Hit);
                        let file = CrxFileInfo {
                            extension_id: target.id.clone(),
                            path: hit.path,
                            expected_version: target.version.clone(),
                            expected_hash: target.hash.clone(),
                        };
                        self.finish_from_cache(file, target, ping);
                        return;
                    }
                }
                self.delegate.cache_status(&target.id, CacheStatus::Miss);
            }
            None => self.delegate.cache_status(&target.id, CacheStatus::Disabled),
        }

        self.download_crx(target, ping).await;
    }

    /// Called by the coordinator once the cached copy has been tried. `true`
    /// means it failed verification and must be fetched from the network
    /// for the same requests.
    fn retry_callback(self: Arc<Self>, target: CrxTarget, ping: PingResult, request_ids: BTreeSet<RequestId>) -> InstallCallback {
        Box::new(move |should_download: bool| {
            if !should_download {
                return;
            }
            {
                let mut in_flight = self.in_flight.lock();
                if let Some(running) = in_flight.get_mut(&target.id) {
                    debug!(extension_id = %target.id, "cached crx rejected, joining running fetch");
                    running.extend(request_ids);
                    return;
                }
                in_flight.insert(target.id.clone(), request_ids);
            }
            debug!(extension_id = %target.id, "cached crx rejected, downloading");
            let delegate = self.delegate.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = delegate.cancelled() => {}
                    _ = self.download_crx(target, ping) => {}
                }
            });
        })
    }

    async fn download_crx(&self, target: CrxTarget, ping: PingResult) {
        self.delegate.stage_changed(&target.id, DownloadStage::DownloadingCrx);
        let body = match self.fetcher.get(&target.url, target.priority).await {
            Ok((body, _)) => body,
            Err((e, tries)) => {
                warn!(extension_id = %target.id, url = %target.url, error = %e, "crx fetch failed");
                let data = FailureData {
                    response_code: e.status_code(),
                    fetch_tries: tries,
                    additional_info: Some(e.to_string()),
                    manifest_invalid_error: None,
                };
                self.fail(&target.id, DownloadError::CrxFetchFailed, ping, data);
                return;
            }
        };

        if let Some(expected) = &target.hash {
            let actual = format!("{:x}", Sha256::digest(&body));
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(extension_id = %target.id, expected = %expected, actual = %actual, "crx hash mismatch");
                self.fail(&target.id, DownloadError::CrxFetchFailed, ping, FailureData::with_info("hash mismatch"));
                return;
            }
        }

        let path = self.download_dir.join(format!("{}-{}.crx", sanitize(&target.id), uuid::Uuid::new_v4()));
        let written = async {
            tokio::fs::create_dir_all(&self.download_dir).await?;
            tokio::fs::write(&path, &body).await
        }
        .await;
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to write crx");
            self.fail(&target.id, DownloadError::CrxFetchFailed, ping, FailureData::with_info(e.to_string()));
            return;
        }

        let file = CrxFileInfo {
            extension_id: target.id.clone(),
            path,
            expected_version: target.version,
            expected_hash: target.hash,
        };
        self.finish(file, target.url, ping);
    }
}
