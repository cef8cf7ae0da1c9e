use chrono::{TimeZone, Utc};
use orange_updater::core::error::{DownloadError, FailureData, UpdateServiceError};
use orange_updater::core::events::{FailureReason, UpdaterEvent};
use orange_updater::core::model::{
    disable_reason, CrxFileInfo, ExtensionInfo, ExtensionState, FetchPriority, InstallLocation, InstallOutcome,
    PendingExtensionInfo, PingResult, RequestId, UpdateCheckReport,
};
use orange_updater::plugins::registry::PrefsStore;
use orange_updater::testing::{installed, pending, webstore_installed, InstallerMode, ScriptedUpdateService, TestBed};
use orange_updater::{CheckParams, UpdateCoordinator, UpdaterConfig, UpdaterError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use url::Url;

fn manual_config() -> UpdaterConfig {
    UpdaterConfig { skip_scheduled_checks: true, ..UpdaterConfig::default() }
}

async fn started(bed: &TestBed) -> UpdateCoordinator {
    let c = UpdateCoordinator::new(manual_config(), bed.collaborators());
    c.start().await.unwrap();
    c
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn counting(n: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
    let n = n.clone();
    move || {
        n.fetch_add(1, Ordering::SeqCst);
    }
}

fn ping() -> PingResult {
    PingResult { did_ping: false, day_start: Utc::now() }
}

fn ids(r: &[RequestId]) -> BTreeSet<RequestId> {
    r.iter().copied().collect()
}

fn crx(id: &str, path: &std::path::Path, version: &str) -> CrxFileInfo {
    CrxFileInfo {
        extension_id: id.to_string(),
        path: path.to_path_buf(),
        expected_version: version.to_string(),
        expected_hash: None,
    }
}

fn crx_url() -> Url {
    Url::parse("https://updates.example.com/a.crx").unwrap()
}

fn drain(rx: &mut broadcast::Receiver<UpdaterEvent>) -> Vec<UpdaterEvent> {
    let mut out = vec![];
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

fn checks_started(events: &[UpdaterEvent]) -> usize {
    events.iter().filter(|e| matches!(e, UpdaterEvent::CheckStarted { .. })).count()
}

#[tokio::test]
async fn lifecycle_errors() {
    let bed = TestBed::new();
    let c = UpdateCoordinator::new(manual_config(), bed.collaborators());
    assert!(matches!(c.check_now(CheckParams::all()).await, Err(UpdaterError::NotRunning)));
    assert!(matches!(c.check_soon().await, Err(UpdaterError::NotRunning)));

    c.start().await.unwrap();
    assert!(matches!(c.start().await, Err(UpdaterError::AlreadyRunning)));

    c.shutdown().await.unwrap();
    assert!(matches!(c.in_progress().await, Err(UpdaterError::SequenceClosed)));
}

#[tokio::test]
async fn empty_check_completes_before_check_now_returns() {
    let bed = TestBed::new();
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(bed.downloader.starts(), 1);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, UpdaterEvent::UpdatingStarted)));
    assert!(events.iter().any(|e| matches!(e, UpdaterEvent::CheckFinished { .. })));
}

#[tokio::test]
async fn request_ids_increase() {
    let bed = TestBed::new();
    let c = started(&bed).await;
    let a = c.check_now(CheckParams::all()).await.unwrap();
    let b = c.check_now(CheckParams::all()).await.unwrap();
    assert!(b > a);
}

#[tokio::test]
async fn download_failure_resolves_the_check() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    let rid = c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 0);
    assert_eq!(bed.downloader.added_ids(), vec!["a".to_string()]);

    let open = c.in_progress().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].in_progress_ids, vec!["a".to_string()]);

    let day = Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap();
    bed.downloader.delegate().unwrap().download_failed(
        "a",
        DownloadError::NoUpdateAvailable,
        PingResult { did_ping: true, day_start: day },
        ids(&[rid]),
        FailureData::default(),
    );
    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(bed.prefs.last_ping_day("a").await.unwrap(), Some(day));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        UpdaterEvent::Failure { extension_id, reason: FailureReason::NoUpdate, .. } if extension_id == "a"
    )));
}

#[tokio::test]
async fn redundant_resolution_is_harmless() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;

    let done = counter();
    let rid = c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    let delegate = bed.downloader.delegate().unwrap();
    for _ in 0..3 {
        delegate.download_failed("a", DownloadError::CrxFetchFailed, ping(), ids(&[rid]), FailureData::default());
    }
    // unknown extension and unknown request
    delegate.download_failed("zzz", DownloadError::CrxFetchFailed, ping(), ids(&[rid, 999]), FailureData::default());
    c.in_progress().await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_extension_across_requests() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;

    let (first, second) = (counter(), counter());
    let r1 = c.check_now(CheckParams::for_ids(["a"]).on_complete(counting(&first))).await.unwrap();
    let r2 = c.check_now(CheckParams::for_ids(["a"]).on_complete(counting(&second))).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.crx");
    std::fs::write(&file, b"crx").unwrap();
    bed.downloader.delegate().unwrap().download_finished(
        crx("a", &file, "2.0"),
        true,
        crx_url(),
        ping(),
        ids(&[r1, r2]),
        None,
    );

    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(bed.installer.calls().len(), 1);
}

#[tokio::test]
async fn batched_check_waits_for_update_service() {
    let bed = TestBed::new().with_update_service(ScriptedUpdateService::ok().gated());
    bed.extensions.add_installed(webstore_installed("w", "1.0"));
    bed.extensions.add_installed(installed("d", "1.0"));
    let c = started(&bed).await;

    let (tx, rx) = oneshot::channel();
    let rid = c
        .check_now(CheckParams::all().on_complete(move || {
            let _ = tx.send(());
        }))
        .await
        .unwrap();
    assert_eq!(bed.downloader.added_ids(), vec!["d".to_string()]);

    bed.downloader.delegate().unwrap().download_failed(
        "d",
        DownloadError::NoUpdateAvailable,
        ping(),
        ids(&[rid]),
        FailureData::default(),
    );
    let open = c.in_progress().await.unwrap();
    assert_eq!(open.len(), 1);
    assert!(open[0].in_progress_ids.is_empty());
    assert!(open[0].awaiting_external_service);

    let service = bed.update_service.clone().unwrap();
    service.release();
    tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

    let calls = service.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].update_info.contains_key("w"));
}

#[tokio::test]
async fn update_service_report_is_published() {
    let report = UpdateCheckReport { updates_available: vec![("w".to_string(), "2.0".to_string())] };
    let bed = TestBed::new().with_update_service(ScriptedUpdateService::with_result(Ok(report)));
    bed.extensions.add_installed(webstore_installed("w", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    c.check_and_wait(CheckParams::all()).await.unwrap();
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        UpdaterEvent::UpdateAvailable { extension_id, version } if extension_id == "w" && version == "2.0"
    )));
}

#[tokio::test]
async fn update_service_failure_counts_as_no_update() {
    let bed = TestBed::new().with_update_service(ScriptedUpdateService::with_result(Err(
        UpdateServiceError::Unavailable("offline".to_string()),
    )));
    bed.extensions.add_installed(webstore_installed("w", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    c.check_and_wait(CheckParams::all()).await.unwrap();
    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        UpdaterEvent::Failure { extension_id, reason: FailureReason::NoUpdate, .. } if extension_id == "w"
    )));
}

#[tokio::test]
async fn missing_update_service_resolves_batched_part_immediately() {
    let bed = TestBed::new();
    bed.extensions.add_installed(webstore_installed("w", "1.0"));
    let c = started(&bed).await;

    let done = counter();
    c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(bed.downloader.added().is_empty());
}

#[tokio::test]
async fn stop_abandons_checks_and_drops_late_results() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let waiter = {
        let c = c.clone();
        tokio::spawn(async move { c.check_and_wait(CheckParams::all()).await })
    };
    while c.in_progress().await.unwrap().is_empty() {
        tokio::task::yield_now().await;
    }
    let delegate = bed.downloader.delegate().unwrap();
    let rid = c.in_progress().await.unwrap()[0].request_id;

    c.stop().await.unwrap();
    assert!(matches!(waiter.await.unwrap(), Err(UpdaterError::Abandoned(r)) if r == rid));
    assert!(delegate.is_cancelled());

    // a result for the old epoch goes nowhere
    delegate.download_failed("a", DownloadError::NoUpdateAvailable, ping(), ids(&[rid]), FailureData::default());
    assert!(c.in_progress().await.unwrap().is_empty());
    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, UpdaterEvent::ChecksAbandoned { count: 1 })));
    assert!(!seen.iter().any(|e| matches!(e, UpdaterEvent::Failure { .. })));

    // restart gets a fresh downloader and keeps counting ids
    c.start().await.unwrap();
    let next = c.check_now(CheckParams::all()).await.unwrap();
    assert!(next > rid);
    assert_eq!(bed.downloader.created(), 2);
}

#[tokio::test]
async fn check_soon_coalesces() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let (a, b) = tokio::join!(c.check_soon(), c.check_soon());
    a.unwrap();
    b.unwrap();
    c.in_progress().await.unwrap();

    assert_eq!(checks_started(&drain(&mut events)), 1);
    assert!(!c.will_check_soon().await.unwrap());
}

#[tokio::test]
async fn full_check_cancels_pending_check_soon() {
    let bed = TestBed::new();
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let (a, b) = tokio::join!(c.check_soon(), c.check_now(CheckParams::all()));
    a.unwrap();
    b.unwrap();
    c.in_progress().await.unwrap();

    assert_eq!(checks_started(&drain(&mut events)), 1);
}

#[tokio::test]
async fn explicit_check_keeps_check_soon() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let (a, b) = tokio::join!(c.check_soon(), c.check_now(CheckParams::for_ids(["a"])));
    a.unwrap();
    b.unwrap();
    c.in_progress().await.unwrap();

    assert_eq!(checks_started(&drain(&mut events)), 2);
}

#[tokio::test]
async fn verification_failure_asks_downloader_to_retry() {
    let bed = TestBed::new();
    bed.installer.set_mode(InstallerMode::Manual);
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;

    let done = counter();
    let rid = c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cached = dir.path().join("cached.crx");
    std::fs::write(&cached, b"stale").unwrap();
    let retries = Arc::new(parking_lot::Mutex::new(Vec::<bool>::new()));
    let seen = retries.clone();
    let delegate = bed.downloader.delegate().unwrap();
    delegate.download_finished(
        crx("a", &cached, "2.0"),
        false,
        crx_url(),
        ping(),
        ids(&[rid]),
        Some(Box::new(move |retry: bool| seen.lock().push(retry))),
    );
    c.in_progress().await.unwrap();
    bed.installer.take_held().unwrap().done(InstallOutcome::verification_failed());

    let open = c.in_progress().await.unwrap();
    assert_eq!(*retries.lock(), vec![true]);
    assert_eq!(open.len(), 1);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    // the fresh download installs and closes the check
    let fresh = dir.path().join("fresh.crx");
    std::fs::write(&fresh, b"good").unwrap();
    delegate.download_finished(crx("a", &fresh, "2.0"), true, crx_url(), ping(), ids(&[rid]), None);
    c.in_progress().await.unwrap();
    bed.installer.take_held().unwrap().done(InstallOutcome::installed("2.0"));
    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn successful_install_reports_no_retry() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();
    let rid = c.check_now(CheckParams::all()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.crx");
    std::fs::write(&file, b"crx").unwrap();
    let retries = Arc::new(parking_lot::Mutex::new(Vec::<bool>::new()));
    let seen = retries.clone();
    bed.downloader.delegate().unwrap().download_finished(
        crx("a", &file, "2.0"),
        false,
        crx_url(),
        ping(),
        ids(&[rid]),
        Some(Box::new(move |retry: bool| seen.lock().push(retry))),
    );
    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(*retries.lock(), vec![false]);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        UpdaterEvent::Installed { extension_id, version } if extension_id == "a" && version == "2.0"
    )));
}

#[tokio::test]
async fn installer_rejection_deletes_owned_file() {
    let bed = TestBed::new();
    bed.installer.set_mode(InstallerMode::Reject);
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    let rid = c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.crx");
    std::fs::write(&file, b"crx").unwrap();

    bed.downloader.delegate().unwrap().download_finished(crx("a", &file, "2.0"), true, crx_url(), ping(), ids(&[rid]), None);
    assert!(c.in_progress().await.unwrap().is_empty());
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!file.exists());
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        UpdaterEvent::Failure { reason: FailureReason::InstallRejected, .. }
    )));
}

#[tokio::test]
async fn installer_rejection_keeps_borrowed_file() {
    let bed = TestBed::new();
    bed.installer.set_mode(InstallerMode::Reject);
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let rid = c.check_now(CheckParams::all()).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.crx");
    std::fs::write(&file, b"crx").unwrap();

    bed.downloader.delegate().unwrap().download_finished(crx("a", &file, "2.0"), false, crx_url(), ping(), ids(&[rid]), None);
    assert!(c.in_progress().await.unwrap().is_empty());
    assert!(file.exists());
}

#[tokio::test]
async fn verified_crx_goes_into_cache() {
    let bed = TestBed::new().with_cache();
    bed.installer.set_mode(InstallerMode::Manual);
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let rid = c.check_now(CheckParams::all()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.crx");
    std::fs::write(&file, b"crx").unwrap();
    bed.downloader.delegate().unwrap().download_finished(crx("a", &file, "2.0"), true, crx_url(), ping(), ids(&[rid]), None);
    c.in_progress().await.unwrap();

    let notifier = bed.installer.take_held().unwrap();
    notifier.expectations_verified().await;
    let puts = bed.cache.as_ref().unwrap().puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].expected_version, "2.0");

    notifier.done(InstallOutcome::installed("2.0"));
    assert!(c.in_progress().await.unwrap().is_empty());
}

#[tokio::test]
async fn install_immediately_applies_delayed_update_on_failure() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    bed.extensions.set_delayed("a", "2.0");
    let c = started(&bed).await;

    let rid = c.check_now(CheckParams::for_ids(["a"]).install_immediately(true)).await.unwrap();
    bed.downloader.delegate().unwrap().download_failed(
        "a",
        DownloadError::NoUpdateAvailable,
        ping(),
        ids(&[rid]),
        FailureData::default(),
    );
    c.in_progress().await.unwrap();
    assert_eq!(bed.extensions.finished_delayed(), vec![("a".to_string(), true)]);
}

#[tokio::test]
async fn delegate_queries_are_answered() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    bed.extensions.add_installed(installed("b", "1.0"));
    bed.extensions.set_delayed("b", "1.5");
    bed.extensions.add_pending(pending("p"));
    let c = started(&bed).await;
    c.check_now(CheckParams::all()).await.unwrap();
    let delegate = bed.downloader.delegate().unwrap();

    let data = delegate.ping_data("a").await.unwrap();
    assert_eq!(data.rollcall_days, -1);
    assert!(data.is_enabled);

    assert_eq!(delegate.existing_version("a").await.as_deref(), Some("1.0"));
    assert_eq!(delegate.existing_version("b").await.as_deref(), Some("1.5"));
    assert_eq!(delegate.existing_version("p").await, None);
    assert!(delegate.is_extension_pending("p").await);
    assert!(!delegate.is_extension_pending("a").await);

    c.stop().await.unwrap();
    assert!(delegate.ping_data("a").await.is_none());
}

#[tokio::test]
async fn check_all_collects_in_order() {
    let bed = TestBed::new();
    bed.extensions.add_pending(pending("p"));
    bed.extensions.add_installed(installed("e", "1.0"));
    bed.extensions.add_installed(ExtensionInfo { state: ExtensionState::Disabled, ..installed("d", "1.0") });
    bed.extensions.add_installed(ExtensionInfo { state: ExtensionState::Blocklisted, ..installed("bm", "1.0") });
    bed.extensions.add_installed(ExtensionInfo { state: ExtensionState::Blocklisted, ..installed("bx", "1.0") });
    bed.extensions.add_installed(ExtensionInfo { state: ExtensionState::Terminated, ..installed("t", "1.0") });
    bed.extensions.add_installed(ExtensionInfo { location: InstallLocation::Unpacked, ..installed("u", "1.0") });
    // installed and pending under the same id: fetched once, as pending
    bed.extensions.add_installed(installed("p", "0.5"));
    bed.prefs.set_disable_reasons("bm", disable_reason::REMOTELY_FOR_MALWARE).await;
    bed.prefs.set_disable_reasons("bx", disable_reason::USER_ACTION).await;

    let c = started(&bed).await;
    c.check_now(CheckParams::all()).await.unwrap();
    assert_eq!(bed.downloader.added_ids(), vec!["p", "e", "d", "bm"]);

    let pending_fetch = &bed.downloader.added()[0];
    assert_eq!(pending_fetch.version, None);
    assert_eq!(pending_fetch.location, InstallLocation::ExternalPolicyDownload);
}

#[tokio::test]
async fn explicit_ids_skip_pending_and_unknown() {
    let bed = TestBed::new();
    bed.extensions.add_pending(pending("p"));
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    c.check_now(CheckParams::for_ids(["p", "nope", "a"]).on_complete(counting(&done))).await.unwrap();
    assert_eq!(bed.downloader.added_ids(), vec!["a"]);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, UpdaterEvent::UpdatingStarted)));
}

#[tokio::test]
async fn high_priority_pending_forces_foreground() {
    let bed = TestBed::new();
    bed.extensions.add_pending(PendingExtensionInfoExt::high_priority(pending("p")));
    bed.extensions.add_pending(pending("q"));
    bed.extensions.add_installed(installed("a", "1.0"));
    let c = started(&bed).await;
    c.check_now(CheckParams::all()).await.unwrap();

    let added = bed.downloader.added();
    let priority = |id: &str| added.iter().find(|f| f.id == id).unwrap().priority;
    assert_eq!(priority("p"), FetchPriority::Foreground);
    assert_eq!(priority("q"), FetchPriority::Foreground);
    assert_eq!(priority("a"), FetchPriority::Background);
}

#[tokio::test]
async fn rejected_pending_extension_reports_add_failure() {
    let bed = TestBed::new();
    bed.extensions.add_pending(pending("p"));
    bed.downloader.reject("p");
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        UpdaterEvent::Failure { reason: FailureReason::DownloaderAddFailed, .. }
    )));
}

#[tokio::test]
async fn rejected_installed_extension_is_silently_excluded() {
    let bed = TestBed::new();
    bed.extensions.add_installed(installed("a", "1.0"));
    bed.downloader.reject("a");
    let c = started(&bed).await;
    let mut events = c.subscribe();

    let done = counter();
    c.check_now(CheckParams::all().on_complete(counting(&done))).await.unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, UpdaterEvent::Failure { .. })));
}

#[tokio::test]
async fn update_url_routing() {
    let bed = TestBed::new().with_update_service(ScriptedUpdateService::ok());
    // no update url: gallery by default
    bed.extensions.add_installed(ExtensionInfo { update_url: None, ..installed("n", "1.0") });
    // converted user script without url: nowhere to update from
    bed.extensions.add_installed(ExtensionInfo {
        update_url: None,
        converted_from_user_script: true,
        ..installed("s", "1.0")
    });
    bed.extensions.add_installed(installed("x", "1.0"));
    bed.prefs.set_update_url_data("x", Some("brand=ACME")).await;
    bed.prefs.set_update_url_data("n", Some("ignored")).await;
    let c = started(&bed).await;

    let (tx, rx) = oneshot::channel();
    let rid = c
        .check_now(CheckParams::all().on_complete(move || {
            let _ = tx.send(());
        }))
        .await
        .unwrap();
    let added = bed.downloader.added();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].id, "x");
    assert_eq!(added[0].update_url_data.as_deref(), Some("brand=ACME"));

    bed.downloader.delegate().unwrap().download_failed(
        "x",
        DownloadError::NoUpdateAvailable,
        ping(),
        ids(&[rid]),
        FailureData::default(),
    );
    tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

    let batched = bed.update_service.as_ref().unwrap().calls();
    assert_eq!(batched[0].update_info.keys().cloned().collect::<Vec<_>>(), vec!["n".to_string()]);
}

#[tokio::test]
async fn forced_update_service_takes_everything() {
    let bed = TestBed::new().with_update_service(ScriptedUpdateService::ok());
    bed.extensions.add_installed(installed("x", "1.0"));
    bed.extensions.add_pending(PendingExtensionInfoExt::corrupt(pending("p")));
    let config = UpdaterConfig { force_update_service: true, ..manual_config() };
    let c = UpdateCoordinator::new(config, bed.collaborators());
    c.start().await.unwrap();

    c.check_and_wait(CheckParams::all()).await.unwrap();
    assert!(bed.downloader.added().is_empty());
    let calls = bed.update_service.as_ref().unwrap().calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].update_info["p"].is_corrupt_reinstall);
    assert!(!calls[0].update_info["x"].is_corrupt_reinstall);
}

#[tokio::test(start_paused = true)]
async fn scheduled_checks_repeat_until_stopped() {
    let bed = TestBed::new();
    let config = UpdaterConfig::with_frequency(Duration::from_secs(3600));
    let c = UpdateCoordinator::new(config, bed.collaborators());
    let mut events = c.subscribe();
    c.start().await.unwrap();
    c.in_progress().await.unwrap();
    assert_eq!(checks_started(&drain(&mut events)), 1, "start checks soon");

    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    c.in_progress().await.unwrap();
    let periodic = checks_started(&drain(&mut events));
    assert!((1..=2).contains(&periodic), "got {periodic} periodic checks");

    c.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
    c.in_progress().await.unwrap();
    assert_eq!(checks_started(&drain(&mut events)), 0);
}

#[tokio::test]
async fn immediate_start_runs_check_inside_start() {
    let bed = TestBed::new();
    let config = UpdaterConfig { update_immediately_on_start: true, ..UpdaterConfig::default() };
    let c = UpdateCoordinator::new(config, bed.collaborators());
    let mut events = c.subscribe();
    c.start().await.unwrap();
    assert_eq!(checks_started(&drain(&mut events)), 1);
    assert!(!c.will_check_soon().await.unwrap());
}

trait PendingExtensionInfoExt {
    fn high_priority(self) -> Self;
    fn corrupt(self) -> Self;
}

impl PendingExtensionInfoExt for PendingExtensionInfo {
    fn high_priority(self) -> Self {
        PendingExtensionInfo { high_priority: true, ..self }
    }

    fn corrupt(self) -> Self {
        PendingExtensionInfo { corrupt_reinstall_expected: true, ..self }
    }
}
