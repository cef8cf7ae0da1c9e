use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use orange_updater::core::config::UpdaterConfig;
use orange_updater::core::events::{InstallStage, UpdaterEvent};
use orange_updater::core::model::{CheckParams, FetchPriority};
use orange_updater::core::ping;
use orange_updater::core::store::SqliteStore;
use orange_updater::plugins::http::client::HttpFetcher;
use orange_updater::plugins::http::downloader::HttpDownloader;
use orange_updater::plugins::http::update_service::HttpUpdateService;
use orange_updater::plugins::local::cache::DirCache;
use orange_updater::plugins::local::installer::DirectoryInstaller;
use orange_updater::plugins::local::inventory::Inventory;
use orange_updater::plugins::registry::{
    Collaborators, ExtensionService, FetchContext, PluginRegistry, PrefsStore, UpdateService, UpdaterCliConfig,
};
use orange_updater::UpdateCoordinator;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn build_cli(registry: &PluginRegistry) -> Command {
    let check = Command::new("check")
        .about("Check extensions for updates once and install what is found")
        .arg(
            Arg::new("ids")
                .help("Extension ids to check (default: everything)")
                .action(ArgAction::Append)
                .num_args(0..),
        )
        .arg(
            Arg::new("install_immediately")
                .long("install-immediately")
                .help("Apply updates even to extensions that are in use")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("foreground")
                .long("foreground")
                .help("Fetch with foreground priority")
                .action(ArgAction::SetTrue),
        );

    let run = Command::new("run")
        .about("Keep checking periodically until interrupted")
        .arg(
            Arg::new("frequency_secs")
                .long("frequency-secs")
                .help("Base seconds between scheduled checks")
                .default_value("18000")
                .num_args(1),
        )
        .arg(
            Arg::new("immediately")
                .long("immediately")
                .help("Run the first check right away instead of soon")
                .action(ArgAction::SetTrue),
        );

    let prefs = Command::new("prefs").about("Show stored ping data for every known extension");

    let mark_active = Command::new("mark-active")
        .about("Record that extensions were used since the last ping")
        .arg(Arg::new("ids").action(ArgAction::Append).num_args(1..).required(true));

    registry
        .augment_command(
            Command::new("orange-updater")
                .about("Extension auto-updater")
                .subcommand_required(true)
                .arg_required_else_help(true),
        )
        .subcommand(check)
        .subcommand(run)
        .subcommand(prefs)
        .subcommand(mark_active)
}

struct Services {
    inventory: Arc<Inventory>,
    prefs: Arc<SqliteStore>,
    collab: Collaborators,
    config: UpdaterConfig,
}

async fn build_services(cfg: &UpdaterCliConfig) -> anyhow::Result<Services> {
    tokio::fs::create_dir_all(&cfg.data_dir).await?;

    let mut config = UpdaterConfig::default();
    if let Some(url) = &cfg.webstore_url {
        config.webstore_update_url = url.clone();
    }

    let inventory = Arc::new(Inventory::load(&cfg.inventory).await?);
    let prefs = Arc::new(SqliteStore::open(&cfg.data_dir.join("prefs.sqlite")).await?);
    let fetcher = HttpFetcher::new(cfg.fetch.clone())?;

    let update_service: Option<Arc<dyn UpdateService>> = if cfg.use_update_service {
        Some(Arc::new(HttpUpdateService::new(
            fetcher.clone(),
            config.webstore_update_url.clone(),
            inventory.clone(),
        )))
    } else {
        None
    };

    let collab = Collaborators {
        service: inventory.clone(),
        pending: inventory.clone(),
        prefs: prefs.clone(),
        installer: Arc::new(DirectoryInstaller::new(cfg.data_dir.join("installed"), inventory.clone())),
        update_service,
        cache: Some(Arc::new(DirCache::new(cfg.data_dir.join("cache")))),
        downloader_factory: HttpDownloader::factory(
            fetcher,
            cfg.data_dir.join("downloads"),
            config.webstore_update_url.clone(),
        ),
    };
    Ok(Services { inventory, prefs, collab, config })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();

    let mut cfg = UpdaterCliConfig {
        fetch: FetchContext::default(),
        webstore_url: None,
        inventory: PathBuf::from("./inventory.json"),
        data_dir: PathBuf::from("./updater-data"),
        use_update_service: false,
    };
    registry.apply_matches(&matches, &mut cfg)?;

    match matches.subcommand() {
        Some(("check", m)) => {
            let services = build_services(&cfg).await?;
            let config = UpdaterConfig { skip_scheduled_checks: true, ..services.config };
            let coordinator = UpdateCoordinator::new(config, services.collab);
            let ui_task = tokio::spawn(render_events(coordinator.subscribe()));

            coordinator.start().await?;
            let ids: Vec<String> = m.get_many::<String>("ids").map(|v| v.cloned().collect()).unwrap_or_default();
            let priority = if m.get_flag("foreground") { FetchPriority::Foreground } else { FetchPriority::Background };
            let params = CheckParams::for_ids(ids)
                .install_immediately(m.get_flag("install_immediately"))
                .priority(priority);

            let request_id = coordinator.check_and_wait(params).await?;
            coordinator.shutdown().await?;
            drop(coordinator);
            let _ = ui_task.await;
            println!("Check {} finished", request_id);
        }
        Some(("run", m)) => {
            let frequency_secs: u64 = m
                .get_one::<String>("frequency_secs")
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or(18000);
            let services = build_services(&cfg).await?;
            let config = UpdaterConfig {
                frequency: Duration::from_secs(frequency_secs),
                update_immediately_on_start: m.get_flag("immediately"),
                ..services.config
            };
            let coordinator = UpdateCoordinator::new(config, services.collab);
            let ui_task = tokio::spawn(render_events(coordinator.subscribe()));

            coordinator.start().await?;
            println!("Updater running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;

            coordinator.stop().await?;
            coordinator.shutdown().await?;
            drop(coordinator);
            let _ = ui_task.await;
        }
        Some(("prefs", _)) => {
            let services = build_services(&cfg).await?;
            let now = chrono::Utc::now();
            let installed = services.inventory.installed_extensions().await;
            if installed.is_empty() {
                println!("No installed extensions in {}", cfg.inventory.display());
            }
            for ext in installed {
                let data = ping::ping_data_for(services.prefs.as_ref(), services.inventory.as_ref(), &ext.id, now).await?;
                let last = services.prefs.last_ping_day(&ext.id).await?;
                println!(
                    "{} v{} rollcall_days={} active_days={} enabled={} disable_reasons={:#x} last_ping={}",
                    ext.id,
                    ext.version,
                    data.rollcall_days,
                    data.active_days,
                    data.is_enabled,
                    data.disable_reasons,
                    last.map(|d| d.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
                );
            }
        }
        Some(("mark-active", m)) => {
            let services = build_services(&cfg).await?;
            for id in m.get_many::<String>("ids").into_iter().flatten() {
                services.prefs.set_active_bit(id, true).await?;
                println!("{} marked active", id);
            }
        }
        _ => {}
    }

    Ok(())
}

/// Draws one spinner per extension until the event stream closes.
async fn render_events(mut rx: broadcast::Receiver<UpdaterEvent>) {
    let mp = MultiProgress::new();
    let sty = match ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}") {
        Ok(s) => s.tick_chars("|/-\\ "),
        Err(_) => ProgressStyle::default_spinner(),
    };
    let mut bars: HashMap<String, ProgressBar> = HashMap::new();

    let mut bar = |mp: &MultiProgress, id: &str| -> ProgressBar {
        bars.entry(id.to_string())
            .or_insert_with(|| {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(sty.clone());
                pb.set_prefix(format!("[{}]", id));
                pb.enable_steady_tick(Duration::from_millis(120));
                pb
            })
            .clone()
    };

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let _ = mp.println(format!("[WARN] skipped {} events", n));
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match evt {
            UpdaterEvent::UpdatingStarted => {
                let _ = mp.println("[CHECK] checking all extensions".to_string());
            }
            UpdaterEvent::CheckStarted { request_id, explicit_ids } => {
                if explicit_ids > 0 {
                    let _ = mp.println(format!("[CHECK] #{} started for {} extensions", request_id, explicit_ids));
                }
            }
            UpdaterEvent::CheckFinished { request_id } => {
                let _ = mp.println(format!("[CHECK] #{} finished", request_id));
            }
            UpdaterEvent::ChecksAbandoned { count } => {
                let _ = mp.println(format!("[CHECK] {} unfinished checks dropped", count));
            }
            UpdaterEvent::DownloadStage { extension_id, stage } => {
                bar(&mp, &extension_id).set_message(format!("{:?}", stage));
            }
            UpdaterEvent::CacheStatus { extension_id, status } => {
                bar(&mp, &extension_id).set_message(format!("cache {:?}", status));
            }
            UpdaterEvent::InstallStage { extension_id, stage } => {
                let pb = bar(&mp, &extension_id);
                match stage {
                    InstallStage::Complete => pb.finish_with_message("installed".to_string()),
                    s => pb.set_message(format!("{:?}", s)),
                }
            }
            UpdaterEvent::Failure { extension_id, reason, detail } => {
                let msg = match detail {
                    Some(d) => format!("{:?}: {}", reason, d),
                    None => format!("{:?}", reason),
                };
                bar(&mp, &extension_id).finish_with_message(msg);
            }
            UpdaterEvent::UpdateAvailable { extension_id, version } => {
                let _ = mp.println(format!("[UPDATE] {} -> {}", extension_id, version));
            }
            UpdaterEvent::Installed { extension_id, version } => {
                let _ = mp.println(format!("[INSTALLED] {} {}", extension_id, version));
            }
            UpdaterEvent::Error { scope, message } => {
                let _ = mp.println(format!("[ERR] {}: {}", scope, message));
            }
        }
    }
}
