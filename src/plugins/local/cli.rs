use crate::plugins::registry::{CliPlugin, UpdaterCliConfig};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct LocalCliPlugin;

impl LocalCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for LocalCliPlugin {
    fn name(&self) -> &'static str {
        "local"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("local_inventory")
                .long("inventory")
                .help_heading("Local")
                .help("JSON file listing installed and pending extensions")
                .default_value("./inventory.json")
                .num_args(1),
        )
        .arg(
            Arg::new("local_data_dir")
                .long("data-dir")
                .help_heading("Local")
                .help("Directory for prefs, downloads, installs and the crx cache")
                .default_value("./updater-data")
                .num_args(1),
        )
        .arg(
            Arg::new("local_use_update_service")
                .long("use-update-service")
                .help_heading("Local")
                .help("Check gallery extensions with one batched request instead of per-extension fetches")
                .action(ArgAction::SetTrue),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut UpdaterCliConfig) -> anyhow::Result<()> {
        if let Some(p) = matches.get_one::<String>("local_inventory") {
            cfg.inventory = p.into();
        }
        if let Some(p) = matches.get_one::<String>("local_data_dir") {
            cfg.data_dir = p.into();
        }
        cfg.use_update_service = matches.get_flag("local_use_update_service");
        Ok(())
    }
}
