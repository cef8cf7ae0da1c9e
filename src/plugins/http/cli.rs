use crate::plugins::registry::{CliPlugin, UpdaterCliConfig};
use clap::{Arg, ArgMatches, Command};
use url::Url;

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value("OrangeUpdater/0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("HTTP timeout in seconds")
                .default_value("60")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("HTTP retries for transient errors")
                .default_value("2")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Retry backoff base in milliseconds")
                .default_value("400")
                .num_args(1),
        )
        .arg(
            Arg::new("http_webstore_url")
                .long("webstore-url")
                .help_heading("HTTP")
                .help("Update URL treated as the gallery; also the default for extensions without one")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut UpdaterCliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.fetch.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            cfg.fetch.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retries") {
            cfg.fetch.retries = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retry_backoff_ms") {
            cfg.fetch.retry_backoff_ms = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_webstore_url") {
            cfg.webstore_url = Some(Url::parse(s).map_err(|e| anyhow::anyhow!("invalid --webstore-url {}: {}", s, e))?);
        }
        Ok(())
    }
}
