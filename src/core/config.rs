use crate::core::planner::clamp_frequency;
use std::time::Duration;
use url::Url;

pub const DEFAULT_FREQUENCY: Duration = Duration::from_secs(60 * 60 * 5);
pub const MIN_FREQUENCY: Duration = Duration::from_secs(30);
pub const MAX_FREQUENCY: Duration = Duration::from_secs(60 * 60 * 24 * 7);
pub const WEBSTORE_UPDATE_URL: &str = "https://clients2.google.com/service/update2/crx";

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Base period between scheduled checks. Clamped on use.
    pub frequency: Duration,
    pub min_frequency: Duration,
    pub max_frequency: Duration,
    pub webstore_update_url: Url,
    /// Start without scheduling any checks; only explicit `check_now` runs.
    pub skip_scheduled_checks: bool,
    /// Route every extension through the batched update service.
    pub force_update_service: bool,
    /// Run the first check synchronously inside `start()` instead of "soon".
    pub update_immediately_on_start: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
            min_frequency: MIN_FREQUENCY,
            max_frequency: MAX_FREQUENCY,
            webstore_update_url: default_webstore_url(),
            skip_scheduled_checks: false,
            force_update_service: false,
            update_immediately_on_start: false,
        }
    }
}

impl UpdaterConfig {
    pub fn with_frequency(frequency: Duration) -> Self {
        Self { frequency, ..Self::default() }
    }

    pub fn effective_frequency(&self) -> Duration {
        clamp_frequency(self.frequency, self.min_frequency, self.max_frequency)
    }

    /// Query strings are ignored: the webstore appends its own.
    pub fn is_webstore_update_url(&self, url: &Url) -> bool {
        let w = &self.webstore_update_url;
        url.scheme() == w.scheme()
            && url.host_str() == w.host_str()
            && url.port_or_known_default() == w.port_or_known_default()
            && url.path().trim_end_matches('/') == w.path().trim_end_matches('/')
    }
}

fn default_webstore_url() -> Url {
    Url::parse(WEBSTORE_UPDATE_URL).expect("webstore update url")
}
