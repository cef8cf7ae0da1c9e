//! JSON update manifest and the query string that requests it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;
use url::Url;

use crate::core::model::{PingData, PingResult, NEVER_PINGED};

/// Version reported for extensions that are not installed yet.
pub const NOT_INSTALLED_VERSION: &str = "0.0.0.0";

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest entry {index} has an empty id")]
    EmptyId { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub codebase: Option<String>,
    #[serde(default)]
    pub hash_sha256: Option<String>,
    #[serde(default)]
    pub info: Option<String>,
}

fn default_status() -> String {
    "ok".to_string()
}

impl ManifestEntry {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    /// Seconds since the server's day boundary; anchors ping days.
    #[serde(default)]
    pub daystart_elapsed_seconds: Option<i64>,
    #[serde(default)]
    pub extensions: Vec<ManifestEntry>,
}

impl UpdateManifest {
    /// Checks the document shape only. Entry versions are validated by
    /// whoever asked about that entry.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: UpdateManifest = serde_json::from_slice(bytes)?;
        if let Some(index) = manifest.extensions.iter().position(|e| e.id.is_empty()) {
            return Err(ManifestError::EmptyId { index });
        }
        Ok(manifest)
    }

    pub fn entry(&self, id: &str) -> Option<&ManifestEntry> {
        self.extensions.iter().find(|e| e.id == id)
    }

    pub fn day_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.daystart_elapsed_seconds
            .filter(|s| *s >= 0)
            .map(|s| now - Duration::seconds(s))
    }

    /// A ping counts only when it was sent and the server told us which day.
    pub fn ping_result(&self, sent_ping: bool, now: DateTime<Utc>) -> PingResult {
        match self.day_start(now) {
            Some(day_start) => PingResult { did_ping: sent_ping, day_start },
            None => PingResult { did_ping: false, day_start: now },
        }
    }
}

/// One extension's slot in a manifest request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestQuery {
    pub id: String,
    pub version: Option<String>,
    pub ping: Option<PingData>,
    pub update_url_data: Option<String>,
}

impl ManifestQuery {
    pub fn installed_version(&self) -> &str {
        self.version.as_deref().unwrap_or(NOT_INSTALLED_VERSION)
    }
}

pub fn ping_param(ping: &PingData) -> Option<String> {
    let mut parts = vec![];
    if ping.rollcall_days == NEVER_PINGED || ping.rollcall_days > 0 {
        parts.push(format!("r={}", ping.rollcall_days));
    }
    if ping.is_enabled {
        if ping.active_days == NEVER_PINGED || ping.active_days > 0 {
            parts.push(format!("a={}", ping.active_days));
        }
    } else {
        parts.push("e=0".to_string());
        if ping.disable_reasons != 0 {
            parts.push(format!("dr={}", ping.disable_reasons));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("&"))
    }
}

/// Appends one `x=` parameter per query, keeping whatever the base URL had.
pub fn build_fetch_url(base: &Url, queries: &[ManifestQuery]) -> Url {
    let mut url = base.clone();
    {
        let mut pairs = url.query_pairs_mut();
        for q in queries {
            let mut x = form_urlencoded::Serializer::new(String::new());
            x.append_pair("id", &q.id);
            x.append_pair("v", q.installed_version());
            if let Some(ping) = q.ping.as_ref().and_then(ping_param) {
                x.append_pair("ping", &ping);
            }
            if let Some(data) = &q.update_url_data {
                x.append_pair("ap", data);
            }
            pairs.append_pair("x", &x.finish());
        }
    }
    url
}
