use chrono::{DateTime, Utc};

use crate::core::model::{PingData, PingResult, NEVER_PINGED};
use crate::plugins::registry::{ExtensionService, PrefsStore};

/// Clock skew can make the difference negative; that is reported as zero
/// since -1 already means "never pinged".
pub fn sanitize_days(days: i64) -> i32 {
    days.clamp(0, i32::MAX as i64) as i32
}

pub fn ping_days(last_ping_day: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i32 {
    match last_ping_day {
        Some(day) => sanitize_days((now - day).num_days()),
        None => NEVER_PINGED,
    }
}

pub fn active_ping_days(last_active_ping_day: Option<DateTime<Utc>>, has_active_bit: bool, now: DateTime<Utc>) -> i32 {
    if !has_active_bit {
        return 0;
    }
    match last_active_ping_day {
        Some(day) => sanitize_days((now - day).num_days()),
        None => NEVER_PINGED,
    }
}

pub async fn ping_data_for(
    prefs: &dyn PrefsStore,
    service: &dyn ExtensionService,
    id: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<PingData> {
    let is_enabled = service.is_extension_enabled(id).await;
    let disable_reasons = if is_enabled { 0 } else { prefs.disable_reasons(id).await? };
    let active_bit = prefs.active_bit(id).await?;
    Ok(PingData {
        rollcall_days: ping_days(prefs.last_ping_day(id).await?, now),
        active_days: active_ping_days(prefs.last_active_ping_day(id).await?, active_bit, now),
        is_enabled,
        disable_reasons,
    })
}

/// Records the day a ping was attributed to and consumes the active bit.
pub async fn update_ping_data(prefs: &dyn PrefsStore, id: &str, ping: &PingResult) -> anyhow::Result<()> {
    if ping.did_ping {
        prefs.set_last_ping_day(id, ping.day_start).await?;
    }
    if prefs.active_bit(id).await? {
        prefs.set_active_bit(id, false).await?;
        prefs.set_last_active_ping_day(id, ping.day_start).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryPrefs;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn never_pinged_is_sentinel() {
        assert_eq!(ping_days(None, now()), NEVER_PINGED);
    }

    #[test]
    fn days_since_last_ping() {
        assert_eq!(ping_days(Some(now() - Duration::days(3)), now()), 3);
        assert_eq!(ping_days(Some(now() - Duration::hours(23)), now()), 0);
    }

    #[test]
    fn future_ping_day_sanitized_to_zero() {
        assert_eq!(ping_days(Some(now() + Duration::days(5)), now()), 0);
        assert_eq!(sanitize_days(-4), 0);
    }

    #[test]
    fn active_days_need_active_bit() {
        let last = Some(now() - Duration::days(2));
        assert_eq!(active_ping_days(last, false, now()), 0);
        assert_eq!(active_ping_days(last, true, now()), 2);
        assert_eq!(active_ping_days(None, true, now()), NEVER_PINGED);
    }

    #[tokio::test]
    async fn update_consumes_active_bit() {
        let prefs = MemoryPrefs::new();
        prefs.set_active_bit("a", true).await.unwrap();
        let day = now();
        update_ping_data(&prefs, "a", &PingResult { did_ping: true, day_start: day }).await.unwrap();

        assert_eq!(prefs.last_ping_day("a").await.unwrap(), Some(day));
        assert_eq!(prefs.last_active_ping_day("a").await.unwrap(), Some(day));
        assert!(!prefs.active_bit("a").await.unwrap());
    }

    #[tokio::test]
    async fn no_ping_leaves_rollcall_untouched() {
        let prefs = MemoryPrefs::new();
        update_ping_data(&prefs, "a", &PingResult { did_ping: false, day_start: now() }).await.unwrap();
        assert_eq!(prefs.last_ping_day("a").await.unwrap(), None);
        assert_eq!(prefs.last_active_ping_day("a").await.unwrap(), None);
    }
}
