use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;

use crate::core::model::ExtensionId;
use crate::plugins::registry::PrefsStore;

/// Per-extension update prefs persisted in sqlite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first open
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS extension_prefs (
              id TEXT PRIMARY KEY,
              last_ping_day INTEGER NULL,
              last_active_ping_day INTEGER NULL,
              active_bit INTEGER NOT NULL DEFAULT 0,
              disable_reasons INTEGER NOT NULL DEFAULT 0,
              update_url_data TEXT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }

    async fn ensure_row(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query(r#"INSERT OR IGNORE INTO extension_prefs (id, updated_at) VALUES (?, ?);"#)
            .bind(id)
            .bind(Self::now_epoch())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn read_day(&self, id: &str, column: &'static str) -> anyhow::Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT {} AS v FROM extension_prefs WHERE id = ?;", column);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read {} for {}", column, id))?;
        Ok(row
            .and_then(|r| r.try_get::<Option<i64>, _>("v").ok().flatten())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    async fn write_day(&self, id: &str, column: &'static str, day: DateTime<Utc>) -> anyhow::Result<()> {
        self.ensure_row(id).await?;
        let sql = format!("UPDATE extension_prefs SET {} = ?, updated_at = ? WHERE id = ?;", column);
        sqlx::query(&sql)
            .bind(day.timestamp())
            .bind(Self::now_epoch())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_disable_reasons(&self, id: &str, reasons: u32) -> anyhow::Result<()> {
        self.ensure_row(id).await?;
        sqlx::query(r#"UPDATE extension_prefs SET disable_reasons = ?, updated_at = ? WHERE id = ?;"#)
            .bind(reasons as i64)
            .bind(Self::now_epoch())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_update_url_data(&self, id: &str, data: Option<&str>) -> anyhow::Result<()> {
        self.ensure_row(id).await?;
        sqlx::query(r#"UPDATE extension_prefs SET update_url_data = ?, updated_at = ? WHERE id = ?;"#)
            .bind(data)
            .bind(Self::now_epoch())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PrefsStore for SqliteStore {
    async fn last_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.read_day(id, "last_ping_day").await
    }

    async fn set_last_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()> {
        self.write_day(id, "last_ping_day", day).await
    }

    async fn last_active_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.read_day(id, "last_active_ping_day").await
    }

    async fn set_last_active_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()> {
        self.write_day(id, "last_active_ping_day", day).await
    }

    async fn active_bit(&self, id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query(r#"SELECT active_bit FROM extension_prefs WHERE id = ?;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("active_bit") != 0).unwrap_or(false))
    }

    async fn set_active_bit(&self, id: &str, active: bool) -> anyhow::Result<()> {
        self.ensure_row(id).await?;
        sqlx::query(r#"UPDATE extension_prefs SET active_bit = ?, updated_at = ? WHERE id = ?;"#)
            .bind(if active { 1i64 } else { 0i64 })
            .bind(Self::now_epoch())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_reasons(&self, id: &str) -> anyhow::Result<u32> {
        let row = sqlx::query(r#"SELECT disable_reasons FROM extension_prefs WHERE id = ?;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("disable_reasons") as u32).unwrap_or(0))
    }

    async fn update_url_data(&self, id: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(r#"SELECT update_url_data FROM extension_prefs WHERE id = ?;"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.try_get::<Option<String>, _>("update_url_data").ok().flatten()))
    }
}

#[derive(Debug, Clone, Default)]
struct PrefsRecord {
    last_ping_day: Option<DateTime<Utc>>,
    last_active_ping_day: Option<DateTime<Utc>>,
    active_bit: bool,
    disable_reasons: u32,
    update_url_data: Option<String>,
}

/// Non-persistent prefs, for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryPrefs {
    records: Mutex<HashMap<ExtensionId, PrefsRecord>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_disable_reasons(&self, id: &str, reasons: u32) {
        self.records.lock().await.entry(id.to_string()).or_default().disable_reasons = reasons;
    }

    pub async fn set_update_url_data(&self, id: &str, data: Option<&str>) {
        self.records.lock().await.entry(id.to_string()).or_default().update_url_data = data.map(str::to_string);
    }

    async fn read<T>(&self, id: &str, f: impl FnOnce(&PrefsRecord) -> T) -> T
    where
        T: Default,
    {
        self.records.lock().await.get(id).map(f).unwrap_or_default()
    }

    async fn write(&self, id: &str, f: impl FnOnce(&mut PrefsRecord)) {
        f(self.records.lock().await.entry(id.to_string()).or_default());
    }
}

#[async_trait]
impl PrefsStore for MemoryPrefs {
    async fn last_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.read(id, |r| r.last_ping_day).await)
    }

    async fn set_last_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()> {
        self.write(id, |r| r.last_ping_day = Some(day)).await;
        Ok(())
    }

    async fn last_active_ping_day(&self, id: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.read(id, |r| r.last_active_ping_day).await)
    }

    async fn set_last_active_ping_day(&self, id: &str, day: DateTime<Utc>) -> anyhow::Result<()> {
        self.write(id, |r| r.last_active_ping_day = Some(day)).await;
        Ok(())
    }

    async fn active_bit(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.read(id, |r| r.active_bit).await)
    }

    async fn set_active_bit(&self, id: &str, active: bool) -> anyhow::Result<()> {
        self.write(id, |r| r.active_bit = active).await;
        Ok(())
    }

    async fn disable_reasons(&self, id: &str) -> anyhow::Result<u32> {
        Ok(self.read(id, |r| r.disable_reasons).await)
    }

    async fn update_url_data(&self, id: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read(id, |r| r.update_url_data.clone()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::disable_reason;

    #[tokio::test]
    async fn sqlite_round_trips_prefs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("prefs.sqlite")).await.unwrap();

        assert_eq!(store.last_ping_day("abc").await.unwrap(), None);
        assert!(!store.active_bit("abc").await.unwrap());

        let day = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.set_last_ping_day("abc", day).await.unwrap();
        store.set_active_bit("abc", true).await.unwrap();
        store.set_disable_reasons("abc", disable_reason::REMOTELY_FOR_MALWARE).await.unwrap();
        store.set_update_url_data("abc", Some("brand=XYZ")).await.unwrap();

        assert_eq!(store.last_ping_day("abc").await.unwrap(), Some(day));
        assert_eq!(store.last_active_ping_day("abc").await.unwrap(), None);
        assert!(store.active_bit("abc").await.unwrap());
        assert_eq!(store.disable_reasons("abc").await.unwrap(), disable_reason::REMOTELY_FOR_MALWARE);
        assert_eq!(store.update_url_data("abc").await.unwrap().as_deref(), Some("brand=XYZ"));
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.sqlite");
        let day = Utc.with_ymd_and_hms(2024, 5, 6, 0, 0, 0).unwrap();
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.set_last_active_ping_day("x", day).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.last_active_ping_day("x").await.unwrap(), Some(day));
    }

    #[tokio::test]
    async fn memory_prefs_defaults() {
        let prefs = MemoryPrefs::new();
        assert_eq!(prefs.disable_reasons("nope").await.unwrap(), 0);
        prefs.set_update_url_data("a", Some("d")).await;
        assert_eq!(prefs.update_url_data("a").await.unwrap().as_deref(), Some("d"));
    }
}
