use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::models::{JobChangeEvent, MonitoredTarget, PositionHistoryEntry, ProfileSnapshot, ScrapeAttempt};
use crate::persist::PersistenceGateway;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::configure(conn, path.to_path_buf())
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Self::configure(Connection::open_in_memory()?, PathBuf::from(":memory:"))?;
        db.init()?;
        Ok(db)
    }

    fn configure(conn: Connection, path: PathBuf) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS monitored_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                name TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL,
                last_checked TEXT,
                check_frequency_hours INTEGER NOT NULL DEFAULT 24
            );

            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                name TEXT,
                headline TEXT,
                current_position TEXT,
                current_company TEXT,
                last_updated TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS job_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_url TEXT NOT NULL REFERENCES profiles(url),
                position TEXT,
                company TEXT,
                detected_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scrape_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_url TEXT NOT NULL,
                scraped_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                raw_data TEXT
            );

            CREATE TABLE IF NOT EXISTS job_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_url TEXT NOT NULL,
                name TEXT,
                old_position TEXT,
                old_company TEXT,
                new_position TEXT,
                new_company TEXT,
                detected_at TEXT NOT NULL,
                notified INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_job_history_url ON job_history(profile_url);
            CREATE INDEX IF NOT EXISTS idx_scrape_history_url ON scrape_history(profile_url);
            CREATE INDEX IF NOT EXISTS idx_job_changes_url ON job_changes(profile_url);
            CREATE INDEX IF NOT EXISTS idx_job_changes_notified ON job_changes(notified);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='monitored_profiles'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'jobwatch init' first."));
        }
        Ok(())
    }

    /// Operator-facing capability. It can only write `monitored_profiles`.
    pub fn registry(&self) -> TargetRegistry<'_> {
        TargetRegistry { conn: &self.conn }
    }

    /// Monitoring-core capability. The only writer of snapshot, history, audit and change rows.
    pub fn gateway(&mut self) -> PersistenceGateway<'_> {
        PersistenceGateway::new(&mut self.conn)
    }

    // --- Reads ---

    pub fn list_targets(&self, active_only: bool) -> Result<Vec<MonitoredTarget>> {
        let mut sql = String::from(
            "SELECT id, url, name, active, added_at, last_checked, check_frequency_hours
             FROM monitored_profiles",
        );
        if active_only {
            sql.push_str(" WHERE active = 1");
        }
        sql.push_str(" ORDER BY added_at, id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_target)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list monitored profiles")
    }

    pub fn due_targets(&self, now: DateTime<Utc>) -> Result<Vec<MonitoredTarget>> {
        Ok(self
            .list_targets(true)?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect())
    }

    pub fn get_target(&self, url: &str) -> Result<Option<MonitoredTarget>> {
        self.conn
            .query_row(
                "SELECT id, url, name, active, added_at, last_checked, check_frequency_hours
                 FROM monitored_profiles WHERE url = ?1",
                [url],
                Self::row_to_target,
            )
            .optional()
            .context("Failed to read monitored profile")
    }

    pub fn get_snapshot(&self, url: &str) -> Result<Option<ProfileSnapshot>> {
        read_snapshot(&self.conn, url).context("Failed to read profile snapshot")
    }

    pub fn list_history(&self, url: &str) -> Result<Vec<PositionHistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, profile_url, position, company, detected_at
             FROM job_history WHERE profile_url = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([url], |row| {
            Ok(PositionHistoryEntry {
                id: row.get(0)?,
                profile_url: row.get(1)?,
                position: row.get(2)?,
                company: row.get(3)?,
                detected_at: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list position history")
    }

    pub fn list_attempts(&self, url: Option<&str>, limit: usize) -> Result<Vec<ScrapeAttempt>> {
        let mut sql = String::from(
            "SELECT id, profile_url, scraped_at, success, error_message, raw_data FROM scrape_history",
        );
        if url.is_some() {
            sql.push_str(" WHERE profile_url = ?2");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?1");

        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match url {
            Some(u) => stmt.query_map(params![limit, u], Self::row_to_attempt)?,
            None => stmt.query_map(params![limit], Self::row_to_attempt)?,
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list scrape attempts")
    }

    pub fn list_changes(&self, url: Option<&str>, pending_only: bool) -> Result<Vec<JobChangeEvent>> {
        let mut sql = String::from(
            "SELECT id, profile_url, name, old_position, old_company, new_position, new_company,
                    detected_at, notified
             FROM job_changes WHERE 1=1",
        );
        if pending_only {
            sql.push_str(" AND notified = 0");
        }
        if url.is_some() {
            sql.push_str(" AND profile_url = ?1");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = match url {
            Some(u) => stmt.query_map([u], row_to_change)?,
            None => stmt.query_map([], row_to_change)?,
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list job changes")
    }

    fn row_to_target(row: &rusqlite::Row) -> rusqlite::Result<MonitoredTarget> {
        Ok(MonitoredTarget {
            id: row.get(0)?,
            url: row.get(1)?,
            display_name: row.get(2)?,
            active: row.get(3)?,
            added_at: row.get(4)?,
            last_checked: row.get(5)?,
            check_frequency_hours: row.get(6)?,
        })
    }

    fn row_to_attempt(row: &rusqlite::Row) -> rusqlite::Result<ScrapeAttempt> {
        let raw: Option<String> = row.get(5)?;
        Ok(ScrapeAttempt {
            id: row.get(0)?,
            profile_url: row.get(1)?,
            scraped_at: row.get(2)?,
            success: row.get(3)?,
            error_message: row.get(4)?,
            raw_data: raw.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

pub(crate) fn read_snapshot(conn: &Connection, url: &str) -> rusqlite::Result<Option<ProfileSnapshot>> {
    conn.query_row(
        "SELECT id, url, name, headline, current_position, current_company, last_updated, created_at
         FROM profiles WHERE url = ?1",
        [url],
        |row| {
            Ok(ProfileSnapshot {
                id: row.get(0)?,
                url: row.get(1)?,
                display_name: row.get(2)?,
                headline: row.get(3)?,
                current_position: row.get(4)?,
                current_company: row.get(5)?,
                last_updated: row.get(6)?,
                created_at: row.get(7)?,
            })
        },
    )
    .optional()
}

pub(crate) fn row_to_change(row: &rusqlite::Row) -> rusqlite::Result<JobChangeEvent> {
    Ok(JobChangeEvent {
        id: row.get(0)?,
        profile_url: row.get(1)?,
        display_name: row.get(2)?,
        old_position: row.get(3)?,
        old_company: row.get(4)?,
        new_position: row.get(5)?,
        new_company: row.get(6)?,
        detected_at: row.get(7)?,
        notified: row.get(8)?,
    })
}

pub struct TargetRegistry<'a> {
    conn: &'a Connection,
}

impl TargetRegistry<'_> {
    pub fn add(&self, url: &str, name: Option<&str>, check_frequency_hours: i64) -> Result<i64> {
        validate_frequency(check_frequency_hours)?;
        let url = normalize_profile_url(url).ok_or_else(|| anyhow!("Not a profile URL: '{}'", url))?;
        self.conn
            .execute(
                "INSERT INTO monitored_profiles (url, name, active, added_at, check_frequency_hours)
                 VALUES (?1, ?2, 1, ?3, ?4)",
                params![url, name, Utc::now(), check_frequency_hours],
            )
            .with_context(|| format!("Failed to add '{}' (already monitored?)", url))?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn remove(&self, url: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM monitored_profiles WHERE url = ?1", [url])?;
        Ok(changed > 0)
    }

    pub fn set_active(&self, url: &str, active: bool) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE monitored_profiles SET active = ?1 WHERE url = ?2",
            params![active, url],
        )?;
        Ok(changed > 0)
    }

    pub fn set_frequency(&self, url: &str, hours: i64) -> Result<bool> {
        validate_frequency(hours)?;
        let changed = self.conn.execute(
            "UPDATE monitored_profiles SET check_frequency_hours = ?1 WHERE url = ?2",
            params![hours, url],
        )?;
        Ok(changed > 0)
    }
}

/// Longest accepted check frequency: one year.
pub const MAX_CHECK_FREQUENCY_HOURS: i64 = 24 * 366;

fn validate_frequency(hours: i64) -> Result<()> {
    if !(1..=MAX_CHECK_FREQUENCY_HOURS).contains(&hours) {
        return Err(anyhow!(
            "Check frequency must be between 1 and {} hours, got {}",
            MAX_CHECK_FREQUENCY_HOURS,
            hours
        ));
    }
    Ok(())
}

/// Strips tracking query parameters and fragments, and normalizes the trailing slash.
pub fn normalize_profile_url(url: &str) -> Option<String> {
    let url = url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return None;
    }
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let base = url[..end].trim_end_matches('/');
    if base.len() <= "https://".len() {
        return None;
    }
    Some(format!("{}/", base))
}
