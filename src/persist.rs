use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::read_snapshot;
use crate::detect::{merge_role, Classification};
use crate::error::TargetError;
use crate::models::{PartialSnapshot, RolePair};
use crate::retry::{with_backoff, Backoff};

/// One row of the scrape audit log, before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub success: bool,
    pub error_message: Option<String>,
    pub raw_data: Option<serde_json::Value>,
}

impl AttemptRecord {
    pub fn succeeded(raw_data: serde_json::Value) -> Self {
        Self {
            success: true,
            error_message: None,
            raw_data: Some(raw_data),
        }
    }

    pub fn failed(error: &TargetError, raw_data: Option<serde_json::Value>) -> Self {
        Self {
            success: false,
            error_message: Some(error.to_string()),
            raw_data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub history_appended: bool,
    pub change_id: Option<i64>,
}

pub struct PersistenceGateway<'a> {
    conn: &'a mut Connection,
}

impl<'a> PersistenceGateway<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Writes the audit row first, in its own statement, then applies the observation
    /// as a single transaction. Both phases retry with `backoff`.
    pub async fn commit(
        &mut self,
        url: &str,
        attempt: &AttemptRecord,
        observed: Option<(&PartialSnapshot, &Classification)>,
        backoff: Backoff,
    ) -> Result<CommitSummary, TargetError> {
        let persistence = |(attempts, e): (u32, rusqlite::Error)| TargetError::Persistence {
            attempts,
            reason: e.to_string(),
        };

        with_backoff("record_attempt", backoff, || self.record_attempt(url, attempt))
            .await
            .map_err(persistence)?;

        with_backoff("apply_observation", backoff, || self.apply(url, observed))
            .await
            .map_err(persistence)
    }

    pub fn record_attempt(&self, url: &str, attempt: &AttemptRecord) -> rusqlite::Result<i64> {
        let raw = attempt.raw_data.as_ref().map(|v| v.to_string());
        self.conn.execute(
            "INSERT INTO scrape_history (profile_url, scraped_at, success, error_message, raw_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![url, Utc::now(), attempt.success, attempt.error_message, raw],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Snapshot upsert, history append, change record and `last_checked`, all or nothing.
    pub fn apply(
        &mut self,
        url: &str,
        observed: Option<(&PartialSnapshot, &Classification)>,
    ) -> rusqlite::Result<CommitSummary> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        let mut summary = CommitSummary::default();

        if let Some((snapshot, classification)) = observed {
            let previous = read_snapshot(&tx, url)?;

            // Null never overwrites a known value.
            tx.execute(
                "INSERT INTO profiles (url, name, headline, current_position, current_company, last_updated, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(url) DO UPDATE SET
                    name = COALESCE(excluded.name, profiles.name),
                    headline = COALESCE(excluded.headline, profiles.headline),
                    current_position = COALESCE(excluded.current_position, profiles.current_position),
                    current_company = COALESCE(excluded.current_company, profiles.current_company),
                    last_updated = excluded.last_updated",
                params![
                    url,
                    snapshot.name,
                    snapshot.headline,
                    snapshot.position,
                    snapshot.company,
                    now
                ],
            )?;

            let before = previous.as_ref().map(|p| p.role()).unwrap_or_default();
            let merged = merge_role(&before, &snapshot.role());

            if *classification != Classification::Unchanged && !merged.is_unknown() {
                let latest = tx
                    .query_row(
                        "SELECT position, company FROM job_history
                         WHERE profile_url = ?1 ORDER BY id DESC LIMIT 1",
                        [url],
                        |row| Ok(RolePair { position: row.get(0)?, company: row.get(1)? }),
                    )
                    .optional()?;
                if latest.as_ref() != Some(&merged) {
                    tx.execute(
                        "INSERT INTO job_history (profile_url, position, company, detected_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![url, merged.position, merged.company, now],
                    )?;
                    summary.history_appended = true;
                    debug!(url, position = ?merged.position, company = ?merged.company, "history appended");
                }
            }

            if let Classification::MaterialChange { old, new } = classification {
                let latest = tx
                    .query_row(
                        "SELECT old_position, old_company, new_position, new_company FROM job_changes
                         WHERE profile_url = ?1 ORDER BY id DESC LIMIT 1",
                        [url],
                        |row| {
                            Ok((
                                RolePair { position: row.get(0)?, company: row.get(1)? },
                                RolePair { position: row.get(2)?, company: row.get(3)? },
                            ))
                        },
                    )
                    .optional()?;
                if latest.as_ref() != Some(&(old.clone(), new.clone())) {
                    let name = snapshot
                        .name
                        .clone()
                        .or_else(|| previous.as_ref().and_then(|p| p.display_name.clone()));
                    tx.execute(
                        "INSERT INTO job_changes (profile_url, name, old_position, old_company, new_position, new_company, detected_at, notified)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                        params![url, name, old.position, old.company, new.position, new.company, now],
                    )?;
                    let id = tx.last_insert_rowid();
                    summary.change_id = Some(id);
                    info!(url, change_id = id, "job change recorded");
                } else {
                    debug!(url, "transition already recorded, skipping duplicate change");
                }
            }
        }

        tx.execute(
            "UPDATE monitored_profiles SET last_checked = ?1 WHERE url = ?2",
            params![now, url],
        )?;
        tx.commit()?;
        Ok(summary)
    }

    /// Drops the observed state of a url so a later re-add starts from NoPriorData.
    /// The audit log and recorded changes are kept.
    pub fn forget_profile(&mut self, url: &str) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM job_history WHERE profile_url = ?1", [url])?;
        tx.execute("DELETE FROM profiles WHERE url = ?1", [url])?;
        tx.commit()?;
        debug!(url, "observed state forgotten");
        Ok(())
    }

    /// Flips `notified` once; a second call for the same event is a no-op.
    pub fn mark_notified(&self, change_id: i64) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE job_changes SET notified = 1 WHERE id = ?1 AND notified = 0",
            [change_id],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::detect::classify;
    use std::time::Duration;

    const URL: &str = "https://www.linkedin.com/in/x/";

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.registry().add(URL, Some("X"), 24).unwrap();
        db
    }

    fn observed(position: Option<&str>, company: Option<&str>) -> PartialSnapshot {
        PartialSnapshot {
            name: Some("X".to_string()),
            headline: Some("Headline".to_string()),
            position: position.map(str::to_string),
            company: company.map(str::to_string),
            experience: Vec::new(),
        }
    }

    fn no_wait() -> Backoff {
        Backoff::new(2, Duration::ZERO)
    }

    async fn observe(db: &mut Database, snap: &PartialSnapshot) -> CommitSummary {
        let previous = db.get_snapshot(URL).unwrap();
        let class = classify(previous.as_ref(), snap);
        db.gateway()
            .commit(URL, &AttemptRecord::succeeded(serde_json::json!({})), Some((snap, &class)), no_wait())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_observation_seeds_snapshot_and_history() {
        let mut db = setup();
        let summary = observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        assert!(summary.history_appended);
        assert_eq!(summary.change_id, None);

        let snap = db.get_snapshot(URL).unwrap().unwrap();
        assert_eq!(snap.current_position.as_deref(), Some("Engineer"));
        assert_eq!(db.list_history(URL).unwrap().len(), 1);
        assert!(db.list_changes(None, false).unwrap().is_empty());
        assert!(db.get_target(URL).unwrap().unwrap().last_checked.is_some());
    }

    #[tokio::test]
    async fn test_partial_scrape_never_nulls_known_fields() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        observe(&mut db, &PartialSnapshot::default()).await;

        let snap = db.get_snapshot(URL).unwrap().unwrap();
        assert_eq!(snap.display_name.as_deref(), Some("X"));
        assert_eq!(snap.headline.as_deref(), Some("Headline"));
        assert_eq!(snap.current_position.as_deref(), Some("Engineer"));
        assert_eq!(snap.current_company.as_deref(), Some("A"));
        assert_eq!(db.list_history(URL).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_material_change_records_event() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        let summary = observe(&mut db, &observed(Some("Senior Engineer"), Some("A"))).await;
        assert!(summary.change_id.is_some());

        let changes = db.list_changes(Some(URL), false).unwrap();
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.old_position.as_deref(), Some("Engineer"));
        assert_eq!(change.old_company.as_deref(), Some("A"));
        assert_eq!(change.new_position.as_deref(), Some("Senior Engineer"));
        assert_eq!(change.new_company.as_deref(), Some("A"));
        assert!(!change.notified);
        assert_eq!(db.list_history(URL).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_commit_twice_is_idempotent() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;

        let prev = db.get_snapshot(URL).unwrap();
        let snap = observed(Some("Senior Engineer"), Some("A"));
        let class = classify(prev.as_ref(), &snap);
        let attempt = AttemptRecord::succeeded(serde_json::json!({}));
        for _ in 0..2 {
            db.gateway()
                .commit(URL, &attempt, Some((&snap, &class)), no_wait())
                .await
                .unwrap();
        }

        assert_eq!(db.list_changes(Some(URL), false).unwrap().len(), 1);
        assert_eq!(db.list_history(URL).unwrap().len(), 2);
        assert_eq!(db.list_attempts(Some(URL), 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_but_keeps_attempt() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        let prev = db.get_snapshot(URL).unwrap();

        db.gateway().conn.execute_batch("DROP TABLE job_changes").unwrap();

        let snap = observed(Some("Manager"), Some("B"));
        let class = classify(prev.as_ref(), &snap);
        let err = db
            .gateway()
            .commit(URL, &AttemptRecord::succeeded(serde_json::json!({})), Some((&snap, &class)), no_wait())
            .await
            .unwrap_err();
        assert!(matches!(err, TargetError::Persistence { attempts: 2, .. }));

        let snap_after = db.get_snapshot(URL).unwrap().unwrap();
        assert_eq!(snap_after.current_position.as_deref(), Some("Engineer"));
        assert_eq!(db.list_history(URL).unwrap().len(), 1);
        assert_eq!(db.list_attempts(Some(URL), 10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_only_touches_audit_and_last_checked() {
        let mut db = setup();
        let attempt = AttemptRecord::failed(&TargetError::Blocked, None);
        db.gateway().commit(URL, &attempt, None, no_wait()).await.unwrap();

        let attempts = db.list_attempts(Some(URL), 10).unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].error_message.as_deref(), Some("blocked by verification challenge"));
        assert!(db.get_snapshot(URL).unwrap().is_none());
        assert!(db.get_target(URL).unwrap().unwrap().last_checked.is_some());
    }

    #[tokio::test]
    async fn test_headline_only_update_adds_no_history_or_event() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;

        let prev = db.get_snapshot(URL).unwrap();
        let mut snap = observed(Some("Engineer"), Some("A"));
        snap.headline = Some("Engineer at A, open to work".to_string());
        let class = classify(prev.as_ref(), &snap);
        assert_eq!(class, Classification::Updated);

        let summary = db
            .gateway()
            .commit(URL, &AttemptRecord::succeeded(serde_json::json!({})), Some((&snap, &class)), no_wait())
            .await
            .unwrap();
        assert_eq!(summary, CommitSummary::default());
        assert_eq!(db.list_history(URL).unwrap().len(), 1);
        assert!(db.list_changes(None, false).unwrap().is_empty());
        let stored = db.get_snapshot(URL).unwrap().unwrap();
        assert_eq!(stored.headline.as_deref(), Some("Engineer at A, open to work"));
    }

    #[tokio::test]
    async fn test_forgotten_profile_starts_over_as_no_prior_data() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        observe(&mut db, &observed(Some("Engineer"), Some("B"))).await;

        db.registry().remove(URL).unwrap();
        db.gateway().forget_profile(URL).unwrap();
        assert!(db.get_snapshot(URL).unwrap().is_none());
        assert!(db.list_history(URL).unwrap().is_empty());
        assert_eq!(db.list_changes(Some(URL), false).unwrap().len(), 1);
        assert_eq!(db.list_attempts(Some(URL), 10).unwrap().len(), 2);

        db.registry().add(URL, Some("X"), 24).unwrap();
        let snap = observed(Some("Manager"), Some("C"));
        let class = classify(db.get_snapshot(URL).unwrap().as_ref(), &snap);
        assert_eq!(class, Classification::NoPriorData);
    }

    #[tokio::test]
    async fn test_mark_notified_once() {
        let mut db = setup();
        observe(&mut db, &observed(Some("Engineer"), Some("A"))).await;
        let summary = observe(&mut db, &observed(Some("Engineer"), Some("B"))).await;
        let id = summary.change_id.unwrap();

        assert!(db.gateway().mark_notified(id).unwrap());
        assert!(!db.gateway().mark_notified(id).unwrap());
        assert!(db.list_changes(None, true).unwrap().is_empty());
    }
}
