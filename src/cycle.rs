use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::db::{normalize_profile_url, Database};
use crate::detect::{classify, Classification};
use crate::error::{CycleError, TargetError};
use crate::extract::extract;
use crate::fetcher::{FetchOutcome, ProfileFetcher};
use crate::models::MonitoredTarget;
use crate::persist::AttemptRecord;
use crate::retry::{with_backoff, RetryPolicy};
use crate::session::SessionState;

/// Exclusive marker that a cycle is running. Removed when dropped.
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    /// Takes the lock, reclaiming it if the existing file is older than `stale_after`.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self, CycleError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    writeln!(file, "{}", Utc::now().to_rfc3339())?;
                    debug!(path = %path.display(), "cycle lock acquired");
                    return Ok(Self { path: path.to_path_buf() });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let age = fs::metadata(path)?
                        .modified()
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok())
                        .unwrap_or_default();
                    if age >= stale_after {
                        warn!(path = %path.display(), ?age, "reclaiming stale cycle lock");
                        fs::remove_file(path)?;
                        continue;
                    }
                    let holder = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.lines().next().map(str::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    return Err(CycleError::LockHeld(path.display().to_string(), holder));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CycleError::LockHeld(path.display().to_string(), "unknown".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refreshes the lock's age so a long cycle is not mistaken for a stale one.
    pub fn touch(&self) -> std::io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_modified(SystemTime::now())
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not release cycle lock");
        }
    }
}

/// Which monitored targets a cycle should visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Active targets whose check frequency has elapsed.
    Due,
    /// Every active target.
    All,
    One(String),
}

pub fn select_targets(db: &Database, selection: &Selection, now: DateTime<Utc>) -> Result<Vec<MonitoredTarget>> {
    match selection {
        Selection::Due => db.due_targets(now),
        Selection::All => db.list_targets(true),
        Selection::One(url) => {
            let url = normalize_profile_url(url).unwrap_or_else(|| url.clone());
            let target = db
                .get_target(&url)?
                .ok_or_else(|| anyhow!("'{}' is not monitored. Add it with 'jobwatch add'.", url))?;
            Ok(vec![target])
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    Committed {
        classification: Classification,
        change_id: Option<i64>,
    },
    Failed(TargetError),
    /// Not visited because the cycle was interrupted first.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TargetReport {
    pub url: String,
    pub outcome: TargetOutcome,
    /// Fetch tries made, each with its own audit row.
    pub tries: u32,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interrupted: bool,
    pub targets: Vec<TargetReport>,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.outcome)).count()
    }

    pub fn committed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Committed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, TargetOutcome::Skipped))
    }

    pub fn changes(&self) -> Vec<i64> {
        self.targets
            .iter()
            .filter_map(|t| match t.outcome {
                TargetOutcome::Committed { change_id, .. } => change_id,
                _ => None,
            })
            .collect()
    }

    pub fn outcome_for(&self, url: &str) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| t.url == url).map(|t| &t.outcome)
    }
}

/// Visits `targets` in order. Per-target failures end up in the report; nothing escapes.
/// `interrupt` is only consulted between targets. A held `lock` is refreshed after each target.
pub async fn run_cycle<F: ProfileFetcher>(
    db: &mut Database,
    fetcher: &mut F,
    session: &mut Option<SessionState>,
    targets: &[MonitoredTarget],
    policy: &RetryPolicy,
    interrupt: &Arc<AtomicBool>,
    lock: Option<&CycleLock>,
) -> CycleReport {
    let started_at = Utc::now();
    let mut reports = Vec::with_capacity(targets.len());
    let mut interrupted = false;
    let mut cooling_down = false;

    info!(targets = targets.len(), "starting monitoring cycle");

    for (i, target) in targets.iter().enumerate() {
        if interrupt.load(Ordering::SeqCst) {
            interrupted = true;
            info!(remaining = targets.len() - i, "cycle interrupted, skipping remaining targets");
            reports.extend(targets[i..].iter().map(|t| TargetReport {
                url: t.url.clone(),
                outcome: TargetOutcome::Skipped,
                tries: 0,
            }));
            break;
        }

        if cooling_down {
            info!(cooldown = ?policy.rate_limit_cooldown, "rate limited, cooling down before next target");
            tokio::time::sleep(policy.rate_limit_cooldown).await;
            cooling_down = false;
        }

        info!(url = %target.url, position = i + 1, of = targets.len(), "checking profile");
        let report = process_target(db, fetcher, session, &target.url, policy).await;
        match &report.outcome {
            TargetOutcome::Committed { classification, change_id } => {
                info!(url = %target.url, classification = classification.as_str(), ?change_id, "profile committed");
            }
            TargetOutcome::Failed(e) => {
                warn!(url = %target.url, kind = e.kind(), error = %e, "profile check failed");
                cooling_down = matches!(e, TargetError::RateLimited);
            }
            TargetOutcome::Skipped => {}
        }
        reports.push(report);

        if let Some(lock) = lock {
            if let Err(e) = lock.touch() {
                warn!(path = %lock.path().display(), error = %e, "could not refresh cycle lock");
            }
        }
    }

    let report = CycleReport {
        started_at,
        finished_at: Utc::now(),
        interrupted,
        targets: reports,
    };
    info!(
        committed = report.committed(),
        failed = report.failed(),
        skipped = report.skipped(),
        changes = report.changes().len(),
        "cycle finished"
    );
    report
}

async fn process_target<F: ProfileFetcher>(
    db: &mut Database,
    fetcher: &mut F,
    session: &mut Option<SessionState>,
    url: &str,
    policy: &RetryPolicy,
) -> TargetReport {
    let mut tries = 0;
    let outcome = loop {
        tries += 1;
        let fetched = fetcher.fetch(url, session).await;
        let error = match fetched {
            FetchOutcome::Ok(html) => break observe(db, url, &html, tries, policy).await,
            FetchOutcome::AuthRequired => TargetError::Authentication("no valid session for this cycle".to_string()),
            FetchOutcome::RateLimited => TargetError::RateLimited,
            FetchOutcome::Blocked => TargetError::Blocked,
            FetchOutcome::TransientError(reason) => TargetError::Transient(reason),
        };

        let raw = json!({ "outcome": outcome_label(&error), "try": tries });
        let attempt = AttemptRecord::failed(&error, Some(raw));
        if let Err(persist) = db.gateway().commit(url, &attempt, None, policy.persistence).await {
            error!(url, error = %persist, "could not record failed attempt");
            break TargetOutcome::Failed(persist);
        }

        match error {
            TargetError::Transient(_) if tries < policy.transient.attempts => {
                let delay = policy.transient.delay(tries);
                warn!(url, attempt = tries, error = %error, ?delay, "transient failure, retrying");
                tokio::time::sleep(delay).await;
            }
            error => break TargetOutcome::Failed(error),
        }
    };

    TargetReport {
        url: url.to_string(),
        outcome,
        tries,
    }
}

fn outcome_label(error: &TargetError) -> &'static str {
    match error {
        TargetError::Authentication(_) => FetchOutcome::AuthRequired.as_str(),
        TargetError::RateLimited => FetchOutcome::RateLimited.as_str(),
        TargetError::Blocked => FetchOutcome::Blocked.as_str(),
        TargetError::Transient(_) | TargetError::Persistence { .. } => "transient_error",
    }
}

async fn observe(db: &mut Database, url: &str, html: &str, tries: u32, policy: &RetryPolicy) -> TargetOutcome {
    let snapshot = extract(html);
    if snapshot.is_empty() {
        warn!(url, "page loaded but no fields could be extracted");
    }

    let previous = match with_backoff("read_snapshot", policy.persistence, || db.get_snapshot(url)).await {
        Ok(previous) => previous,
        Err((attempts, e)) => {
            let error = TargetError::Persistence {
                attempts,
                reason: format!("{:#}", e),
            };
            let attempt = AttemptRecord::failed(&error, Some(json!({ "outcome": "ok", "try": tries })));
            if let Err(e) = db.gateway().commit(url, &attempt, None, policy.persistence).await {
                error!(url, error = %e, "could not record failed attempt");
            }
            return TargetOutcome::Failed(error);
        }
    };

    let classification = classify(previous.as_ref(), &snapshot);
    let raw = json!({
        "outcome": "ok",
        "try": tries,
        "classification": classification.as_str(),
        "content_length": html.len(),
        "snapshot": snapshot,
    });

    match db
        .gateway()
        .commit(url, &AttemptRecord::succeeded(raw), Some((&snapshot, &classification)), policy.persistence)
        .await
    {
        Ok(summary) => TargetOutcome::Committed {
            classification,
            change_id: summary.change_id,
        },
        Err(e) => TargetOutcome::Failed(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::collections::{HashMap, VecDeque};

    const X: &str = "https://www.linkedin.com/in/x/";
    const Y: &str = "https://www.linkedin.com/in/y/";
    const Z: &str = "https://www.linkedin.com/in/z/";

    /// Replays a fixed outcome queue per url.
    #[derive(Default)]
    struct Scripted {
        script: HashMap<String, VecDeque<FetchOutcome>>,
        calls: Vec<String>,
    }

    impl Scripted {
        fn then(mut self, url: &str, outcome: FetchOutcome) -> Self {
            self.script.entry(url.to_string()).or_default().push_back(outcome);
            self
        }
    }

    impl ProfileFetcher for Scripted {
        async fn fetch(&mut self, url: &str, _session: &mut Option<SessionState>) -> FetchOutcome {
            self.calls.push(url.to_string());
            self.script
                .get_mut(url)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| FetchOutcome::TransientError("nothing scripted".to_string()))
        }
    }

    fn page(position: &str, company: &str) -> FetchOutcome {
        FetchOutcome::Ok(format!(
            r#"<html><body>
                <h1 class="text-heading-xlarge">Ada Lovelace</h1>
                <section data-section="experience"><ul>
                  <li class="artdeco-list__item">
                    <span aria-hidden="true">{position}</span>
                    <span aria-hidden="true">{company}</span>
                    <span aria-hidden="true">2020 - Present</span>
                  </li>
                </ul></section>
            </body></html>"#
        ))
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            transient: Backoff::new(1, Duration::ZERO),
            persistence: Backoff::new(1, Duration::ZERO),
            rate_limit_cooldown: Duration::ZERO,
        }
    }

    fn setup(urls: &[&str]) -> (Database, Vec<MonitoredTarget>) {
        let db = Database::open_in_memory().unwrap();
        for url in urls {
            db.registry().add(url, None, 24).unwrap();
        }
        let targets = db.list_targets(true).unwrap();
        (db, targets)
    }

    async fn run(db: &mut Database, fetcher: &mut Scripted, targets: &[MonitoredTarget]) -> CycleReport {
        run_cycle(db, fetcher, &mut None, targets, &policy(), &Arc::new(AtomicBool::new(false)), None).await
    }

    #[tokio::test]
    async fn test_every_outcome_writes_exactly_one_attempt() {
        let cases = [
            (page("Engineer", "Acme Corp"), true),
            (FetchOutcome::AuthRequired, false),
            (FetchOutcome::RateLimited, false),
            (FetchOutcome::Blocked, false),
            (FetchOutcome::TransientError("connection reset".to_string()), false),
        ];
        for (outcome, success) in cases {
            let label = outcome.as_str();
            let (mut db, targets) = setup(&[X]);
            let mut fetcher = Scripted::default().then(X, outcome);
            run(&mut db, &mut fetcher, &targets).await;

            let attempts = db.list_attempts(Some(X), 10).unwrap();
            assert_eq!(attempts.len(), 1, "{}", label);
            assert_eq!(attempts[0].success, success, "{}", label);
            assert_eq!(attempts[0].error_message.is_some(), !success, "{}", label);
            assert_eq!(attempts[0].raw_data.as_ref().unwrap()["outcome"], label);
            assert!(db.get_target(X).unwrap().unwrap().last_checked.is_some());
        }
    }

    #[tokio::test]
    async fn test_three_cycles_seed_then_unchanged_then_change() {
        let (mut db, targets) = setup(&[X]);
        let mut fetcher = Scripted::default()
            .then(X, page("Engineer", "Acme Corp"))
            .then(X, page("Engineer", "Acme Corp"))
            .then(X, page("Engineer", "Globex Inc"));

        let first = run(&mut db, &mut fetcher, &targets).await;
        assert!(matches!(
            first.outcome_for(X),
            Some(TargetOutcome::Committed { classification: Classification::NoPriorData, change_id: None })
        ));
        assert_eq!(db.list_history(X).unwrap().len(), 1);

        let second = run(&mut db, &mut fetcher, &targets).await;
        assert!(matches!(
            second.outcome_for(X),
            Some(TargetOutcome::Committed { classification: Classification::Unchanged, change_id: None })
        ));
        assert_eq!(db.list_history(X).unwrap().len(), 1);
        assert!(db.list_changes(None, false).unwrap().is_empty());

        let third = run(&mut db, &mut fetcher, &targets).await;
        assert_eq!(third.changes().len(), 1);
        let changes = db.list_changes(Some(X), true).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_company.as_deref(), Some("Acme Corp"));
        assert_eq!(changes[0].new_company.as_deref(), Some("Globex Inc"));
        assert_eq!(changes[0].new_position.as_deref(), Some("Engineer"));
        assert_eq!(changes[0].display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(db.list_history(X).unwrap().len(), 2);

        let snap = db.get_snapshot(X).unwrap().unwrap();
        assert_eq!(snap.current_company.as_deref(), Some("Globex Inc"));
        assert_eq!(db.list_attempts(Some(X), 10).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_blocked_target_does_not_stop_the_cycle() {
        let (mut db, targets) = setup(&[Y, Z]);
        let mut fetcher = Scripted::default()
            .then(Y, FetchOutcome::Blocked)
            .then(Z, page("Engineer", "Acme Corp"));

        let report = run(&mut db, &mut fetcher, &targets).await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.committed(), 1);
        assert_eq!(report.outcome_for(Y), Some(&TargetOutcome::Failed(TargetError::Blocked)));
        assert!(db.get_snapshot(Y).unwrap().is_none());
        assert!(db.get_snapshot(Z).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_retry_with_one_attempt_each() {
        let (mut db, targets) = setup(&[X]);
        let mut fetcher = Scripted::default()
            .then(X, FetchOutcome::TransientError("timeout".to_string()))
            .then(X, FetchOutcome::TransientError("timeout".to_string()))
            .then(X, page("Engineer", "Acme Corp"));
        let policy = RetryPolicy {
            transient: Backoff::new(3, Duration::ZERO),
            ..policy()
        };

        let report = run_cycle(&mut db, &mut fetcher, &mut None, &targets, &policy, &Arc::new(AtomicBool::new(false)), None).await;
        assert_eq!(report.targets[0].tries, 3);
        assert_eq!(report.committed(), 1);

        let attempts = db.list_attempts(Some(X), 10).unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts.iter().filter(|a| a.success).count(), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried_in_cycle() {
        let (mut db, targets) = setup(&[X, Y]);
        let mut fetcher = Scripted::default()
            .then(X, FetchOutcome::RateLimited)
            .then(Y, page("Engineer", "Acme Corp"));
        let policy = RetryPolicy {
            transient: Backoff::new(3, Duration::ZERO),
            ..policy()
        };

        let report = run_cycle(&mut db, &mut fetcher, &mut None, &targets, &policy, &Arc::new(AtomicBool::new(false)), None).await;
        assert_eq!(fetcher.calls, vec![X.to_string(), Y.to_string()]);
        assert_eq!(report.outcome_for(X), Some(&TargetOutcome::Failed(TargetError::RateLimited)));
        assert_eq!(report.committed(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_skips_remaining_targets() {
        let (mut db, targets) = setup(&[X, Y]);
        let mut fetcher = Scripted::default();
        let interrupt = Arc::new(AtomicBool::new(true));

        let report = run_cycle(&mut db, &mut fetcher, &mut None, &targets, &policy(), &interrupt, None).await;
        assert!(report.interrupted);
        assert_eq!(report.skipped(), 2);
        assert!(fetcher.calls.is_empty());
        assert!(db.list_attempts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_select_one_target_normalizes_url() {
        let (db, _) = setup(&[X]);
        let picked = select_targets(&db, &Selection::One("https://www.linkedin.com/in/x?trk=a".to_string()), Utc::now()).unwrap();
        assert_eq!(picked[0].url, X);
        assert!(select_targets(&db, &Selection::One(Y.to_string()), Utc::now()).is_err());
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.lock");
        let hour = Duration::from_secs(3600);

        let held = CycleLock::acquire(&path, hour).unwrap();
        assert!(matches!(CycleLock::acquire(&path, hour), Err(CycleError::LockHeld(..))));
        drop(held);
        assert!(!path.exists());
        let again = CycleLock::acquire(&path, hour).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn test_touched_lock_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.lock");
        let hour = Duration::from_secs(3600);
        let held = CycleLock::acquire(&path, hour).unwrap();

        let two_hours_ago = SystemTime::now() - 2 * hour;
        OpenOptions::new().write(true).open(&path).unwrap().set_modified(two_hours_ago).unwrap();
        held.touch().unwrap();

        assert!(matches!(CycleLock::acquire(&path, hour), Err(CycleError::LockHeld(..))));
    }

    #[tokio::test]
    async fn test_cycle_refreshes_held_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.lock");
        let hour = Duration::from_secs(3600);
        let held = CycleLock::acquire(&path, hour).unwrap();
        let two_hours_ago = SystemTime::now() - 2 * hour;
        OpenOptions::new().write(true).open(&path).unwrap().set_modified(two_hours_ago).unwrap();

        let (mut db, targets) = setup(&[X]);
        let mut fetcher = Scripted::default().then(X, page("Engineer", "Acme Corp"));
        run_cycle(&mut db, &mut fetcher, &mut None, &targets, &policy(), &Arc::new(AtomicBool::new(false)), Some(&held)).await;

        let age = fs::metadata(&path).unwrap().modified().unwrap().elapsed().unwrap_or_default();
        assert!(age < hour);
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle.lock");
        fs::write(&path, "12345\n").unwrap();

        let lock = CycleLock::acquire(&path, Duration::ZERO).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.lines().next(), Some(std::process::id().to_string().as_str()));
    }
}
