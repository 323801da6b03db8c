mod auth;
mod config;
mod cycle;
mod db;
mod detect;
mod error;
mod extract;
mod fetcher;
mod models;
mod notify;
mod persist;
mod retry;
mod session;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use cycle::{run_cycle, select_targets, CycleLock, CycleReport, Selection, TargetOutcome};
use db::{normalize_profile_url, Database};
use fetcher::StealthFetcher;
use notify::{dispatch_pending, ConsoleNotifier};
use retry::RetryPolicy;
use session::SessionStore;

#[derive(Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watch LinkedIn profiles and report job changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Start monitoring a profile
    Add {
        /// Profile URL
        url: String,

        /// Display name to show until the profile is scraped
        #[arg(short, long)]
        name: Option<String>,

        /// Check frequency in hours (defaults to the configured value)
        #[arg(short, long)]
        every: Option<i64>,
    },

    /// Stop monitoring a profile
    Remove {
        /// Profile URL
        url: String,
    },

    /// Exclude a profile from cycles without removing it
    Pause {
        /// Profile URL
        url: String,
    },

    /// Include a paused profile in cycles again
    Resume {
        /// Profile URL
        url: String,
    },

    /// Change how often a profile is checked
    Every {
        /// Profile URL
        url: String,

        /// Check frequency in hours
        hours: i64,
    },

    /// List monitored profiles
    List,

    /// Run one monitoring cycle
    Check {
        /// Check every active profile, not only those that are due
        #[arg(short, long)]
        all: bool,

        /// Check a single profile
        #[arg(short, long, conflicts_with = "all")]
        url: Option<String>,
    },

    /// Run cycles on the configured interval until interrupted
    Watch,

    /// Show detected job changes
    Changes {
        /// Only changes for this profile
        #[arg(short, long)]
        url: Option<String>,

        /// Only changes that have not been delivered
        #[arg(short, long)]
        pending: bool,
    },

    /// Show the position history of a profile
    History {
        /// Profile URL
        url: String,
    },

    /// Show recent scrape attempts
    Attempts {
        /// Only attempts for this profile
        #[arg(short, long)]
        url: Option<String>,

        /// Number of attempts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Retry delivery of pending change notifications
    Notify,

    /// Forget the stored login session
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut db = Database::open(&settings.database_path())?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Add { url, name, every } => {
            db.ensure_initialized()?;
            let hours = every.unwrap_or(settings.default_check_frequency_hours);
            db.registry().add(&url, name.as_deref(), hours)?;
            println!("Monitoring {} every {}h", profile_url(&url)?, hours);
        }

        Commands::Remove { url } => {
            db.ensure_initialized()?;
            let url = profile_url(&url)?;
            if db.registry().remove(&url)? {
                db.gateway()
                    .forget_profile(&url)
                    .with_context(|| format!("Failed to clear stored state for {}", url))?;
                println!("Stopped monitoring {}", url);
            } else {
                println!("{} is not monitored.", url);
            }
        }

        Commands::Pause { url } => {
            db.ensure_initialized()?;
            let url = profile_url(&url)?;
            if db.registry().set_active(&url, false)? {
                println!("Paused {}", url);
            } else {
                println!("{} is not monitored.", url);
            }
        }

        Commands::Resume { url } => {
            db.ensure_initialized()?;
            let url = profile_url(&url)?;
            if db.registry().set_active(&url, true)? {
                println!("Resumed {}", url);
            } else {
                println!("{} is not monitored.", url);
            }
        }

        Commands::Every { url, hours } => {
            db.ensure_initialized()?;
            let url = profile_url(&url)?;
            if db.registry().set_frequency(&url, hours)? {
                println!("{} will be checked every {}h", url, hours);
            } else {
                println!("{} is not monitored.", url);
            }
        }

        Commands::List => {
            db.ensure_initialized()?;
            let targets = db.list_targets(false)?;
            if targets.is_empty() {
                println!("No profiles monitored. Add one with 'jobwatch add <url>'.");
            } else {
                println!("{:<6} {:<8} {:<6} {:<20} {:<17} {}", "ID", "STATUS", "EVERY", "NAME", "LAST CHECKED", "URL");
                println!("{}", "-".repeat(100));
                let now = Utc::now();
                for t in targets {
                    let status = match (t.active, t.is_due(now)) {
                        (false, _) => "paused",
                        (true, true) => "due",
                        (true, false) => "active",
                    };
                    let name = t
                        .display_name
                        .clone()
                        .or_else(|| db.get_snapshot(&t.url).ok().flatten().and_then(|s| s.display_name))
                        .unwrap_or_default();
                    println!(
                        "{:<6} {:<8} {:<6} {:<20} {:<17} {}",
                        t.id,
                        status,
                        format!("{}h", t.check_frequency_hours),
                        truncate(&name, 18),
                        when(t.last_checked),
                        t.url
                    );
                }
            }
        }

        Commands::Check { all, url } => {
            db.ensure_initialized()?;
            let selection = match (all, url) {
                (_, Some(url)) => Selection::One(url),
                (true, None) => Selection::All,
                (false, None) => Selection::Due,
            };
            let interrupt = interrupt_on_ctrl_c();
            check(&settings, &mut db, &selection, &interrupt).await?;
        }

        Commands::Watch => {
            db.ensure_initialized()?;
            let interrupt = interrupt_on_ctrl_c();
            let interval = Duration::from_secs(settings.check_interval_hours.max(1) * 3600);
            info!(?interval, "watching monitored profiles");

            while !interrupt.load(Ordering::SeqCst) {
                if let Err(e) = check(&settings, &mut db, &Selection::Due, &interrupt).await {
                    error!(error = %format!("{:#}", e), "cycle aborted");
                }
                let next = Instant::now() + interval;
                while Instant::now() < next && !interrupt.load(Ordering::SeqCst) {
                    sleep(Duration::from_secs(1)).await;
                }
            }
            println!("Stopped watching.");
        }

        Commands::Changes { url, pending } => {
            db.ensure_initialized()?;
            let url = url.as_deref().map(profile_url).transpose()?;
            let changes = db.list_changes(url.as_deref(), pending)?;
            if changes.is_empty() {
                println!("No job changes recorded.");
            } else {
                println!("{:<6} {:<17} {:<20} {:<30} {:<30} {}", "ID", "DETECTED", "NAME", "FROM", "TO", "SENT");
                println!("{}", "-".repeat(110));
                for c in changes {
                    println!(
                        "{:<6} {:<17} {:<20} {:<30} {:<30} {}",
                        c.id,
                        when(Some(c.detected_at)),
                        truncate(c.display_name.as_deref().unwrap_or("-"), 18),
                        truncate(&role(&c.old_position, &c.old_company), 28),
                        truncate(&role(&c.new_position, &c.new_company), 28),
                        if c.notified { "yes" } else { "no" }
                    );
                }
            }
        }

        Commands::History { url } => {
            db.ensure_initialized()?;
            let url = profile_url(&url)?;
            if let Some(snap) = db.get_snapshot(&url)? {
                println!("{}", snap.display_name.as_deref().unwrap_or(&url));
                if let Some(headline) = &snap.headline {
                    println!("{}", headline);
                }
                println!("Current: {}", role(&snap.current_position, &snap.current_company));
                println!("Updated: {}\n", when(Some(snap.last_updated)));
            }
            let history = db.list_history(&url)?;
            if history.is_empty() {
                println!("No position history for {}.", url);
            } else {
                println!("{:<17} {}", "DETECTED", "ROLE");
                println!("{}", "-".repeat(60));
                for entry in history {
                    println!("{:<17} {}", when(Some(entry.detected_at)), role(&entry.position, &entry.company));
                }
            }
        }

        Commands::Attempts { url, limit } => {
            db.ensure_initialized()?;
            let url = url.as_deref().map(profile_url).transpose()?;
            let attempts = db.list_attempts(url.as_deref(), limit)?;
            if attempts.is_empty() {
                println!("No scrape attempts recorded.");
            } else {
                println!("{:<6} {:<17} {:<4} {:<40} {}", "ID", "WHEN", "OK", "URL", "ERROR");
                println!("{}", "-".repeat(100));
                for a in attempts {
                    println!(
                        "{:<6} {:<17} {:<4} {:<40} {}",
                        a.id,
                        when(Some(a.scraped_at)),
                        if a.success { "yes" } else { "no" },
                        truncate(&a.profile_url, 38),
                        a.error_message.unwrap_or_default()
                    );
                }
            }
        }

        Commands::Notify => {
            db.ensure_initialized()?;
            let stats = dispatch_pending(&mut db, &ConsoleNotifier)?;
            println!("Delivered {} notification(s), {} still pending.", stats.delivered, stats.failed);
        }

        Commands::Logout => {
            let store = SessionStore::new(settings.session_path());
            store.invalidate()?;
            println!("Stored session removed from {}", store.path().display());
        }
    }

    Ok(())
}

/// One cycle under the run lock, followed by a delivery pass.
async fn check(settings: &Settings, db: &mut Database, selection: &Selection, interrupt: &Arc<AtomicBool>) -> Result<()> {
    let targets = select_targets(db, selection, Utc::now())?;
    if targets.is_empty() {
        println!("No profiles due for a check.");
        return Ok(());
    }

    let stale_after = Duration::from_secs(settings.lock_stale_after_minutes * 60);
    let lock = CycleLock::acquire(&settings.lock_path(), stale_after)?;
    info!(lock = %lock.path().display(), targets = targets.len(), "cycle lock held");

    let store = SessionStore::new(settings.session_path());
    let mut session = store.load();
    if session.is_none() && !settings.has_credentials() {
        let config = Settings::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "the config file".to_string());
        bail!(
            "No stored session and no login credentials. Set login_email and login_password in {} \
             or JOBWATCH_LOGIN_EMAIL / JOBWATCH_LOGIN_PASSWORD.",
            config
        );
    }

    let mut fetcher = StealthFetcher::launch(settings, store, session.as_ref())
        .await
        .context("Could not start the browser. Is chromedriver running?")?;
    let policy = RetryPolicy::from(&settings.retry);
    let report = run_cycle(db, &mut fetcher, &mut session, &targets, &policy, interrupt, Some(&lock)).await;
    fetcher.shutdown().await;
    drop(lock);

    print_report(&report);

    let stats = dispatch_pending(db, &ConsoleNotifier)?;
    if stats.failed > 0 {
        warn!(failed = stats.failed, "some notifications could not be delivered");
    }
    Ok(())
}

fn interrupt_on_ctrl_c() -> Arc<AtomicBool> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current profile");
            flag.store(true, Ordering::SeqCst);
        }
    });
    interrupt
}

fn print_report(report: &CycleReport) {
    let elapsed = report.finished_at - report.started_at;
    println!(
        "\nCycle finished in {}s: {} committed, {} failed, {} skipped, {} change(s)",
        elapsed.num_seconds(),
        report.committed(),
        report.failed(),
        report.skipped(),
        report.changes().len()
    );
    for t in &report.targets {
        let detail = match &t.outcome {
            TargetOutcome::Committed { classification, .. } => classification.as_str().to_string(),
            TargetOutcome::Failed(e) if t.tries > 1 => format!("failed after {} tries ({})", t.tries, e),
            TargetOutcome::Failed(e) => format!("failed ({})", e),
            TargetOutcome::Skipped => "skipped".to_string(),
        };
        println!("  {:<50} {}", truncate(&t.url, 48), detail);
    }
}

fn profile_url(url: &str) -> Result<String> {
    normalize_profile_url(url).ok_or_else(|| anyhow!("Not a profile URL: '{}'", url))
}

fn role(position: &Option<String>, company: &Option<String>) -> String {
    match (position, company) {
        (Some(p), Some(c)) => format!("{} at {}", p, c),
        (Some(p), None) => p.clone(),
        (None, Some(c)) => c.clone(),
        (None, None) => "-".to_string(),
    }
}

fn when(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
