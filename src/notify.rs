use anyhow::Result;
use tracing::{info, warn};

use crate::db::Database;
use crate::models::JobChangeEvent;

/// Outbound delivery of a recorded change. Transport lives behind this seam.
pub trait Notifier {
    fn notify(&self, event: &JobChangeEvent) -> Result<()>;
}

/// Prints alerts to stdout.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, event: &JobChangeEvent) -> Result<()> {
        println!("\n{}", "=".repeat(60));
        println!("{}", format_change_message(event));
        println!("{}\n", "=".repeat(60));
        Ok(())
    }
}

pub fn format_change_message(event: &JobChangeEvent) -> String {
    let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "Unknown".to_string());
    format!(
        "JOB CHANGE DETECTED\n\n\
         Name: {}\n\
         Profile: {}\n\n\
         Previous: {} at {}\n\
         Now:      {} at {}\n\n\
         Detected: {}",
        or_unknown(&event.display_name),
        event.profile_url,
        or_unknown(&event.old_position),
        or_unknown(&event.old_company),
        or_unknown(&event.new_position),
        or_unknown(&event.new_company),
        event.detected_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers every pending change. Only confirmed deliveries are marked notified;
/// failures stay pending for the next pass.
pub fn dispatch_pending(db: &mut Database, notifier: &dyn Notifier) -> Result<DispatchStats> {
    let pending = db.list_changes(None, true)?;
    let mut stats = DispatchStats::default();
    if pending.is_empty() {
        return Ok(stats);
    }
    info!(pending = pending.len(), "dispatching change notifications");

    for event in &pending {
        match notifier.notify(event) {
            Ok(()) => {
                db.gateway().mark_notified(event.id)?;
                stats.delivered += 1;
            }
            Err(e) => {
                warn!(change_id = event.id, error = %e, "notification failed, will retry");
                stats.failed += 1;
            }
        }
    }
    Ok(stats)
}
