use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredTarget {
    pub id: i64,
    pub url: String,
    pub display_name: Option<String>,
    pub active: bool,
    pub added_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub check_frequency_hours: i64,
}

impl MonitoredTarget {
    /// A target is due when it was never checked or its frequency window has elapsed.
    /// A window too large to represent never elapses.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(checked) = self.last_checked else {
            return true;
        };
        match chrono::Duration::try_hours(self.check_frequency_hours) {
            Some(window) => now - checked >= window,
            None => false,
        }
    }
}

/// Last known state of a profile. Overwritten in place, one row per url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub id: i64,
    pub url: String,
    pub display_name: Option<String>,
    pub headline: Option<String>,
    pub current_position: Option<String>,
    pub current_company: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ProfileSnapshot {
    pub fn role(&self) -> RolePair {
        RolePair {
            position: self.current_position.clone(),
            company: self.current_company.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionHistoryEntry {
    pub id: i64,
    pub profile_url: String,
    pub position: Option<String>,
    pub company: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeAttempt {
    pub id: i64,
    pub profile_url: String,
    pub scraped_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub raw_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChangeEvent {
    pub id: i64,
    pub profile_url: String,
    pub display_name: Option<String>,
    pub old_position: Option<String>,
    pub old_company: Option<String>,
    pub new_position: Option<String>,
    pub new_company: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub notified: bool,
}

/// The (position, company) pair that change detection is keyed on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePair {
    pub position: Option<String>,
    pub company: Option<String>,
}

impl RolePair {
    #[cfg(test)]
    pub fn new(position: Option<&str>, company: Option<&str>) -> Self {
        Self {
            position: position.map(str::to_string),
            company: company.map(str::to_string),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.position.is_none() && self.company.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperienceEntry {
    pub title: String,
    pub company: String,
}

/// What one page retrieval yielded. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSnapshot {
    pub name: Option<String>,
    pub headline: Option<String>,
    pub position: Option<String>,
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub experience: Vec<ExperienceEntry>,
}

impl PartialSnapshot {
    pub fn role(&self) -> RolePair {
        RolePair {
            position: self.position.clone(),
            company: self.company.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.headline.is_none() && self.position.is_none() && self.company.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(hours: i64, last_checked: Option<DateTime<Utc>>) -> MonitoredTarget {
        MonitoredTarget {
            id: 1,
            url: "https://www.linkedin.com/in/x/".to_string(),
            display_name: None,
            active: true,
            added_at: Utc::now(),
            last_checked,
            check_frequency_hours: hours,
        }
    }

    #[test]
    fn test_is_due_window() {
        let now = Utc::now();
        assert!(target(24, None).is_due(now));
        assert!(!target(24, Some(now - chrono::Duration::hours(23))).is_due(now));
        assert!(target(24, Some(now - chrono::Duration::hours(24))).is_due(now));
    }

    #[test]
    fn test_is_due_with_unrepresentable_window_does_not_panic() {
        let now = Utc::now();
        assert!(!target(10_000_000_000_000_000, Some(now)).is_due(now));
        assert!(!target(i64::MAX, Some(now)).is_due(now));
        assert!(target(i64::MAX, None).is_due(now));
    }
}
