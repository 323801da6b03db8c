use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "jobwatch.toml";
const ENV_PREFIX: &str = "JOBWATCH_";

/// Uniform window the pre-navigation delay is drawn from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingWindow {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PacingWindow {
    pub fn sample(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }
}

impl Default for PacingWindow {
    fn default() -> Self {
        Self {
            min_ms: 3_000,
            max_ms: 8_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrowserSettings {
    pub scroll_steps: u32,
    pub page_load_timeout_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            scroll_steps: 3,
            page_load_timeout_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetrySettings {
    pub transient_attempts: u32,
    pub transient_backoff_ms: u64,
    pub persistence_attempts: u32,
    pub persistence_backoff_ms: u64,
    pub rate_limit_cooldown_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            transient_attempts: 3,
            transient_backoff_ms: 5_000,
            persistence_attempts: 3,
            persistence_backoff_ms: 500,
            rate_limit_cooldown_secs: 300,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub webdriver_url: String,
    pub headless: bool,
    pub login_email: String,
    pub login_password: String,
    pub data_dir: Option<PathBuf>,
    pub log_level: String,
    pub check_interval_hours: u64,
    pub default_check_frequency_hours: i64,
    pub lock_stale_after_minutes: u64,
    pub pacing: PacingWindow,
    pub browser: BrowserSettings,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            login_email: String::new(),
            login_password: String::new(),
            data_dir: None,
            log_level: "info".to_string(),
            check_interval_hours: 24,
            default_check_frequency_hours: 24,
            lock_stale_after_minutes: 360,
            pacing: PacingWindow::default(),
            browser: BrowserSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file in the platform config dir, then `JOBWATCH_*` env vars.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = Self::config_path() {
            figment = figment.merge(Toml::file(path));
        }
        let mut settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Invalid jobwatch configuration")?;
        settings.ensure_valid();
        Ok(settings)
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "jobwatch").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match ProjectDirs::from("", "", "jobwatch") {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            None => PathBuf::from("."),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("jobwatch.db")
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir().join("session.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("cycle.lock")
    }

    pub fn has_credentials(&self) -> bool {
        !self.login_email.trim().is_empty() && !self.login_password.is_empty()
    }

    fn ensure_valid(&mut self) {
        if self.pacing.min_ms > self.pacing.max_ms {
            eprintln!(
                "Config error: pacing.min_ms ({}) exceeds pacing.max_ms ({}) - swapping",
                self.pacing.min_ms, self.pacing.max_ms
            );
            std::mem::swap(&mut self.pacing.min_ms, &mut self.pacing.max_ms);
        }
        if self.retry.transient_attempts == 0 {
            self.retry.transient_attempts = 1;
        }
        if self.retry.persistence_attempts == 0 {
            self.retry.persistence_attempts = 1;
        }
        if !(1..=crate::db::MAX_CHECK_FREQUENCY_HOURS).contains(&self.default_check_frequency_hours) {
            self.default_check_frequency_hours = Settings::default().default_check_frequency_hours;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_sample_stays_in_window() {
        let window = PacingWindow { min_ms: 10, max_ms: 20 };
        for _ in 0..200 {
            let d = window.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_pacing_sample_degenerate_window() {
        let window = PacingWindow { min_ms: 0, max_ms: 0 };
        assert_eq!(window.sample(), Duration::ZERO);
    }

    #[test]
    fn test_ensure_valid_repairs_bad_values() {
        let mut settings = Settings::default();
        settings.pacing = PacingWindow { min_ms: 9_000, max_ms: 1_000 };
        settings.retry.transient_attempts = 0;
        settings.retry.persistence_attempts = 0;
        settings.default_check_frequency_hours = -3;
        settings.ensure_valid();

        assert_eq!(settings.pacing, PacingWindow { min_ms: 1_000, max_ms: 9_000 });
        assert_eq!(settings.retry.transient_attempts, 1);
        assert_eq!(settings.retry.persistence_attempts, 1);
        assert_eq!(settings.default_check_frequency_hours, 24);
    }

    #[test]
    fn test_toml_overrides_nested_keys() {
        let toml = r#"
            headless = false
            [pacing]
            min_ms = 100
            max_ms = 200
        "#;
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert!(!settings.headless);
        assert_eq!(settings.pacing.min_ms, 100);
        assert_eq!(settings.pacing.max_ms, 200);
        assert_eq!(settings.retry.transient_attempts, 3);
    }

    #[test]
    fn test_paths_follow_data_dir() {
        let mut settings = Settings::default();
        settings.data_dir = Some(PathBuf::from("/tmp/jw"));
        assert_eq!(settings.database_path(), PathBuf::from("/tmp/jw/jobwatch.db"));
        assert_eq!(settings.session_path(), PathBuf::from("/tmp/jw/session.json"));
        assert_eq!(settings.lock_path(), PathBuf::from("/tmp/jw/cycle.lock"));
    }
}
