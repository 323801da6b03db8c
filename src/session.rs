use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Cookie name that marks an authenticated session on the target site.
pub const AUTH_COOKIE: &str = "li_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
}

/// Authenticated browsing state carried between fetches and across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: Vec<StoredCookie>,
    pub user_agent: String,
    pub saved_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(cookies: Vec<StoredCookie>, user_agent: String) -> Self {
        Self {
            cookies,
            user_agent,
            saved_at: Utc::now(),
        }
    }

    pub fn has_auth_cookie(&self) -> bool {
        self.cookies
            .iter()
            .any(|c| c.name == AUTH_COOKIE && !c.value.is_empty())
    }
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, unreadable or corrupt state all read as "no session".
    pub fn load(&self) -> Option<SessionState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no stored session");
                return None;
            }
        };
        match serde_json::from_str::<SessionState>(&raw) {
            Ok(state) if state.has_auth_cookie() => {
                info!(cookies = state.cookies.len(), saved_at = %state.saved_at, "loaded stored session");
                Some(state)
            }
            Ok(_) => {
                warn!("stored session has no auth cookie, ignoring it");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "stored session is corrupt, ignoring it");
                None
            }
        }
    }

    /// Written to a sibling temp file first so a crash never leaves a torn session.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write session file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace session file: {}", self.path.display()))?;
        info!(path = %self.path.display(), "session saved");
        Ok(())
    }

    pub fn invalidate(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "session invalidated");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove session file: {}", self.path.display())),
        }
    }
}
