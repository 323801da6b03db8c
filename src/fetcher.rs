use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use scraper::Html;
use serde_json::json;
use std::time::Duration;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use thirtyfour::{ChromiumLikeCapabilities, Cookie};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthState, Authenticator, LoginResult};
use crate::config::{PacingWindow, Settings};
use crate::session::{SessionState, SessionStore, StoredCookie, AUTH_COOKIE};

const BASE_URL: &str = "https://www.linkedin.com/";
const FEED_URL: &str = "https://www.linkedin.com/feed/";
const LOGIN_URL: &str = "https://www.linkedin.com/login";

const LOGIN_SETTLE: Duration = Duration::from_secs(20);

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

// Suppresses the automation-controlled flag and infobar.
const CHROME_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--disable-dev-shm-usage",
    "--lang=en-US",
];

const LOCALE: &str = "en-US";
const TIMEZONE: &str = "America/New_York";

// Runs before any page script. Hides the webdriver flag and fills in the
// properties headless Chrome leaves empty.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
window.chrome = { runtime: {} };
const originalQuery = window.navigator.permissions.query;
window.navigator.permissions.query = (parameters) => (
    parameters.name === 'notifications'
        ? Promise.resolve({ state: Notification.permission })
        : originalQuery(parameters)
);
"#;

const CHALLENGE_URL_MARKERS: &[&str] = &["/checkpoint/"];
const CHALLENGE_PAGE_MARKERS: &[&str] = &[
    "captcha-internal",
    "challenge-dialog",
    "g-recaptcha",
    "let's do a quick security check",
    "security verification",
];
const RATE_LIMIT_MARKERS: &[&str] = &[
    "too many requests",
    "http error 429",
    "you've reached the weekly limit",
    "unusual activity from your account",
];
const LOGIN_URL_MARKERS: &[&str] = &["linkedin.com/login", "/authwall", "/uas/login", "linkedin.com/signup"];

const EMAIL_FIELDS: &[&str] = &["#username", "input[name='session_key']", "input[type='email']"];
const PASSWORD_FIELDS: &[&str] = &["#password", "input[name='session_password']", "input[type='password']"];
const SUBMIT_BUTTONS: &[&str] = &["button[type='submit']", "button[data-litms-control-urn*='login-submit']"];

/// Result of one page retrieval. Every outcome is a value; nothing escapes as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok(String),
    AuthRequired,
    RateLimited,
    Blocked,
    TransientError(String),
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Ok(_) => "ok",
            FetchOutcome::AuthRequired => "auth_required",
            FetchOutcome::RateLimited => "rate_limited",
            FetchOutcome::Blocked => "blocked",
            FetchOutcome::TransientError(_) => "transient_error",
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait ProfileFetcher {
    /// Retrieve `url`, re-authenticating through `session` when needed.
    async fn fetch(&mut self, url: &str, session: &mut Option<SessionState>) -> FetchOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageVerdict {
    Ready,
    AuthRequired,
    RateLimited,
    Blocked,
}

/// Decide what a loaded page is from its final URL and source.
pub fn classify_page(current_url: &str, html: &str) -> PageVerdict {
    let url = current_url.to_lowercase();
    let lower = html.to_lowercase();

    if CHALLENGE_URL_MARKERS.iter().any(|m| url.contains(m))
        || CHALLENGE_PAGE_MARKERS.iter().any(|m| lower.contains(m))
    {
        return PageVerdict::Blocked;
    }
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return PageVerdict::RateLimited;
    }
    if LOGIN_URL_MARKERS.iter().any(|m| url.contains(m)) || is_blank(html) {
        return PageVerdict::AuthRequired;
    }
    PageVerdict::Ready
}

/// Decide how a login attempt ended from where the browser landed and the cookies it holds.
pub fn login_verdict(current_url: &str, cookies: Vec<StoredCookie>) -> LoginResult {
    let url = current_url.to_lowercase();
    if CHALLENGE_URL_MARKERS.iter().any(|m| url.contains(m)) {
        return LoginResult::Challenged;
    }
    if LOGIN_URL_MARKERS.iter().any(|m| url.contains(m)) {
        return LoginResult::Rejected(format!("still on login page: {}", current_url));
    }
    if !cookies.iter().any(|c| c.name == AUTH_COOKIE) {
        return LoginResult::Rejected("no session cookie issued".to_string());
    }
    LoginResult::Success(cookies)
}

fn is_blank(html: &str) -> bool {
    if html.trim().is_empty() {
        return true;
    }
    Html::parse_document(html)
        .root_element()
        .text()
        .all(|t| t.trim().is_empty())
}

/// Identity markers presented to the site. Kept for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub user_agent: String,
    pub window: (u32, u32),
}

impl BrowserIdentity {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let user_agent = USER_AGENTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        Self::with_user_agent(user_agent)
    }

    pub fn with_user_agent(user_agent: String) -> Self {
        let mut rng = rand::thread_rng();
        let window = (1920 - rng.gen_range(0..=160), 1080 - rng.gen_range(0..=90));
        Self { user_agent, window }
    }
}

pub struct StealthFetcher {
    driver: WebDriver,
    store: SessionStore,
    identity: BrowserIdentity,
    pacing: PacingWindow,
    scroll_steps: u32,
    page_load_timeout: Duration,
    email: String,
    password: String,
    auth: AuthState,
}

impl StealthFetcher {
    /// Starts a browser session. A resumed session keeps the user agent it was created with.
    pub async fn launch(settings: &Settings, store: SessionStore, resumed: Option<&SessionState>) -> Result<Self> {
        let identity = match resumed {
            Some(state) if !state.user_agent.is_empty() => BrowserIdentity::with_user_agent(state.user_agent.clone()),
            _ => BrowserIdentity::random(),
        };

        let mut caps = DesiredCapabilities::chrome();
        if settings.headless {
            caps.set_headless()?;
        }
        for arg in CHROME_ARGS {
            caps.add_arg(arg)?;
        }
        caps.add_arg(&format!("--user-agent={}", identity.user_agent))?;
        caps.add_arg(&format!("--window-size={},{}", identity.window.0, identity.window.1))?;
        caps.add_experimental_option("excludeSwitches", vec!["enable-automation"])?;
        caps.add_experimental_option("useAutomationExtension", false)?;

        let driver = WebDriver::new(&settings.webdriver_url, caps)
            .await
            .with_context(|| format!("Failed to start browser via WebDriver at {}", settings.webdriver_url))?;
        if let Err(e) = harden(&driver).await {
            if let Err(quit) = driver.quit().await {
                debug!(error = %quit, "browser did not shut down cleanly");
            }
            return Err(anyhow::Error::new(e).context("Failed to install fingerprint overrides"));
        }
        info!(user_agent = %identity.user_agent, "browser session started");

        Ok(Self {
            driver,
            store,
            identity,
            pacing: settings.pacing,
            scroll_steps: settings.browser.scroll_steps,
            page_load_timeout: Duration::from_secs(settings.browser.page_load_timeout_secs),
            email: settings.login_email.clone(),
            password: settings.login_password.clone(),
            auth: AuthState::default(),
        })
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.driver.quit().await {
            warn!(error = %e, "browser did not shut down cleanly");
        }
    }

    async fn pause(&self, min_ms: u64, max_ms: u64) {
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        sleep(Duration::from_millis(ms)).await;
    }

    /// Every navigation waits out a pacing delay first.
    async fn paced_goto(&self, url: &str) -> Result<(), String> {
        let delay = self.pacing.sample();
        debug!(?delay, url, "pacing before navigation");
        sleep(delay).await;
        match timeout(self.page_load_timeout, self.driver.goto(url)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("navigation failed: {}", e)),
            Err(_) => Err(format!("navigation timed out after {:?}", self.page_load_timeout)),
        }
    }

    async fn current_url(&self) -> Result<String, String> {
        self.driver
            .current_url()
            .await
            .map(|u| u.to_string())
            .map_err(|e| format!("could not read current url: {}", e))
    }

    async fn scroll(&self) {
        for _ in 0..self.scroll_steps {
            if let Err(e) = self.driver.execute("window.scrollBy(0, window.innerHeight);", Vec::new()).await {
                warn!(error = %e, "scroll step failed");
                return;
            }
            self.pause(500, 1_500).await;
        }
        if let Err(e) = self.driver.execute("window.scrollTo(0, 0);", Vec::new()).await {
            debug!(error = %e, "scroll reset failed");
        }
        sleep(Duration::from_millis(500)).await;
    }

    async fn ensure_session(&mut self, session: &mut Option<SessionState>) -> Result<(), FetchOutcome> {
        let mut state = self.auth;
        let result = auth::ensure_session(&mut state, &*self, &self.store, session).await;
        self.auth = state;
        result
    }

    async fn restore_session(&self, state: &SessionState) -> Result<bool, String> {
        self.paced_goto(BASE_URL).await?;
        for stored in &state.cookies {
            let mut cookie = Cookie::new(stored.name.clone(), stored.value.clone());
            cookie.domain = stored.domain.clone();
            cookie.path = stored.path.clone();
            cookie.secure = stored.secure;
            if let Err(e) = self.driver.add_cookie(cookie).await {
                debug!(cookie = %stored.name, error = %e, "cookie rejected");
            }
        }

        self.paced_goto(FEED_URL).await?;
        let current = self.current_url().await?;
        Ok(current.contains("/feed") && !LOGIN_URL_MARKERS.iter().any(|m| current.contains(m)))
    }

    async fn find_first(&self, selectors: &[&str]) -> Option<WebElement> {
        for selector in selectors {
            if let Ok(element) = self.driver.find(By::Css(*selector)).await {
                return Some(element);
            }
        }
        None
    }

    async fn submit_login(&self) -> Result<LoginResult, String> {
        if self.email.trim().is_empty() || self.password.is_empty() {
            return Ok(LoginResult::Rejected("login credentials are not configured".to_string()));
        }

        info!("logging in");
        self.paced_goto(LOGIN_URL).await?;

        let Some(email) = self.find_first(EMAIL_FIELDS).await else {
            // Redirected away from the form: already signed in, or challenged.
            let current = self.current_url().await?;
            return Ok(login_verdict(&current, self.collect_cookies().await?));
        };
        self.pause(1_000, 2_000).await;
        email.send_keys(self.email.as_str()).await.map_err(|e| e.to_string())?;

        let Some(password) = self.find_first(PASSWORD_FIELDS).await else {
            return Ok(LoginResult::Rejected("password field not found".to_string()));
        };
        self.pause(500, 1_500).await;
        password.send_keys(self.password.as_str()).await.map_err(|e| e.to_string())?;

        let Some(submit) = self.find_first(SUBMIT_BUTTONS).await else {
            return Ok(LoginResult::Rejected("submit button not found".to_string()));
        };
        self.pause(500, 1_500).await;
        submit.click().await.map_err(|e| e.to_string())?;

        // Wait for the redirect away from the login form.
        let deadline = Instant::now() + LOGIN_SETTLE;
        let mut current = self.current_url().await?;
        while LOGIN_URL_MARKERS.iter().any(|m| current.contains(m)) && Instant::now() < deadline {
            sleep(Duration::from_millis(500)).await;
            current = self.current_url().await?;
        }
        self.pause(2_000, 3_000).await;
        current = self.current_url().await?;

        let verdict = login_verdict(&current, self.collect_cookies().await?);
        if matches!(verdict, LoginResult::Success(_)) {
            info!(url = %current, "login succeeded");
        }
        Ok(verdict)
    }

    async fn collect_cookies(&self) -> Result<Vec<StoredCookie>, String> {
        let cookies = self
            .driver
            .get_all_cookies()
            .await
            .map_err(|e| format!("could not read cookies: {}", e))?;
        Ok(cookies
            .iter()
            .map(|c| StoredCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                secure: c.secure,
            })
            .collect())
    }
}

impl Authenticator for StealthFetcher {
    async fn restore(&self, state: &SessionState) -> Result<bool, String> {
        self.restore_session(state).await
    }

    async fn login(&self) -> Result<LoginResult, String> {
        self.submit_login().await
    }

    fn user_agent(&self) -> &str {
        &self.identity.user_agent
    }
}

async fn harden(driver: &WebDriver) -> WebDriverResult<()> {
    let dev_tools = ChromeDevTools::new(driver.handle.clone());
    dev_tools
        .execute_cdp_with_params("Page.addScriptToEvaluateOnNewDocument", json!({ "source": STEALTH_SCRIPT }))
        .await?;
    dev_tools
        .execute_cdp_with_params("Emulation.setTimezoneOverride", json!({ "timezoneId": TIMEZONE }))
        .await?;
    dev_tools
        .execute_cdp_with_params("Emulation.setLocaleOverride", json!({ "locale": LOCALE }))
        .await?;
    Ok(())
}

impl ProfileFetcher for StealthFetcher {
    async fn fetch(&mut self, url: &str, session: &mut Option<SessionState>) -> FetchOutcome {
        if let Err(outcome) = self.ensure_session(session).await {
            return outcome;
        }

        if let Err(reason) = self.paced_goto(url).await {
            return FetchOutcome::TransientError(reason);
        }
        let current = match self.current_url().await {
            Ok(current) => current,
            Err(reason) => return FetchOutcome::TransientError(reason),
        };
        let first_look = match self.driver.source().await {
            Ok(html) => html,
            Err(e) => return FetchOutcome::TransientError(format!("could not read page: {}", e)),
        };

        match classify_page(&current, &first_look) {
            PageVerdict::Ready => {}
            PageVerdict::Blocked => return FetchOutcome::Blocked,
            PageVerdict::RateLimited => return FetchOutcome::RateLimited,
            PageVerdict::AuthRequired => {
                auth::expire_session(&mut self.auth, &self.store, session);
                return FetchOutcome::AuthRequired;
            }
        }

        self.scroll().await;
        match self.driver.source().await {
            Ok(html) => FetchOutcome::Ok(html),
            Err(e) => FetchOutcome::TransientError(format!("could not read page: {}", e)),
        }
    }
}
