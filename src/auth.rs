use tracing::{info, warn};

use crate::fetcher::FetchOutcome;
use crate::session::{SessionState, SessionStore, StoredCookie};

#[derive(Debug)]
pub enum LoginResult {
    Success(Vec<StoredCookie>),
    Challenged,
    Rejected(String),
}

/// The browser-side steps of establishing a session.
#[allow(async_fn_in_trait)]
pub trait Authenticator {
    /// Load `state` into the browser and report whether the site accepts it.
    async fn restore(&self, state: &SessionState) -> Result<bool, String>;
    async fn login(&self) -> Result<LoginResult, String>;
    fn user_agent(&self) -> &str;
}

/// Where the fetcher stands with the site during one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Unverified,
    Authenticated,
    /// Login was attempted and refused. No further attempts this cycle.
    LoginFailed,
}

/// Resume the stored session if the site accepts it, otherwise log in once.
pub async fn ensure_session<A: Authenticator>(
    state: &mut AuthState,
    auth: &A,
    store: &SessionStore,
    session: &mut Option<SessionState>,
) -> Result<(), FetchOutcome> {
    match state {
        AuthState::Authenticated => return Ok(()),
        AuthState::LoginFailed => return Err(FetchOutcome::AuthRequired),
        AuthState::Unverified => {}
    }

    if let Some(stored) = session.as_ref() {
        match auth.restore(stored).await {
            Ok(true) => {
                info!("resumed stored session");
                *state = AuthState::Authenticated;
                return Ok(());
            }
            Ok(false) => {
                info!("stored session was rejected, logging in again");
                forget(store, session);
            }
            Err(reason) => return Err(FetchOutcome::TransientError(reason)),
        }
    }

    match auth.login().await {
        Ok(LoginResult::Success(cookies)) => {
            let fresh = SessionState::new(cookies, auth.user_agent().to_string());
            if let Err(e) = store.save(&fresh) {
                warn!(error = %e, "could not persist refreshed session");
            }
            *session = Some(fresh);
            *state = AuthState::Authenticated;
            Ok(())
        }
        Ok(LoginResult::Challenged) => {
            warn!("login hit a verification challenge");
            *state = AuthState::LoginFailed;
            Err(FetchOutcome::Blocked)
        }
        Ok(LoginResult::Rejected(reason)) => {
            warn!(%reason, "login failed");
            *state = AuthState::LoginFailed;
            Err(FetchOutcome::AuthRequired)
        }
        Err(reason) => Err(FetchOutcome::TransientError(reason)),
    }
}

/// The site bounced an authenticated request. The next fetch re-authenticates.
pub fn expire_session(state: &mut AuthState, store: &SessionStore, session: &mut Option<SessionState>) {
    *state = AuthState::Unverified;
    forget(store, session);
}

fn forget(store: &SessionStore, session: &mut Option<SessionState>) {
    *session = None;
    if let Err(e) = store.invalidate() {
        warn!(error = %e, "could not invalidate stored session");
    }
}
