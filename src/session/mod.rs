//! Login session handling.
//!
//! The [`SessionManager`] is the only writer of session state. Jobs hold an
//! `Arc<Session>` snapshot and ask the manager for a refresh when the store
//! rejects their token.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ClientError, Error, Result, translate};
use crate::networking::StoreClient;
use crate::storage::CredentialStore;

/// A session with less than this much time left is refreshed instead of reused.
pub const SESSION_REUSE_MARGIN: Duration = Duration::from_secs(10 * 60);

/// The persisted login record.
///
/// Only `refresh_token` and `expires_at` drive decisions; every other field
/// returned by the store is kept as-is so it survives a load/save cycle.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(
        default,
        rename = "displayName",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Credentials {
    /// A bare record holding only a refresh token, as produced by an external login.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            expires_at: None,
            access_token: None,
            account_id: None,
            display_name: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Parsed `expires_at`, if present and well formed.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().and_then(parse_expiry)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("account_id", &self.account_id)
            .field("display_name", &self.display_name)
            .field("extra_fields", &self.extra.len())
            .finish()
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = raw.trim_end_matches(['Z', 'z']);
    match NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(dt) => Some(dt.and_utc()),
        Err(err) => {
            debug!("session: unparseable expiry {raw:?}: {err}");
            None
        }
    }
}

/// Pull the authorization code out of what the user pasted.
///
/// The web login page shows either the bare code or a JSON object with an
/// `authorizationCode` field.
pub fn parse_authorization_code(input: &str) -> Option<String> {
    let input = input.trim();
    let code = if input.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(input).ok()?;
        value.get("authorizationCode")?.as_str()?.trim().to_owned()
    } else {
        input.trim_matches('"').trim().to_owned()
    };
    (!code.is_empty()).then_some(code)
}

/// Only the login-relevant kinds pass through; anything else is a transport failure.
fn login_error(err: Error) -> Error {
    match err {
        Error::InvalidCredentials
        | Error::Transport { .. }
        | Error::Unknown { .. }
        | Error::Cancelled => err,
        other => Error::Transport {
            retryable: false,
            message: other.to_string(),
        },
    }
}

/// True when `expires_at` lies more than [`SESSION_REUSE_MARGIN`] after `now`.
pub fn expiry_has_headroom(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (expires_at - now)
        .to_std()
        .is_ok_and(|left| left > SESSION_REUSE_MARGIN)
}

/// An authenticated, time-bounded credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
    account_id: Option<String>,
    display_name: Option<String>,
}

impl Session {
    /// Build a session from a record returned by the store.
    pub fn from_credentials(record: &Credentials) -> Result<Self> {
        let access_token = record
            .access_token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::unknown("login response carried no access token"))?;
        let expires_at = record
            .expiry()
            .ok_or_else(|| Error::unknown("login response carried no valid expiry"))?;
        Ok(Self {
            access_token,
            refresh_token: record.refresh_token.clone(),
            expires_at,
            account_id: record.account_id.clone(),
            display_name: record.display_name.clone(),
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn has_headroom(&self, now: DateTime<Utc>) -> bool {
        expiry_has_headroom(self.expires_at, now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Owns the current session and decides between reuse, resume and refresh.
pub struct SessionManager {
    client: Arc<dyn StoreClient>,
    store: Arc<dyn CredentialStore>,
    current: RwLock<Option<Arc<Session>>>,
    writer: Mutex<()>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn StoreClient>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            client,
            store,
            current: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    /// The session currently held, if any. Never touches the network.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return a session valid for at least [`SESSION_REUSE_MARGIN`].
    ///
    /// # Errors
    /// `NoCredentials` when nothing is stored, `InvalidCredentials` when the
    /// store rejects the refresh token (the stored record is cleared; `Disk`
    /// if clearing it failed), and `Transport` when the store cannot be
    /// reached (the record is kept).
    pub async fn authenticate(&self) -> Result<Arc<Session>> {
        let _writer = self.writer.lock().await;
        self.authenticate_locked(false).await
    }

    /// Exchange the refresh token for a new session regardless of expiry.
    pub async fn refresh(&self) -> Result<Arc<Session>> {
        let _writer = self.writer.lock().await;
        self.authenticate_locked(true).await
    }

    /// Store a fresh record (e.g. from a browser login) and log in with it.
    pub async fn login(&self, credentials: Credentials) -> Result<Arc<Session>> {
        let _writer = self.writer.lock().await;
        self.store.save(&credentials).await?;
        self.set_current(None);
        self.authenticate_locked(true).await
    }

    /// Log in with a one-time code pasted from the web login page.
    ///
    /// Accepts the bare code or the JSON blob the page shows. A rejected code
    /// leaves any stored record alone.
    pub async fn login_with_code(&self, input: &str) -> Result<Arc<Session>> {
        let code = parse_authorization_code(input).ok_or_else(|| {
            Error::InvalidParameters("no authorization code in input".into())
        })?;
        let _writer = self.writer.lock().await;
        info!("session: logging in with authorization code");
        let record = self.client.exchange_code(&code).await.map_err(|raw| {
            let err = login_error(translate(raw));
            error!("session: authorization code login failed: {err}");
            err
        })?;
        let session = Session::from_credentials(&record)?;
        self.store.save(&record).await?;
        info!(
            "session: logged in, expires at {}",
            session.expires_at().to_rfc3339()
        );
        Ok(self.install(session))
    }

    /// Drop the held session so the next `authenticate` contacts the store.
    ///
    /// Serialized with refresh and login through the writer lock.
    pub async fn invalidate(&self) {
        let _writer = self.writer.lock().await;
        debug!("session: invalidated");
        self.set_current(None);
    }

    /// Drop the held session and forget the stored credentials.
    pub async fn logout(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.set_current(None);
        self.store.clear().await?;
        info!("session: logged out");
        Ok(())
    }

    async fn authenticate_locked(&self, force_refresh: bool) -> Result<Arc<Session>> {
        let Some(stored) = self.store.load().await? else {
            return Err(Error::NoCredentials);
        };
        let now = Utc::now();

        if !force_refresh {
            if let Some(session) = self.current()
                && session.has_headroom(now)
            {
                debug!("session: reusing held session");
                return Ok(session);
            }
            if let Some(session) = self.try_resume(&stored, now).await {
                return Ok(session);
            }
        }

        info!("session: logging in with refresh token");
        let record = match self.client.start_session(&stored.refresh_token).await {
            Ok(record) => record,
            Err(raw) => return Err(self.login_failed(raw).await),
        };
        let session = Session::from_credentials(&record)?;

        let previous = self
            .current()
            .map(|held| held.expires_at())
            .into_iter()
            .chain(stored.expiry())
            .max();
        if let Some(previous) = previous
            && session.expires_at() <= previous
        {
            warn!("session: token grant did not extend the session expiry");
            return Err(Error::unknown(
                "token grant did not extend the session expiry",
            ));
        }

        self.store.save(&record).await?;
        info!(
            "session: logged in, expires at {}",
            session.expires_at().to_rfc3339()
        );
        Ok(self.install(session))
    }

    async fn try_resume(&self, stored: &Credentials, now: DateTime<Utc>) -> Option<Arc<Session>> {
        stored.access_token.as_ref()?;
        if !stored
            .expiry()
            .is_some_and(|expiry| expiry_has_headroom(expiry, now))
        {
            return None;
        }

        info!("session: trying to re-use existing login session");
        let outcome = match self.client.resume_session(stored).await {
            Ok(record) => Session::from_credentials(&record),
            Err(ClientError::Rejected(reason)) => {
                warn!("session: resuming failed due to invalid credentials: {reason}");
                Err(Error::InvalidCredentials)
            }
            Err(raw) => {
                warn!("session: resuming failed: {raw}");
                Err(translate(raw))
            }
        };
        match outcome {
            Ok(session) => Some(self.install(session)),
            Err(_) => {
                info!("session: falling back to refresh token");
                None
            }
        }
    }

    async fn login_failed(&self, raw: ClientError) -> Error {
        match translate(raw) {
            Error::InvalidCredentials => {
                error!("session: stored credentials are no longer valid, please login again");
                self.set_current(None);
                match self.store.clear().await {
                    Ok(()) => Error::InvalidCredentials,
                    Err(err) => {
                        error!("session: failed to clear rejected credentials: {err}");
                        err
                    }
                }
            }
            other => {
                let err = login_error(other);
                error!("session: login request failed: {err}, please try again later");
                err
            }
        }
    }

    fn install(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.set_current(Some(Arc::clone(&session)));
        session
    }

    fn set_current(&self, session: Option<Arc<Session>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = session;
    }
}
