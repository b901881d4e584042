use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    errors::{GatewayError, GatewayResult},
    token::{decode_claims, expiry_for, Claims},
};

/// The tokens the gateway authenticates with.
///
/// `access_token` and `expires_at` are always both present or both absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub identity: Option<Claims>,
}

impl Session {
    pub fn new(access_token: String, refresh_token: Option<String>, issued_at: DateTime<Utc>) -> Self {
        // An unreadable payload is not fatal, the token may still be accepted by the backend.
        let identity = match decode_claims(&access_token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!(error = %e, "access token payload could not be decoded");
                None
            }
        };
        let expires_at = expiry_for(identity.as_ref(), issued_at);

        Self {
            access_token: Some(access_token),
            refresh_token,
            expires_at: Some(expires_at),
            identity,
        }
    }

    pub fn is_authenticated_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at,
            _ => false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated_at(Utc::now())
    }

    pub fn is_admin(&self) -> bool {
        self.identity.as_ref().map(Claims::is_admin).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedOutReason {
    UserRequested,
    RefreshFailed,
    Expired,
}

/// Broadcast whenever the session changes hands.
///
/// `SignedOut` is the cue for a UI to send the user back to its login surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    Refreshed,
    SignedOut(SignedOutReason),
}

/// Durable home of the session between runs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self) -> GatewayResult<Option<Session>>;
    async fn save(&self, session: &Session) -> GatewayResult<()>;
    async fn clear(&self) -> GatewayResult<()>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> GatewayResult<Option<Session>> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save(&self, session: &Session) -> GatewayResult<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> GatewayResult<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Keeps the session as a JSON file.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> GatewayResult<Option<Session>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatewayError::Store(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };

        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            GatewayError::Store(format!("{} is not a session file: {e}", self.path.display()))
        })
    }

    async fn save(&self, session: &Session) -> GatewayResult<()> {
        let raw = serde_json::to_vec_pretty(session)
            .map_err(|e| GatewayError::Store(format!("failed to encode session: {e}")))?;

        tokio::fs::write(&self.path, raw).await.map_err(|e| {
            GatewayError::Store(format!("failed to write {}: {e}", self.path.display()))
        })
    }

    async fn clear(&self) -> GatewayResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::Store(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}

/// The live session, shared between the gateway and whoever drives sign in/out.
pub struct SessionState {
    current: RwLock<Session>,
    store: Arc<dyn SessionStore>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(Session::default()),
            store,
            events,
        }
    }

    pub fn snapshot(&self) -> Session {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read(|s| s.access_token.clone())
    }

    /// The access token, only while it has not expired locally.
    pub fn valid_access_token(&self) -> Option<String> {
        self.read(|s| {
            if s.is_authenticated() {
                s.access_token.clone()
            } else {
                None
            }
        })
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read(|s| s.refresh_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(Session::is_authenticated)
    }

    pub fn is_admin(&self) -> bool {
        self.read(Session::is_admin)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a fresh session, as after a login.
    pub async fn establish(&self, access_token: String, refresh_token: String) -> Session {
        let session = Session::new(access_token, Some(refresh_token), Utc::now());
        self.replace(session.clone());
        self.persist(&session).await;

        info!(admin = session.is_admin(), "session established");
        self.emit(SessionEvent::SignedIn);
        session
    }

    /// Swap in a refreshed access token. The refresh token is kept unless a new one is given.
    pub async fn replace_access(&self, access_token: String, refresh_token: Option<String>) -> Session {
        let refresh_token = refresh_token.or_else(|| self.refresh_token());
        let session = Session::new(access_token, refresh_token, Utc::now());
        self.replace(session.clone());
        self.persist(&session).await;

        debug!(expires_at = ?session.expires_at, "access token replaced");
        self.emit(SessionEvent::Refreshed);
        session
    }

    /// Drop every token, here and in the store.
    pub async fn clear(&self, reason: SignedOutReason) {
        self.replace(Session::default());
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "failed to clear stored session");
        }

        info!(?reason, "session cleared");
        self.emit(SessionEvent::SignedOut(reason));
    }

    /// Load whatever the store kept from a previous run. Returns whether it is still usable.
    pub async fn restore(&self) -> bool {
        match self.store.load().await {
            Ok(Some(session)) => {
                let authenticated = session.is_authenticated();
                self.replace(session);
                debug!(authenticated, "session restored from store");
                authenticated
            }
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "failed to load stored session");
                false
            }
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        f(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, session: Session) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(session).await {
            error!(error = %e, "failed to persist session");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(Arc::new(MemorySessionStore::new()))
    }
}
