use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::Username;
use storage::Storage;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{ClientError, ClientResult};

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub username: Username,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

/// Where a session goes to survive a restart.
#[async_trait]
pub trait SessionVault: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Keeps the session for the lifetime of the process only.
#[derive(Default)]
pub struct EphemeralSessionVault {
    slot: Mutex<Option<Session>>,
}

#[async_trait]
impl SessionVault for EphemeralSessionVault {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.slot.lock().await.take();
        Ok(())
    }
}

pub struct DurableSessionVault {
    store: Storage,
}

impl DurableSessionVault {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize session storage at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }
}

#[async_trait]
impl SessionVault for DurableSessionVault {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.store.load_session().await?.map(|stored| Session {
            token: stored.token,
            username: stored.username,
        }))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.store
            .save_session(&session.token, &session.username)
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.store.clear_session().await
    }
}

/// Holder of the one authenticated identity. Every outbound call reads the
/// token from here; it is written once per login and cleared once per logout.
pub struct SessionStore {
    current: RwLock<Option<Session>>,
    vault: Arc<dyn SessionVault>,
}

impl SessionStore {
    pub fn new(vault: Arc<dyn SessionVault>) -> Self {
        Self {
            current: RwLock::new(None),
            vault,
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn require(&self) -> ClientResult<Session> {
        self.current().await.ok_or(ClientError::NotLoggedIn)
    }

    pub async fn establish(&self, session: Session) {
        if let Err(err) = self.vault.save(&session).await {
            warn!(username = %session.username, "session: failed to persist: {err:#}");
        }
        info!(username = %session.username, "session: established");
        *self.current.write().await = Some(session);
    }

    /// Loads a persisted session into memory, if there is one.
    pub async fn restore(&self) -> ClientResult<Option<Session>> {
        let restored = self.vault.load().await.map_err(ClientError::Persistence)?;
        if let Some(session) = &restored {
            info!(username = %session.username, "session: restored from storage");
            *self.current.write().await = Some(session.clone());
        }
        Ok(restored)
    }

    pub async fn clear(&self) -> Option<Session> {
        let previous = self.current.write().await.take();
        if let Err(err) = self.vault.clear().await {
            warn!("session: failed to clear persisted session: {err:#}");
        }
        previous
    }
}
