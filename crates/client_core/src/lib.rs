use std::{collections::HashMap, sync::Arc};

use chrono::{Local, Utc};
use shared::{
    domain::{Message, MessageId, PeerUser, Username},
    protocol::{ClientRequest, UnreadCounts},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod presence;
pub mod read_receipts;
pub mod session;
pub mod typing;

pub use api::ApiClient;
pub use config::{load_settings, ClientSettings};
pub use connection::{ChannelConnector, ChannelLink, ConnectionState, WebSocketConnector};
pub use conversation::PendingHandle;
pub use engine::{DiscardStats, Effect, SelectionTag, SyncEngine};
pub use error::{ClientError, ClientResult};
pub use notifications::{
    LoggingNotificationSink, Notification, NotificationPermission, NotificationSink,
};
pub use session::{DurableSessionVault, EphemeralSessionVault, Session, SessionVault};

use connection::channel_url;
use session::SessionStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LoggedIn { username: Username },
    LoggedOut { forced: bool },
    ConnectionChanged(ConnectionState),
    RosterUpdated,
    PeerSelected { peer: Username },
    ConversationUpdated { peer: Username },
    PresenceChanged(PeerUser),
    TypingChanged { peer: Username, is_typing: bool },
    UnreadCountsChanged,
    Error(String),
}

/// The client shell: owns the session, the channel and the background tasks,
/// and serializes every state change through one [`SyncEngine`].
pub struct RealtimeClient {
    settings: ClientSettings,
    api: ApiClient,
    session: SessionStore,
    connector: Arc<dyn ChannelConnector>,
    notifier: Arc<dyn NotificationSink>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

struct ClientState {
    engine: SyncEngine,
    outbound: Option<mpsc::UnboundedSender<String>>,
    channel_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    typing_timers: HashMap<Username, (u64, JoinHandle<()>)>,
}

impl ClientState {
    /// Detaches the background tasks. The caller aborts them once it no longer
    /// runs on one of them.
    fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.outbound = None;
        self.channel_task
            .take()
            .into_iter()
            .chain(self.poll_task.take())
            .chain(self.typing_timers.drain().map(|(_, (_, timer))| timer))
            .collect()
    }
}

impl RealtimeClient {
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            settings,
            Arc::new(WebSocketConnector),
            Arc::new(LoggingNotificationSink),
            Arc::new(EphemeralSessionVault::default()),
        )
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        connector: Arc<dyn ChannelConnector>,
        notifier: Arc<dyn NotificationSink>,
        vault: Arc<dyn SessionVault>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api: ApiClient::new(settings.server_url.clone()),
            session: SessionStore::new(vault),
            connector,
            notifier,
            inner: Mutex::new(ClientState {
                engine: SyncEngine::new(settings.notification_preview_chars),
                outbound: None,
                channel_task: None,
                poll_task: None,
                typing_timers: HashMap::new(),
            }),
            events,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub async fn signup(&self, username: &str, password: &str) -> ClientResult<()> {
        validate_credentials(username, password)?;
        self.api.signup(username, password).await?;
        info!(username, "client: account created");
        Ok(())
    }

    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> ClientResult<()> {
        validate_credentials(username, password)?;
        let token = match self.api.login(username, password).await {
            Ok(token) => token,
            Err(err) => {
                let mut state = self.inner.lock().await;
                let effect = state.engine.record_error(&err);
                self.apply(&mut state, vec![effect]);
                return Err(err);
            }
        };
        if self.session.is_authenticated().await {
            self.end_session(false).await;
        }
        let session = Session {
            token,
            username: Username::from(username),
        };
        self.session.establish(session.clone()).await;
        self.start(session).await
    }

    /// Picks up a session persisted by an earlier run. Returns `false` when there is none.
    pub async fn restore_session(self: &Arc<Self>) -> ClientResult<bool> {
        if self.session.is_authenticated().await {
            return Ok(true);
        }
        match self.session.restore().await? {
            Some(session) => {
                self.start(session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn logout(&self) {
        self.end_session(false).await;
    }

    async fn start(self: &Arc<Self>, session: Session) -> ClientResult<()> {
        let username = session.username.clone();
        {
            let mut state = self.inner.lock().await;
            for task in state.take_tasks() {
                task.abort();
            }
            state.engine.start_session(username.clone());
            let (epoch, effects) = state.engine.open_channel()?;
            self.apply(&mut state, effects);

            let client = Arc::clone(self);
            let token = session.token.clone();
            state.channel_task = Some(tokio::spawn(async move {
                client.run_channel(epoch, token).await;
            }));

            let client = Arc::clone(self);
            state.poll_task = Some(tokio::spawn(async move {
                client.poll_unread_counts().await;
            }));
        }
        info!(username = %username, "client: session started");
        let _ = self.events.send(ClientEvent::LoggedIn { username });
        Ok(())
    }

    /// Tears the session down: the channel is closed before the token is
    /// cleared, so an attempt in flight cannot reconnect with it.
    async fn end_session(&self, forced: bool) {
        let mut state = self.inner.lock().await;
        if state.engine.has_session() {
            match state.engine.close_channel() {
                Ok(effects) => self.apply(&mut state, effects),
                Err(err) => warn!("client: closing channel failed: {err}"),
            }
        }
        let tasks = state.take_tasks();
        let previous = self.session.clear().await;
        state.engine.reset();
        drop(state);
        for task in tasks {
            task.abort();
        }

        if let Some(session) = previous {
            if forced {
                warn!(username = %session.username, "client: session revoked by service");
            } else {
                info!(username = %session.username, "client: logged out");
            }
            let _ = self.events.send(ClientEvent::LoggedOut { forced });
        }
    }

    /// Routes a failed request: authorization failures end the session, the
    /// rest are surfaced and the stale data is kept.
    async fn fail(&self, token: &str, err: ClientError) -> ClientError {
        if !self.holds_token(token).await {
            debug!("client: failure for an ended session ignored: {err}");
        } else if err.requires_reauth() {
            self.end_session(true).await;
        } else {
            warn!("client: {err}");
            let mut state = self.inner.lock().await;
            let effect = state.engine.record_error(&err);
            self.apply(&mut state, vec![effect]);
        }
        err
    }

    /// Whether `token` still belongs to the live session. Responses to requests
    /// made under an earlier session must not touch the current one.
    async fn holds_token(&self, token: &str) -> bool {
        self.session
            .current()
            .await
            .is_some_and(|session| session.token == token)
    }

    pub async fn refresh_roster(&self) -> ClientResult<Vec<PeerUser>> {
        let token = self.session.require().await?.token;
        let users = match self.api.users(&token).await {
            Ok(users) => users,
            Err(err) => return Err(self.fail(&token, err).await),
        };
        let mut state = self.inner.lock().await;
        if !self.holds_token(&token).await {
            debug!("client: roster for an ended session discarded");
            return Ok(users);
        }
        let effects = state.engine.replace_roster(users.clone());
        self.apply(&mut state, effects);
        Ok(users)
    }

    pub async fn select_peer(&self, peer: &Username) -> ClientResult<()> {
        let token = self.session.require().await?.token;
        let tag = {
            let mut state = self.inner.lock().await;
            let (tag, effects) = state.engine.select_peer(peer.clone())?;
            self.apply(&mut state, effects);
            tag
        };
        self.load_snapshot(&token, tag, peer).await
    }

    /// Re-fetches the selected conversation. Reconnecting never does this on its own.
    pub async fn resync(&self) -> ClientResult<()> {
        let token = self.session.require().await?.token;
        let (tag, peer) = self.inner.lock().await.engine.resync()?;
        self.load_snapshot(&token, tag, &peer).await
    }

    async fn load_snapshot(
        &self,
        token: &str,
        tag: SelectionTag,
        peer: &Username,
    ) -> ClientResult<()> {
        let batch = match self.api.chat_snapshot(token, peer).await {
            Ok(batch) => batch,
            Err(err) => return Err(self.fail(token, err).await),
        };
        let mut state = self.inner.lock().await;
        if !self.holds_token(token).await {
            debug!(peer = %peer, "client: snapshot for an ended session discarded");
            return Ok(());
        }
        state.engine.discard_malformed(batch.rejected);
        match state.engine.apply_snapshot(tag, batch.messages) {
            Some(effects) => self.apply(&mut state, effects),
            None => debug!(peer = %peer, "client: snapshot superseded by a newer selection"),
        }
        Ok(())
    }

    pub async fn send_message(&self, content: &str) -> ClientResult<PendingHandle> {
        let mut state = self.inner.lock().await;
        let (handle, effects) = state.engine.begin_send(content, Utc::now())?;
        if let Some(peer) = state.engine.selected().map(|user| user.username.clone()) {
            if let Some((_, timer)) = state.typing_timers.remove(&peer) {
                timer.abort();
            }
        }
        self.apply(&mut state, effects);
        Ok(handle)
    }

    /// Call on every local edit of the compose field.
    pub async fn input_changed(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        let Some(tick) = state.engine.keystroke() else {
            return;
        };
        self.apply(&mut state, tick.effects);

        let client = Arc::clone(self);
        let peer = tick.peer.clone();
        let generation = tick.generation;
        let idle = self.settings.typing_idle;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut state = client.inner.lock().await;
            if state
                .typing_timers
                .get(&peer)
                .is_some_and(|(current, _)| *current == generation)
            {
                state.typing_timers.remove(&peer);
            }
            let effects = state.engine.expire_typing(&peer, generation);
            client.apply(&mut state, effects);
        });
        if let Some((_, previous)) = state.typing_timers.insert(tick.peer, (generation, timer)) {
            previous.abort();
        }
    }

    pub async fn react_to_message(&self, message_id: MessageId, emoji: &str) -> ClientResult<()> {
        let mut state = self.inner.lock().await;
        let effects = state.engine.react(message_id, emoji)?;
        self.apply(&mut state, effects);
        Ok(())
    }

    pub async fn delete_message(&self, message_id: MessageId) -> ClientResult<()> {
        let mut state = self.inner.lock().await;
        let effects = state.engine.delete(message_id)?;
        self.apply(&mut state, effects);
        Ok(())
    }

    pub async fn edit_message(&self, message_id: MessageId, new_content: &str) -> ClientResult<()> {
        let mut state = self.inner.lock().await;
        let effects = state.engine.edit(message_id, new_content)?;
        self.apply(&mut state, effects);
        Ok(())
    }

    pub async fn search_messages(
        &self,
        query: &str,
        with_user: Option<&Username>,
    ) -> ClientResult<Vec<Message>> {
        if query.trim().is_empty() {
            return Err(ClientError::Validation("search query is empty".into()));
        }
        let token = self.session.require().await?.token;
        match self.api.search_messages(&token, query, with_user).await {
            Ok(batch) => Ok(batch.messages),
            Err(err) => Err(self.fail(&token, err).await),
        }
    }

    pub async fn refresh_unread_counts(&self) -> ClientResult<UnreadCounts> {
        let token = self.session.require().await?.token;
        let counts = match self.api.unread_counts(&token).await {
            Ok(counts) => counts,
            Err(err) => return Err(self.fail(&token, err).await),
        };
        let mut state = self.inner.lock().await;
        if !self.holds_token(&token).await {
            debug!("client: unread counts for an ended session discarded");
            return Ok(counts);
        }
        let effects = state.engine.apply_polled_unread(counts.clone());
        self.apply(&mut state, effects);
        Ok(counts)
    }

    /// Seeds the unread counts right after the session starts, then keeps
    /// replacing them every `unread_poll_interval`.
    async fn poll_unread_counts(self: Arc<Self>) {
        let period = self.settings.unread_poll_interval;
        loop {
            if let Err(err) = self.refresh_unread_counts().await {
                debug!("client: unread poll failed: {err}");
                if matches!(err, ClientError::NotLoggedIn | ClientError::Auth { .. }) {
                    return;
                }
            }
            tokio::time::sleep(period).await;
        }
    }

    /// Drives the channel for one connection epoch: connect with a bounded
    /// retry budget, pump inbound frames through the engine, reconnect when the
    /// link drops.
    async fn run_channel(self: Arc<Self>, epoch: u64, token: String) {
        let policy = self.settings.retry_policy();
        let url = match channel_url(&self.settings.server_url, &self.settings.channel_path, &token)
        {
            Ok(url) => url,
            Err(err) => {
                error!("client: {err}");
                self.advance(epoch, ConnectionState::Disconnected).await;
                return;
            }
        };

        let mut attempt = 1;
        loop {
            match self.connector.connect(&url, &token).await {
                Ok(mut link) => {
                    {
                        let mut state = self.inner.lock().await;
                        if state.engine.connection_epoch() != epoch {
                            return;
                        }
                        state.outbound = Some(link.outbound.clone());
                        if !self.advance_locked(&mut state, epoch, ConnectionState::Connected) {
                            state.outbound = None;
                            return;
                        }
                    }
                    info!(attempt, "client: channel connected");
                    attempt = 1;

                    while let Some(frame) = link.inbound.recv().await {
                        let mut state = self.inner.lock().await;
                        if state.engine.connection_epoch() != epoch {
                            return;
                        }
                        let effects = state.engine.dispatch_frame(&frame, Utc::now());
                        self.apply(&mut state, effects);
                    }

                    let mut state = self.inner.lock().await;
                    if state.engine.connection_epoch() != epoch {
                        return;
                    }
                    warn!("client: channel dropped, reconnecting");
                    state.outbound = None;
                    let next = ConnectionState::Connecting { attempt };
                    if !self.advance_locked(&mut state, epoch, next) {
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        "client: channel connect failed: {err:#}"
                    );
                    if attempt >= policy.max_attempts {
                        self.advance(epoch, ConnectionState::Disconnected).await;
                        return;
                    }
                    tokio::time::sleep(policy.delay).await;
                    attempt += 1;
                    if !self.advance(epoch, ConnectionState::Connecting { attempt }).await {
                        return;
                    }
                }
            }
        }
    }

    async fn advance(&self, epoch: u64, next: ConnectionState) -> bool {
        let mut state = self.inner.lock().await;
        self.advance_locked(&mut state, epoch, next)
    }

    /// Returns `false` when the channel task for `epoch` should stop.
    fn advance_locked(&self, state: &mut ClientState, epoch: u64, next: ConnectionState) -> bool {
        match state.engine.advance_connection(epoch, next) {
            Ok(Some(effects)) => {
                self.apply(state, effects);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!("client: {err}");
                false
            }
        }
    }

    fn apply(&self, state: &mut ClientState, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(request) => emit(state, &request),
                Effect::Notify(notification) => self.notifier.deliver(&notification),
                Effect::Publish(event) => {
                    let _ = self.events.send(event);
                }
            }
        }
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.session.current().await
    }

    pub async fn roster(&self) -> Vec<PeerUser> {
        self.inner.lock().await.engine.roster().to_vec()
    }

    pub async fn selected_peer(&self) -> Option<PeerUser> {
        self.inner.lock().await.engine.selected().cloned()
    }

    pub async fn conversation(&self, peer: &Username) -> Option<Vec<Message>> {
        self.inner
            .lock()
            .await
            .engine
            .conversation(peer)
            .map(|conversation| conversation.messages().to_vec())
    }

    pub async fn unread_counts(&self) -> UnreadCounts {
        self.inner.lock().await.engine.unread_counts()
    }

    pub async fn unread_count(&self, peer: &Username) -> u32 {
        self.inner.lock().await.engine.unread_count(peer)
    }

    pub async fn is_peer_typing(&self, peer: &Username) -> bool {
        self.inner.lock().await.engine.is_peer_typing(peer)
    }

    pub async fn presence_label(&self, peer: &Username) -> Option<String> {
        self.inner
            .lock()
            .await
            .engine
            .presence_label(peer, &Local::now())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.engine.connection_state()
    }

    pub async fn discard_stats(&self) -> DiscardStats {
        self.inner.lock().await.engine.stats()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.lock().await.engine.last_error().map(str::to_string)
    }

    pub async fn set_notification_permission(&self, permission: NotificationPermission) {
        self.inner.lock().await.engine.set_permission(permission);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

fn emit(state: &ClientState, request: &ClientRequest) {
    let sender = state
        .outbound
        .as_ref()
        .filter(|_| state.engine.connection_state().is_connected());
    let Some(sender) = sender else {
        debug!(event = request.name(), "client: not connected, outbound event dropped");
        return;
    };
    match serde_json::to_string(request) {
        Ok(frame) => {
            if sender.send(frame).is_err() {
                debug!(event = request.name(), "client: channel closed, outbound event dropped");
            }
        }
        Err(err) => error!(event = request.name(), "client: failed to encode event: {err}"),
    }
}

fn validate_credentials(username: &str, password: &str) -> ClientResult<()> {
    if username.trim().is_empty() || password.is_empty() {
        return Err(ClientError::Validation(
            "username and password are required".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
