//! Reducer over every input the client reacts to.
//!
//! Inbound frames, timer expiries, REST results and user actions all end up
//! here, one call per lock turn. Nothing in this module awaits; the async
//! shell in `lib.rs` performs the returned effects.

use std::fmt::Display;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{Message, MessageId, PeerUser, Username},
    protocol::{
        ClientRequest, DeleteMessage, EditMessage, OutgoingMessage, ReactToMessage, ServerEvent,
        UnreadCounts,
    },
};
use tracing::{debug, warn};

use crate::{
    connection::{ConnectionLifecycle, ConnectionState},
    conversation::{ApplyOutcome, Conversation, ConversationStore, DropReason, Mutation, PendingHandle},
    error::{ClientError, ClientResult},
    notifications::{notifications_for, Notification, NotificationPermission},
    presence::{presence_label, Roster},
    read_receipts::ReadReceiptCoordinator,
    typing::TypingTracker,
    ClientEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Outbound channel event. Dropped by the shell while not connected.
    Emit(ClientRequest),
    Notify(Notification),
    Publish(ClientEvent),
}

/// Inbound events that were thrown away, by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardStats {
    pub malformed: u64,
    /// Edit, delete or reaction for a message id no stored conversation holds.
    pub unmatched: u64,
    /// New message for a peer without a stored conversation.
    pub orphaned: u64,
}

/// Identifies one snapshot fetch. Only the latest tag may populate the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionTag(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct TypingTick {
    pub peer: Username,
    pub generation: u64,
    pub effects: Vec<Effect>,
}

pub struct SyncEngine {
    store: Option<ConversationStore>,
    selected: Option<PeerUser>,
    selection: u64,
    roster: Roster,
    typing: TypingTracker,
    receipts: ReadReceiptCoordinator,
    connection: ConnectionLifecycle,
    stats: DiscardStats,
    last_error: Option<String>,
    permission: NotificationPermission,
    preview_chars: usize,
}

impl SyncEngine {
    pub fn new(preview_chars: usize) -> Self {
        Self {
            store: None,
            selected: None,
            selection: 0,
            roster: Roster::default(),
            typing: TypingTracker::new(),
            receipts: ReadReceiptCoordinator::new(),
            connection: ConnectionLifecycle::default(),
            stats: DiscardStats::default(),
            last_error: None,
            permission: NotificationPermission::default(),
            preview_chars,
        }
    }

    pub fn start_session(&mut self, owner: Username) {
        self.clear_state();
        self.store = Some(ConversationStore::new(owner));
    }

    /// Forgets everything tied to the session and returns the channel to `Idle`.
    pub fn reset(&mut self) {
        self.clear_state();
        self.store = None;
        self.connection.reset();
    }

    fn clear_state(&mut self) {
        self.selected = None;
        self.selection += 1;
        self.roster.clear();
        self.typing.reset();
        self.receipts.clear();
        self.last_error = None;
    }

    pub fn owner(&self) -> Option<&Username> {
        self.store.as_ref().map(ConversationStore::owner)
    }

    pub fn has_session(&self) -> bool {
        self.store.is_some()
    }

    pub fn selected(&self) -> Option<&PeerUser> {
        self.selected.as_ref()
    }

    pub fn roster(&self) -> &[PeerUser] {
        self.roster.users()
    }

    pub fn conversation(&self, peer: &Username) -> Option<&Conversation> {
        self.store.as_ref()?.conversation(peer)
    }

    pub fn unread_count(&self, peer: &Username) -> u32 {
        self.receipts.count(peer)
    }

    pub fn unread_counts(&self) -> UnreadCounts {
        self.receipts.counts().clone()
    }

    pub fn is_peer_typing(&self, peer: &Username) -> bool {
        self.typing.is_peer_typing(peer)
    }

    pub fn presence_label<Tz>(&self, peer: &Username, now: &DateTime<Tz>) -> Option<String>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        self.roster.get(peer).map(|user| presence_label(user, now))
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection_epoch(&self) -> u64 {
        self.connection.epoch()
    }

    pub fn stats(&self) -> DiscardStats {
        self.stats
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn record_error(&mut self, error: &ClientError) -> Effect {
        let message = error.to_string();
        self.last_error = Some(message.clone());
        Effect::Publish(ClientEvent::Error(message))
    }

    pub fn permission(&self) -> NotificationPermission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: NotificationPermission) {
        self.permission = permission;
    }

    pub fn open_channel(&mut self) -> ClientResult<(u64, Vec<Effect>)> {
        let epoch = self.connection.open(self.has_session())?;
        self.typing.reset();
        Ok((
            epoch,
            vec![Effect::Publish(ClientEvent::ConnectionChanged(
                self.connection.state(),
            ))],
        ))
    }

    pub fn close_channel(&mut self) -> ClientResult<Vec<Effect>> {
        self.connection.close(self.has_session())?;
        self.typing.reset();
        Ok(vec![Effect::Publish(ClientEvent::ConnectionChanged(
            ConnectionState::Closed,
        ))])
    }

    /// Moves the connection on behalf of the channel task started in `epoch`.
    /// Returns `None` when that task is stale.
    pub fn advance_connection(
        &mut self,
        epoch: u64,
        next: ConnectionState,
    ) -> ClientResult<Option<Vec<Effect>>> {
        let previous = self.connection.state();
        if !self.connection.advance(epoch, next, self.has_session())? {
            return Ok(None);
        }
        let mut effects = Vec::new();
        if previous.is_connected() != next.is_connected() {
            self.typing.reset();
        }
        if next.is_connected() {
            if let Some(owner) = self.owner() {
                effects.push(Effect::Emit(ClientRequest::JoinRoom(owner.clone())));
            }
        }
        effects.push(Effect::Publish(ClientEvent::ConnectionChanged(next)));
        Ok(Some(effects))
    }

    pub fn replace_roster(&mut self, users: Vec<PeerUser>) -> Vec<Effect> {
        self.roster.replace(users);
        if let Some(selected) = self.selected.as_mut() {
            if let Some(fresh) = self.roster.get(&selected.username) {
                *selected = fresh.clone();
            }
        }
        vec![Effect::Publish(ClientEvent::RosterUpdated)]
    }

    /// Makes `peer` the selected conversation and empties it until its snapshot lands.
    pub fn select_peer(&mut self, peer: Username) -> ClientResult<(SelectionTag, Vec<Effect>)> {
        let store = self.store.as_mut().ok_or(ClientError::NotLoggedIn)?;
        let mut effects = Vec::new();
        if let Some(previous) = self.selected.as_ref() {
            if previous.username != peer {
                if let Some(signal) = self.typing.stop(&previous.username) {
                    effects.push(Effect::Emit(ClientRequest::Typing(signal)));
                }
            }
        }

        store.open(&peer);
        self.selection += 1;
        self.selected = Some(
            self.roster
                .get(&peer)
                .cloned()
                .unwrap_or_else(|| PeerUser::offline(peer.clone())),
        );
        debug!(peer = %peer, tag = self.selection, "engine: peer selected");
        effects.push(Effect::Publish(ClientEvent::PeerSelected { peer: peer.clone() }));
        effects.push(Effect::Publish(ClientEvent::ConversationUpdated { peer }));
        Ok((SelectionTag(self.selection), effects))
    }

    /// Starts a fresh snapshot fetch for the selected peer, superseding any in flight.
    pub fn resync(&mut self) -> ClientResult<(SelectionTag, Username)> {
        if self.store.is_none() {
            return Err(ClientError::NotLoggedIn);
        }
        let peer = self
            .selected
            .as_ref()
            .map(|user| user.username.clone())
            .ok_or(ClientError::NoPeerSelected)?;
        self.selection += 1;
        Ok((SelectionTag(self.selection), peer))
    }

    /// Returns `None` when a newer selection or resync superseded `tag`.
    pub fn apply_snapshot(
        &mut self,
        tag: SelectionTag,
        messages: Vec<Message>,
    ) -> Option<Vec<Effect>> {
        if tag.0 != self.selection {
            debug!(tag = tag.0, current = self.selection, "engine: stale snapshot discarded");
            return None;
        }
        let peer = self.selected.as_ref()?.username.clone();
        let store = self.store.as_mut()?;
        store.load_snapshot(&peer, messages);

        let mut effects = vec![Effect::Publish(ClientEvent::ConversationUpdated {
            peer: peer.clone(),
        })];
        self.acknowledge(&peer, &mut effects);
        Some(effects)
    }

    pub fn begin_send(
        &mut self,
        content: &str,
        now: DateTime<Utc>,
    ) -> ClientResult<(PendingHandle, Vec<Effect>)> {
        if content.trim().is_empty() {
            return Err(ClientError::Validation("message content is empty".into()));
        }
        let store = self.store.as_mut().ok_or(ClientError::NotLoggedIn)?;
        let peer = self
            .selected
            .as_ref()
            .map(|user| user.username.clone())
            .ok_or(ClientError::NoPeerSelected)?;
        let owner = store.owner().clone();

        let handle = store.append_local_pending(
            &peer,
            Message::pending(owner.clone(), peer.clone(), content, now),
        );
        let mut effects = vec![Effect::Emit(ClientRequest::SendMessage(OutgoingMessage {
            sender: owner,
            receiver: peer.clone(),
            content: content.to_string(),
            timestamp: now,
        }))];
        if let Some(signal) = self.typing.stop(&peer) {
            effects.push(Effect::Emit(ClientRequest::Typing(signal)));
        }
        effects.push(Effect::Publish(ClientEvent::ConversationUpdated { peer }));
        Ok((handle, effects))
    }

    /// A local content change. `None` when no peer is selected.
    pub fn keystroke(&mut self) -> Option<TypingTick> {
        self.store.as_ref()?;
        let peer = self.selected.as_ref()?.username.clone();
        let keystroke = self.typing.keystroke(&peer);
        Some(TypingTick {
            peer,
            generation: keystroke.generation,
            effects: keystroke
                .signal
                .map(|signal| Effect::Emit(ClientRequest::Typing(signal)))
                .into_iter()
                .collect(),
        })
    }

    pub fn expire_typing(&mut self, peer: &Username, generation: u64) -> Vec<Effect> {
        self.typing
            .expire(peer, generation)
            .map(|signal| Effect::Emit(ClientRequest::Typing(signal)))
            .into_iter()
            .collect()
    }

    pub fn react(&self, message_id: MessageId, emoji: &str) -> ClientResult<Vec<Effect>> {
        if emoji.trim().is_empty() {
            return Err(ClientError::Validation("reaction is empty".into()));
        }
        self.outbound(ClientRequest::ReactToMessage(ReactToMessage {
            message_id,
            emoji: emoji.to_string(),
        }))
    }

    pub fn delete(&self, message_id: MessageId) -> ClientResult<Vec<Effect>> {
        self.outbound(ClientRequest::DeleteMessage(DeleteMessage { message_id }))
    }

    pub fn edit(&self, message_id: MessageId, new_content: &str) -> ClientResult<Vec<Effect>> {
        if new_content.trim().is_empty() {
            return Err(ClientError::Validation("edited content is empty".into()));
        }
        self.outbound(ClientRequest::EditMessage(EditMessage {
            message_id,
            new_content: new_content.to_string(),
        }))
    }

    fn outbound(&self, request: ClientRequest) -> ClientResult<Vec<Effect>> {
        if !self.has_session() {
            return Err(ClientError::NotLoggedIn);
        }
        Ok(vec![Effect::Emit(request)])
    }

    /// Counts entries of a fetched list that could not be read.
    pub fn discard_malformed(&mut self, count: u64) {
        self.stats.malformed += count;
    }

    pub fn apply_polled_unread(&mut self, counts: UnreadCounts) -> Vec<Effect> {
        if !self.has_session() {
            return Vec::new();
        }
        self.receipts.apply_polled(counts);
        vec![Effect::Publish(ClientEvent::UnreadCountsChanged)]
    }

    /// Parses and applies one raw channel frame. Unparseable frames are counted
    /// and dropped.
    pub fn dispatch_frame(&mut self, frame: &str, received_at: DateTime<Utc>) -> Vec<Effect> {
        match parse_event(frame) {
            Ok(event) => self.dispatch(event, received_at),
            Err(err) => {
                self.stats.malformed += 1;
                warn!("engine: {err}");
                Vec::new()
            }
        }
    }

    pub fn dispatch(&mut self, event: ServerEvent, received_at: DateTime<Utc>) -> Vec<Effect> {
        if !self.has_session() {
            debug!(event = event.name(), "engine: event without session ignored");
            return Vec::new();
        }
        match event {
            ServerEvent::ReceiveMessage(message) => self.on_new_message(message),
            ServerEvent::UserStatus(status) => {
                let user = self.roster.apply_status(&status, received_at);
                if let Some(selected) = self.selected.as_mut() {
                    if selected.username == user.username {
                        *selected = user.clone();
                    }
                }
                vec![Effect::Publish(ClientEvent::PresenceChanged(user))]
            }
            ServerEvent::Typing(notice) => {
                if self.typing.set_remote(&notice.from, notice.is_typing) {
                    vec![Effect::Publish(ClientEvent::TypingChanged {
                        peer: notice.from,
                        is_typing: notice.is_typing,
                    })]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::MessageReacted(reacted) => self.mutate(Mutation::Reaction {
                id: reacted.message_id,
                reactions: reacted.reactions,
            }),
            ServerEvent::MessageDeleted(deleted) => self.mutate(Mutation::Delete {
                id: deleted.message_id,
            }),
            ServerEvent::MessageEdited(edited) => self.mutate(Mutation::Edit {
                id: edited.message_id,
                content: edited.new_content,
            }),
            ServerEvent::MessagesRead(read) => self.mutate(Mutation::ReadAck {
                ids: read.message_ids,
            }),
        }
    }

    fn on_new_message(&mut self, message: Message) -> Vec<Effect> {
        let Some(store) = self.store.as_mut() else {
            return Vec::new();
        };
        let owner = store.owner().clone();
        let selected = self.selected.as_ref().map(|user| user.username.clone());
        let notifications = notifications_for(
            &message,
            &owner,
            selected.as_ref(),
            self.permission,
            self.preview_chars,
        );
        let sender = message.sender.clone();

        let mut effects = Vec::new();
        match store.apply_incoming(Mutation::NewMessage(message)) {
            ApplyOutcome::Dropped(DropReason::MissingId) => {
                self.stats.malformed += 1;
                warn!(sender = %sender, "engine: new message without id dropped");
                return effects;
            }
            ApplyOutcome::Dropped(_) => self.stats.orphaned += 1,
            ApplyOutcome::Appended { peer } | ApplyOutcome::Confirmed { peer, .. } => {
                effects.push(Effect::Publish(ClientEvent::ConversationUpdated {
                    peer: peer.clone(),
                }));
                if selected.as_ref() == Some(&peer) && sender != owner {
                    self.acknowledge(&peer, &mut effects);
                }
            }
            ApplyOutcome::Updated { .. } | ApplyOutcome::Acknowledged { .. } => {}
        }

        if sender != owner && selected.as_ref() != Some(&sender) {
            let count = self.receipts.increment(&sender);
            debug!(peer = %sender, count, "engine: unread incremented");
            effects.push(Effect::Publish(ClientEvent::UnreadCountsChanged));
        }
        effects.extend(notifications.into_iter().map(Effect::Notify));
        effects
    }

    fn mutate(&mut self, mutation: Mutation) -> Vec<Effect> {
        let Some(store) = self.store.as_mut() else {
            return Vec::new();
        };
        match store.apply_incoming(mutation) {
            ApplyOutcome::Updated { peer } => {
                vec![Effect::Publish(ClientEvent::ConversationUpdated { peer })]
            }
            ApplyOutcome::Acknowledged { peers, .. } => peers
                .into_iter()
                .map(|peer| Effect::Publish(ClientEvent::ConversationUpdated { peer }))
                .collect(),
            ApplyOutcome::Dropped(DropReason::UnknownMessage) => {
                self.stats.unmatched += 1;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Emits one batched read acknowledgement for `peer` and applies it locally.
    fn acknowledge(&mut self, peer: &Username, effects: &mut Vec<Effect>) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let Some(conversation) = store.conversation(peer) else {
            return;
        };
        let Some(ack) = self.receipts.acknowledge(store.owner(), conversation) else {
            return;
        };
        store.apply_incoming(Mutation::ReadAck {
            ids: ack.message_ids.clone(),
        });
        effects.push(Effect::Emit(ClientRequest::MarkAsRead(ack)));
        effects.push(Effect::Publish(ClientEvent::UnreadCountsChanged));
    }
}

pub fn parse_event(frame: &str) -> ClientResult<ServerEvent> {
    serde_json::from_str(frame).map_err(|err| ClientError::MalformedEvent(err.to_string()))
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
