//! Per-peer message sequences and the rules for merging mutations into them.
//!
//! Sequences are kept in delivery order. Nothing here re-sorts by `sent_at`,
//! so a message delivered late during a reconnect stays where it landed.

use std::collections::HashMap;

use shared::domain::{Message, MessageId, Reactions, Username};
use tracing::debug;
use uuid::Uuid;

/// Local correlation handle for a message the service has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingHandle(Uuid);

impl PendingHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    peer: Username,
    messages: Vec<Message>,
    pending: Vec<(PendingHandle, usize)>,
}

impl Conversation {
    fn new(peer: Username) -> Self {
        Self {
            peer,
            messages: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn peer(&self) -> &Username {
        &self.peer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_message(&self, handle: PendingHandle) -> Option<&Message> {
        self.pending
            .iter()
            .find(|(pending, _)| *pending == handle)
            .map(|(_, index)| &self.messages[*index])
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ids of confirmed messages authored by the peer that are still unread.
    pub fn unread_from_peer(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|message| message.sender == self.peer && !message.read)
            .filter_map(|message| message.id.clone())
            .collect()
    }

    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id.as_ref() == Some(id))
    }

    fn confirm_pending(&mut self, message: &Message) -> Option<PendingHandle> {
        let slot = self
            .pending
            .iter()
            .position(|(_, index)| self.messages[*index].content == message.content)?;
        let (handle, index) = self.pending.remove(slot);
        self.messages[index] = message.clone();
        Some(handle)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    NewMessage(Message),
    Edit { id: MessageId, content: String },
    Delete { id: MessageId },
    Reaction { id: MessageId, reactions: Reactions },
    ReadAck { ids: Vec<MessageId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingId,
    NoConversation,
    UnknownMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Appended { peer: Username },
    Confirmed { peer: Username, handle: PendingHandle },
    Updated { peer: Username },
    Acknowledged { peers: Vec<Username>, marked: usize },
    Dropped(DropReason),
}

/// Owner of every conversation sequence for one logged-in user.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    owner: Username,
    conversations: HashMap<Username, Conversation>,
}

impl ConversationStore {
    pub fn new(owner: Username) -> Self {
        Self {
            owner,
            conversations: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &Username {
        &self.owner
    }

    pub fn conversation(&self, peer: &Username) -> Option<&Conversation> {
        self.conversations.get(peer)
    }

    /// Creates the conversation for `peer`, or empties it if it already exists.
    pub fn open(&mut self, peer: &Username) {
        self.conversations
            .insert(peer.clone(), Conversation::new(peer.clone()));
    }

    pub fn load_snapshot(&mut self, peer: &Username, messages: Vec<Message>) {
        let conversation = self
            .conversations
            .entry(peer.clone())
            .or_insert_with(|| Conversation::new(peer.clone()));
        conversation.messages = messages;
        conversation.pending.clear();
        debug!(peer = %peer, len = conversation.messages.len(), "conversation: snapshot loaded");
    }

    pub fn append_local_pending(&mut self, peer: &Username, message: Message) -> PendingHandle {
        let conversation = self
            .conversations
            .entry(peer.clone())
            .or_insert_with(|| Conversation::new(peer.clone()));
        let handle = PendingHandle::new();
        conversation.messages.push(Message { id: None, ..message });
        conversation
            .pending
            .push((handle, conversation.messages.len() - 1));
        handle
    }

    pub fn apply_incoming(&mut self, mutation: Mutation) -> ApplyOutcome {
        match mutation {
            Mutation::NewMessage(message) => self.apply_new_message(message),
            Mutation::Edit { id, content } => self.update_message(&id, |message| {
                message.content = content;
                message.edited = true;
            }),
            Mutation::Delete { id } => self.update_message(&id, |message| {
                message.deleted = true;
            }),
            Mutation::Reaction { id, reactions } => self.update_message(&id, |message| {
                message.reactions.replace(reactions);
            }),
            Mutation::ReadAck { ids } => self.apply_read_ack(&ids),
        }
    }

    fn apply_new_message(&mut self, message: Message) -> ApplyOutcome {
        if message.id.is_none() {
            return ApplyOutcome::Dropped(DropReason::MissingId);
        }
        let authored_by_owner = message.sender == self.owner;
        let peer = if authored_by_owner {
            message.receiver.clone()
        } else {
            message.sender.clone()
        };
        let Some(conversation) = self.conversations.get_mut(&peer) else {
            debug!(peer = %peer, "conversation: no stored sequence, discarding new message");
            return ApplyOutcome::Dropped(DropReason::NoConversation);
        };

        if authored_by_owner {
            if let Some(handle) = conversation.confirm_pending(&message) {
                return ApplyOutcome::Confirmed { peer, handle };
            }
        }

        conversation.messages.push(message);
        ApplyOutcome::Appended { peer }
    }

    fn update_message(&mut self, id: &MessageId, apply: impl FnOnce(&mut Message)) -> ApplyOutcome {
        for conversation in self.conversations.values_mut() {
            if let Some(index) = conversation.position_of(id) {
                apply(&mut conversation.messages[index]);
                return ApplyOutcome::Updated {
                    peer: conversation.peer.clone(),
                };
            }
        }
        debug!(message_id = %id, "conversation: mutation for unknown message dropped");
        ApplyOutcome::Dropped(DropReason::UnknownMessage)
    }

    fn apply_read_ack(&mut self, ids: &[MessageId]) -> ApplyOutcome {
        let mut peers = Vec::new();
        let mut marked = 0;
        for conversation in self.conversations.values_mut() {
            let mut touched = false;
            for message in &mut conversation.messages {
                let referenced = message.id.as_ref().is_some_and(|id| ids.contains(id));
                if referenced && !message.read {
                    message.read = true;
                    marked += 1;
                    touched = true;
                }
            }
            if touched {
                peers.push(conversation.peer.clone());
            }
        }
        peers.sort();
        ApplyOutcome::Acknowledged { peers, marked }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
