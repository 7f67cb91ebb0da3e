use std::collections::HashMap;

use shared::{
    domain::Username,
    protocol::{MarkAsRead, UnreadCounts},
};
use tracing::debug;

use crate::conversation::Conversation;

/// Unread counters plus the batching rule for read acknowledgements.
///
/// Counters come from two sources: optimistic local updates and the periodic
/// pull from the service. The last write wins, so a pull may briefly undo an
/// optimistic zero until the service has processed the acknowledgement.
#[derive(Debug, Default)]
pub struct ReadReceiptCoordinator {
    unread: HashMap<Username, u32>,
}

impl ReadReceiptCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one batched acknowledgement for every unread peer message and
    /// zeroes the peer's counter.
    pub fn acknowledge(&mut self, owner: &Username, conversation: &Conversation) -> Option<MarkAsRead> {
        let message_ids = conversation.unread_from_peer();
        if message_ids.is_empty() {
            return None;
        }
        let peer = conversation.peer().clone();
        debug!(peer = %peer, count = message_ids.len(), "read receipts: acknowledging");
        self.unread.insert(peer.clone(), 0);
        Some(MarkAsRead {
            message_ids,
            sender: peer,
            receiver: owner.clone(),
        })
    }

    pub fn increment(&mut self, peer: &Username) -> u32 {
        let count = self.unread.entry(peer.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn apply_polled(&mut self, counts: UnreadCounts) {
        self.unread = counts.into_iter().collect();
    }

    pub fn count(&self, peer: &Username) -> u32 {
        self.unread.get(peer).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> &HashMap<Username, u32> {
        &self.unread
    }

    pub fn clear(&mut self) {
        self.unread.clear();
    }
}

#[cfg(test)]
#[path = "tests/read_receipts_tests.rs"]
mod tests;
