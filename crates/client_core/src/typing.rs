use std::collections::HashMap;

use shared::{domain::Username, protocol::TypingSignal};

/// Typing indicators in both directions.
///
/// Outbound debouncing is generation based: every keystroke stamps the peer
/// with a fresh generation and only the timer carrying the latest generation
/// may retract the indicator.
#[derive(Debug, Default)]
pub struct TypingTracker {
    remote: HashMap<Username, bool>,
    local: HashMap<Username, u64>,
    next_generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keystroke {
    /// `typing=true`, only present when the peer was not already marked as typing.
    pub signal: Option<TypingSignal>,
    pub generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keystroke(&mut self, peer: &Username) -> Keystroke {
        self.next_generation += 1;
        let generation = self.next_generation;
        let was_typing = self.local.insert(peer.clone(), generation).is_some();
        Keystroke {
            signal: (!was_typing).then(|| TypingSignal {
                is_typing: true,
                to: peer.clone(),
            }),
            generation,
        }
    }

    pub fn expire(&mut self, peer: &Username, generation: u64) -> Option<TypingSignal> {
        if self.local.get(peer) != Some(&generation) {
            return None;
        }
        self.local.remove(peer);
        Some(TypingSignal {
            is_typing: false,
            to: peer.clone(),
        })
    }

    /// Retracts the local indicator right away, e.g. after a send.
    pub fn stop(&mut self, peer: &Username) -> Option<TypingSignal> {
        self.local.remove(peer).map(|_| TypingSignal {
            is_typing: false,
            to: peer.clone(),
        })
    }

    /// Returns `true` when the stored value changed.
    pub fn set_remote(&mut self, from: &Username, is_typing: bool) -> bool {
        self.remote.insert(from.clone(), is_typing) != Some(is_typing)
    }

    pub fn is_peer_typing(&self, peer: &Username) -> bool {
        self.remote.get(peer).copied().unwrap_or(false)
    }

    pub fn reset(&mut self) {
        self.remote.clear();
        self.local.clear();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
