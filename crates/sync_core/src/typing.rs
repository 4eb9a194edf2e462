use std::{collections::HashMap, time::Duration};

use shared::domain::UserId;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingState {
    pub user_id: UserId,
    pub display_name: Option<String>,
    pub last_seen: Instant,
}

/// Remote typing indicators keyed by user. Expiry is evaluated lazily on read, so
/// no sweep timer runs per conversation.
#[derive(Debug)]
pub struct TypingTable {
    ttl: Duration,
    entries: HashMap<UserId, TypingState>,
}

impl TypingTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Inserts or refreshes an entry; returns true when the user was not already
    /// shown as typing.
    pub fn refresh(&mut self, user_id: UserId, display_name: Option<String>, now: Instant) -> bool {
        let was_active = self
            .entries
            .get(&user_id)
            .is_some_and(|state| now.duration_since(state.last_seen) < self.ttl);
        let display_name = display_name.or_else(|| {
            self.entries
                .get(&user_id)
                .and_then(|state| state.display_name.clone())
        });
        self.entries.insert(
            user_id,
            TypingState {
                user_id,
                display_name,
                last_seen: now,
            },
        );
        !was_active
    }

    pub fn remove(&mut self, user_id: UserId) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Drops expired entries and returns the rest ordered by user id.
    pub fn active(&mut self, now: Instant) -> Vec<TypingState> {
        let ttl = self.ttl;
        self.entries
            .retain(|_, state| now.duration_since(state.last_seen) < ttl);
        let mut active: Vec<_> = self.entries.values().cloned().collect();
        active.sort_by_key(|state| state.user_id);
        active
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeystrokeAction {
    pub send_start: bool,
    /// Identifies the idle timer armed for this keystroke.
    pub generation: u64,
}

/// Local typing debounce: `typing.start` on the first keystroke, re-sent once half
/// the remote TTL has passed, and `typing.stop` after the idle timeout with no
/// further keystrokes.
#[derive(Debug)]
pub struct LocalTyping {
    idle_timeout: Duration,
    refresh_after: Duration,
    last_start: Option<Instant>,
    generation: u64,
}

impl LocalTyping {
    pub fn new(idle_timeout: Duration, remote_ttl: Duration) -> Self {
        Self {
            idle_timeout,
            refresh_after: remote_ttl / 2,
            last_start: None,
            generation: 0,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_typing(&self) -> bool {
        self.last_start.is_some()
    }

    pub fn on_keystroke(&mut self, now: Instant) -> KeystrokeAction {
        let send_start = self
            .last_start
            .map_or(true, |at| now.duration_since(at) >= self.refresh_after);
        if send_start {
            self.last_start = Some(now);
        }
        self.generation += 1;
        KeystrokeAction {
            send_start,
            generation: self.generation,
        }
    }

    /// Idle timer fired. Returns whether `typing.stop` should be sent; timers armed by
    /// an earlier keystroke are ignored.
    pub fn on_idle(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.last_start.take().is_some()
    }

    /// Immediate stop, e.g. when the message is sent.
    pub fn stop(&mut self) -> bool {
        self.generation += 1;
        self.last_start.take().is_some()
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
