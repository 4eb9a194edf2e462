use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, ReactionId, UserId},
    protocol::{MessagePayload, Reaction},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub reactions: Vec<Reaction>,
    pub delivery: Delivery,
}

impl Message {
    fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    fn has_pending_reactions(&self) -> bool {
        self.reactions.iter().any(|reaction| reaction.id.is_sentinel())
    }
}

impl From<MessagePayload> for Message {
    fn from(payload: MessagePayload) -> Self {
        Self {
            id: payload.id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            content: payload.content,
            media_url: payload.media_url,
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            deleted: payload.is_deleted,
            reactions: payload.reactions,
            delivery: Delivery::Confirmed,
        }
    }
}

/// A local send that has not been confirmed yet.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { index: usize },
    Replaced { index: usize },
    /// The entry already held exactly this state; observers need no update.
    Unchanged,
    /// The change referred to something this store does not hold.
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted { .. } | Self::Replaced { .. })
    }
}

/// Ordered message collection for one open conversation.
///
/// Entries are kept sorted by `(created_at, id)` on insertion; replacements keep
/// their slot so a confirmed send stays where its placeholder was shown. Every
/// method is one synchronous mutation, so a caller holding the store exclusively
/// never exposes a half-applied merge.
#[derive(Debug)]
pub struct MessageStore {
    entries: Vec<Message>,
    index: HashMap<MessageId, usize>,
    /// Sentinels that a push copy replaced before their send resolved.
    absorbed: HashMap<MessageId, MessageId>,
    /// Ids the server has reported deleted. A local rollback never revives these.
    remote_deleted: HashSet<MessageId>,
    next_sentinel: i64,
    next_reaction_sentinel: i64,
    reconcile_window: chrono::Duration,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl MessageStore {
    pub fn new(reconcile_window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            absorbed: HashMap::new(),
            remote_deleted: HashSet::new(),
            next_sentinel: -1,
            next_reaction_sentinel: -1,
            reconcile_window: chrono::Duration::from_std(reconcile_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(120)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.index.get(&id).map(|&i| &self.entries[i])
    }

    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// Newest confirmed creation time, used as the read watermark.
    pub fn latest_confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .rev()
            .find(|message| message.delivery == Delivery::Confirmed)
            .map(|message| message.created_at)
    }

    /// Merges a server-confirmed message. Keyed strictly on identity, so replaying
    /// the same message is a no-op.
    pub fn apply_remote(&mut self, incoming: Message) -> MergeOutcome {
        if incoming.deleted {
            self.remote_deleted.insert(incoming.id);
        }
        if let Some(&i) = self.index.get(&incoming.id) {
            let merged = merge_remote(&self.entries[i], incoming);
            if merged == self.entries[i] {
                return MergeOutcome::Unchanged;
            }
            self.entries[i] = merged;
            return MergeOutcome::Replaced { index: i };
        }

        if let Some(i) = self.find_matching_sentinel(&incoming) {
            let sentinel = self.entries[i].id;
            self.index.remove(&sentinel);
            self.absorbed.insert(sentinel, incoming.id);
            self.index.insert(incoming.id, i);
            self.entries[i] = Message {
                delivery: Delivery::Confirmed,
                ..incoming
            };
            return MergeOutcome::Replaced { index: i };
        }

        let incoming = Message {
            delivery: Delivery::Confirmed,
            ..incoming
        };
        MergeOutcome::Inserted {
            index: self.insert_sorted(incoming),
        }
    }

    /// Soft-deletes a message. Deletions for unknown ids are dropped rather than
    /// creating a tombstone.
    pub fn apply_remote_deletion(&mut self, id: MessageId) -> MergeOutcome {
        let Some(&i) = self.index.get(&id) else {
            return MergeOutcome::Ignored;
        };
        self.remote_deleted.insert(id);
        if self.entries[i].deleted {
            return MergeOutcome::Unchanged;
        }
        self.entries[i].deleted = true;
        MergeOutcome::Replaced { index: i }
    }

    /// Inserts a local send under a fresh sentinel id and returns that id.
    pub fn apply_optimistic(&mut self, pending: PendingMessage) -> MessageId {
        let id = MessageId(self.next_sentinel);
        self.next_sentinel -= 1;
        self.insert_sorted(Message {
            id,
            conversation_id: pending.conversation_id,
            sender_id: pending.sender_id,
            sender_name: pending.sender_name,
            content: pending.content,
            media_url: pending.media_url,
            created_at: pending.submitted_at,
            edited_at: None,
            deleted: false,
            reactions: Vec::new(),
            delivery: Delivery::Pending,
        });
        id
    }

    /// Swaps a sentinel for its confirmed message in place. When the confirmed copy
    /// already arrived through push, the sentinel is dropped instead so the message
    /// is listed exactly once.
    pub fn resolve_optimistic(&mut self, sentinel: MessageId, confirmed: Message) -> MergeOutcome {
        let Some(&i) = self.index.get(&sentinel) else {
            self.absorbed.remove(&sentinel);
            return self.apply_remote(confirmed);
        };

        if self.index.contains_key(&confirmed.id) {
            self.remove_at(i);
            return match self.apply_remote(confirmed.clone()) {
                MergeOutcome::Unchanged => MergeOutcome::Replaced {
                    index: self.index[&confirmed.id],
                },
                outcome => outcome,
            };
        }

        self.index.remove(&sentinel);
        self.index.insert(confirmed.id, i);
        self.entries[i] = Message {
            delivery: Delivery::Confirmed,
            ..confirmed
        };
        MergeOutcome::Replaced { index: i }
    }

    pub fn fail_optimistic(&mut self, sentinel: MessageId) -> MergeOutcome {
        let Some(&i) = self.index.get(&sentinel) else {
            return MergeOutcome::Ignored;
        };
        if self.entries[i].delivery == Delivery::Failed {
            return MergeOutcome::Unchanged;
        }
        self.entries[i].delivery = Delivery::Failed;
        MergeOutcome::Replaced { index: i }
    }

    /// Removes an unconfirmed entry. Confirmed messages are never removed.
    pub fn discard(&mut self, sentinel: MessageId) -> Option<Message> {
        if !sentinel.is_sentinel() {
            return None;
        }
        let i = self.position(sentinel)?;
        Some(self.remove_at(i))
    }

    /// Applies a local edit and returns the pre-edit snapshot for rollback.
    pub fn apply_local_edit(
        &mut self,
        id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    ) -> Option<Message> {
        let i = self.position(id)?;
        let snapshot = self.entries[i].clone();
        self.entries[i].content = Some(content);
        self.entries[i].edited_at = Some(edited_at);
        Some(snapshot)
    }

    pub fn apply_local_deletion(&mut self, id: MessageId) -> Option<Message> {
        let i = self.position(id)?;
        let snapshot = self.entries[i].clone();
        self.entries[i].deleted = true;
        Some(snapshot)
    }

    /// Takes back a local edit stamped `applied_at`. Only content and edit time are
    /// reverted, and only while no remote edit has replaced them since; everything
    /// else that merged in the meantime stays, a deletion included.
    pub fn revert_edit(&mut self, snapshot: &Message, applied_at: DateTime<Utc>) -> MergeOutcome {
        let Some(&i) = self.index.get(&snapshot.id) else {
            return MergeOutcome::Ignored;
        };
        let entry = &mut self.entries[i];
        if entry.edited_at != Some(applied_at) {
            return MergeOutcome::Unchanged;
        }
        entry.content = snapshot.content.clone();
        entry.edited_at = snapshot.edited_at;
        MergeOutcome::Replaced { index: i }
    }

    /// Takes back a local deletion unless the server has deleted the message as well.
    pub fn revert_deletion(&mut self, snapshot: &Message) -> MergeOutcome {
        let Some(&i) = self.index.get(&snapshot.id) else {
            return MergeOutcome::Ignored;
        };
        let deleted = snapshot.deleted || self.remote_deleted.contains(&snapshot.id);
        if self.entries[i].deleted == deleted {
            return MergeOutcome::Unchanged;
        }
        self.entries[i].deleted = deleted;
        MergeOutcome::Replaced { index: i }
    }

    pub fn reactions(&self, id: MessageId) -> Option<&[Reaction]> {
        self.get(id).map(|message| message.reactions.as_slice())
    }

    pub fn next_reaction_sentinel(&mut self) -> ReactionId {
        let id = ReactionId(self.next_reaction_sentinel);
        self.next_reaction_sentinel -= 1;
        id
    }

    pub fn replace_reactions(&mut self, id: MessageId, reactions: Vec<Reaction>) -> MergeOutcome {
        let Some(&i) = self.index.get(&id) else {
            return MergeOutcome::Ignored;
        };
        if self.entries[i].reactions == reactions {
            return MergeOutcome::Unchanged;
        }
        self.entries[i].reactions = reactions;
        MergeOutcome::Replaced { index: i }
    }

    /// Inserts a reaction, displacing any other reaction by the same user on that
    /// message.
    pub fn apply_remote_reaction(&mut self, reaction: Reaction) -> MergeOutcome {
        let Some(&i) = self.index.get(&reaction.message_id) else {
            return MergeOutcome::Ignored;
        };
        let reactions = &mut self.entries[i].reactions;
        if reactions.iter().any(|existing| existing == &reaction) {
            return MergeOutcome::Unchanged;
        }
        reactions.retain(|existing| existing.user_id != reaction.user_id);
        reactions.push(reaction);
        MergeOutcome::Replaced { index: i }
    }

    pub fn remove_remote_reaction(
        &mut self,
        message_id: MessageId,
        reaction_id: ReactionId,
    ) -> MergeOutcome {
        let Some(&i) = self.index.get(&message_id) else {
            return MergeOutcome::Ignored;
        };
        let reactions = &mut self.entries[i].reactions;
        let before = reactions.len();
        reactions.retain(|existing| existing.id != reaction_id);
        if reactions.len() == before {
            return MergeOutcome::Unchanged;
        }
        MergeOutcome::Replaced { index: i }
    }

    /// Replaces an optimistic reaction with the server's copy.
    pub fn confirm_reaction(
        &mut self,
        message_id: MessageId,
        sentinel: ReactionId,
        confirmed: Reaction,
    ) -> MergeOutcome {
        let Some(&i) = self.index.get(&message_id) else {
            return MergeOutcome::Ignored;
        };
        let reactions = &mut self.entries[i].reactions;
        let user_id = confirmed.user_id;
        match reactions.iter().position(|existing| existing.id == sentinel) {
            Some(slot) => {
                reactions[slot] = confirmed;
                let mut position = 0;
                reactions.retain(|existing| {
                    let keep = position == slot || existing.user_id != user_id;
                    position += 1;
                    keep
                });
            }
            None => {
                // A push copy displaced the sentinel first.
                if reactions.contains(&confirmed) {
                    return MergeOutcome::Unchanged;
                }
                reactions.retain(|existing| existing.user_id != user_id);
                reactions.push(confirmed);
            }
        }
        MergeOutcome::Replaced { index: i }
    }

    /// Oldest pending sentinel with the same sender, content and (if attached) media,
    /// submitted within the reconcile window of the incoming timestamp.
    fn find_matching_sentinel(&self, incoming: &Message) -> Option<usize> {
        self.entries.iter().position(|candidate| {
            candidate.id.is_sentinel()
                && candidate.delivery == Delivery::Pending
                && candidate.sender_id == incoming.sender_id
                && candidate.content == incoming.content
                && (candidate.media_url.is_none() || candidate.media_url == incoming.media_url)
                && (candidate.created_at - incoming.created_at).abs() <= self.reconcile_window
        })
    }

    fn insert_sorted(&mut self, message: Message) -> usize {
        let key = message.sort_key();
        let i = self.entries.partition_point(|existing| existing.sort_key() <= key);
        self.entries.insert(i, message);
        self.reindex_from(i);
        i
    }

    fn remove_at(&mut self, i: usize) -> Message {
        let removed = self.entries.remove(i);
        self.index.remove(&removed.id);
        self.reindex_from(i);
        removed
    }

    fn reindex_from(&mut self, start: usize) {
        for (i, message) in self.entries.iter().enumerate().skip(start) {
            self.index.insert(message.id, i);
        }
    }
}

/// Last-write-wins on content and edit time; an older payload never rolls an edit
/// back, and a deletion is never undone.
fn merge_remote(existing: &Message, incoming: Message) -> Message {
    let stale = incoming.edited_at < existing.edited_at;
    let mut merged = if stale {
        Message {
            reactions: incoming.reactions,
            ..existing.clone()
        }
    } else {
        incoming
    };
    merged.deleted = existing.deleted || merged.deleted;
    if existing.has_pending_reactions() {
        merged.reactions = existing.reactions.clone();
    }
    merged.delivery = Delivery::Confirmed;
    merged
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
