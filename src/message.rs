use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use crate::IndexMap;

pub type Messages = IndexMap<MessageId, Message>;

/// Identity of a message as the client sees it.
///
/// `Ack` carries the identifier the row store assigned at creation time.
/// `Unack` is a random echo id given to an optimistic entry before the
/// create request resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageId {
    Ack(Uuid),
    Unack(u64),
}

impl MessageId {
    pub fn is_ack(&self) -> bool {
        matches!(self, MessageId::Ack(_))
    }

    pub fn echo_id(&self) -> Option<u64> {
        match self {
            MessageId::Unack(echo) => Some(*echo),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<Uuid> {
        match self {
            MessageId::Ack(id) => Some(*id),
            _ => None,
        }
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::Unack(rand::thread_rng().gen())
    }
}

/// Denormalized snapshot of an author's display profile, captured when the
/// row was fetched. Not kept in sync with later profile edits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: SmolStr,
    pub display_name: Option<SmolStr>,
    pub avatar_url: Option<SmolStr>,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.username.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: Uuid,
    /// `None` for AI-authored rows.
    pub author: Option<Uuid>,
    pub content: String,
    pub is_ai: bool,
    /// Backfilled after creation; the only mutation besides content edits.
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub profile: Profile,
    /// Set on an optimistic entry whose create request failed. The entry is
    /// kept visible and marked, never silently retracted.
    pub failed_to_send: bool,
}

impl Default for Message {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::default(),
            channel_id: Uuid::nil(),
            author: None,
            content: String::new(),
            is_ai: false,
            embedding: None,
            created_at: now,
            updated_at: now,
            profile: Profile::default(),
            failed_to_send: false,
        }
    }
}

impl Message {
    /// Build an optimistic entry for text the current user just submitted.
    /// The caller is expected to have validated and trimmed the content.
    pub fn optimistic(channel_id: Uuid, author: Uuid, profile: Profile, content: String) -> Self {
        Self {
            channel_id,
            author: Some(author),
            content,
            profile,
            ..Default::default()
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    /// Merge fields from the canonical row into this entry.
    fn merge_from(&mut self, canonical: Message) {
        self.content = canonical.content;
        self.author = canonical.author;
        self.is_ai = canonical.is_ai;
        self.created_at = canonical.created_at;
        self.updated_at = canonical.updated_at;
        self.profile = canonical.profile;
        if canonical.embedding.is_some() {
            self.embedding = canonical.embedding;
        }
        self.failed_to_send = false;
    }
}

/// The per-channel window of messages currently materialized in memory.
///
/// Invariants: no duplicate identifiers; entries ordered by creation
/// timestamp ascending, ties broken by identifier. All mutating operations
/// preserve both, so out-of-order network arrivals cannot corrupt the
/// sequence.
#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    messages: Messages,
}

impl MessageWindow {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.messages.values()
    }

    /// The oldest currently-held message, the cursor for backward pages.
    pub fn oldest(&self) -> Option<&Message> {
        self.messages.get_index(0).map(|(_, msg)| msg)
    }

    pub fn newest(&self) -> Option<&Message> {
        let len = self.messages.len();
        len.checked_sub(1)
            .and_then(|index| self.messages.get_index(index))
            .map(|(_, msg)| msg)
    }

    /// Replace the whole window. The list must already be ordered oldest
    /// first; duplicates collapse onto the last occurrence.
    pub fn set_all(&mut self, messages: Vec<Message>) {
        self.messages = messages.into_iter().map(|msg| (msg.id, msg)).collect();
    }

    /// Insert one message at its ordered position. Idempotent: a message
    /// whose identifier is already present merges into the existing entry
    /// instead of creating a duplicate. Returns whether a new entry was
    /// created.
    pub fn insert(&mut self, message: Message) -> bool {
        if let Some(existing) = self.messages.get_mut(&message.id) {
            existing.merge_from(message);
            return false;
        }

        let key = message.sort_key();
        let pos = self
            .messages
            .values()
            .position(|held| held.sort_key() > key)
            .unwrap_or(self.messages.len());
        let appended = self.messages.len();
        self.messages.insert(message.id, message);
        if pos < appended {
            self.messages.move_index(appended, pos);
        }
        true
    }

    /// Promote an optimistic entry to its canonical identity once the create
    /// response (or a matching broadcast refetch) resolves. The unacked
    /// entry is removed and the canonical row takes its ordered position; if
    /// the canonical id is already held the duplicate is simply dropped.
    pub fn ack(&mut self, unack_id: MessageId, canonical: Message) {
        self.messages.shift_remove(&unack_id);
        self.insert(canonical);
    }

    /// Find an optimistic entry matching the business key used for
    /// reconciliation: same author, same content, not yet acked.
    pub fn find_unacked(&self, author: Option<Uuid>, content: &str) -> Option<MessageId> {
        self.messages
            .values()
            .find(|msg| !msg.id.is_ack() && msg.author == author && msg.content == content)
            .map(|msg| msg.id)
    }

    /// Prepend a page of strictly older messages (ordered oldest first).
    /// Already-held identifiers are skipped; visible entries are never
    /// replaced.
    pub fn prepend(&mut self, older: Vec<Message>) {
        let mut merged: Messages = older
            .into_iter()
            .filter(|msg| !self.messages.contains_key(&msg.id))
            .map(|msg| (msg.id, msg))
            .collect();
        merged.extend(self.messages.drain(..));
        self.messages = merged;
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        self.messages.shift_remove(id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
