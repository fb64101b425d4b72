//! Seams to the managed backend. The relational store, its row-level
//! authorization, and the realtime transport are external collaborators;
//! the sync core only depends on these interfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{error::ClientResult, message::Message};

/// Broadcast topic carrying "message created" previews for one channel.
pub fn message_topic(channel_id: &Uuid) -> String {
    format!("channel:{}", channel_id)
}

/// Broadcast topic carrying typing signals for one channel.
pub fn typing_topic(channel_id: &Uuid) -> String {
    format!("channel:{}:typing", channel_id)
}

/// Event fanned out on a broadcast topic. Wire format matches the managed
/// transport's JSON payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// Lightweight preview of a freshly created message. Not inserted into
    /// the store directly; subscribers refetch the canonical row by id.
    Message(MessagePreview),
    Typing(TypingSignal),
}

impl BroadcastEvent {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("broadcast event serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub message_id: Uuid,
    pub channel_id: Uuid,
    pub content: String,
    pub user_id: Option<Uuid>,
    pub username: SmolStr,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub username: SmolStr,
    pub is_typing: bool,
}

/// Filtered, ordered, limited selection over the message rows, with
/// cursor-style range predicates and joined profile fetch. Authorization is
/// the store's concern (row-level policies); a denied call surfaces as
/// [`crate::error::ClientError::NotAMember`].
#[allow(async_fn_in_trait)]
pub trait RowStore {
    /// The most recent `limit` messages of a channel, newest first.
    async fn recent_messages(&self, channel_id: Uuid, limit: usize) -> ClientResult<Vec<Message>>;

    /// Up to `limit` messages strictly older than `before`, newest first.
    async fn messages_before(
        &self,
        channel_id: Uuid,
        before: DateTime<Utc>,
        limit: usize,
    ) -> ClientResult<Vec<Message>>;

    /// Canonical row by id, joined with the author's profile snapshot.
    async fn message_by_id(&self, message_id: Uuid) -> ClientResult<Option<Message>>;

    /// Persist a message with a store-assigned id and timestamp and return
    /// the joined row. As a side effect the store publishes a
    /// [`BroadcastEvent::Message`] preview on the channel's topic; the
    /// sender is not excluded from that fan-out.
    async fn create_message(
        &self,
        channel_id: Uuid,
        author: Uuid,
        content: &str,
    ) -> ClientResult<Message>;

    /// Display profile for a user, if one exists.
    async fn profile(&self, user_id: Uuid) -> ClientResult<Option<crate::message::Profile>>;
}

/// Per-resource pub/sub fan-out. At-least-once, no ordering across topics,
/// no replay across reconnects; a client that was offline relies on a
/// history reload instead.
#[allow(async_fn_in_trait)]
pub trait Broadcast {
    async fn publish(&self, topic: &str, event: BroadcastEvent) -> ClientResult<()>;

    /// Lease the topic for the lifetime of the returned [`Subscription`].
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// A leased broadcast topic. Dropping the subscription closes its receiver,
/// which is the release signal the transport prunes on; no events are
/// delivered to a stale channel view after teardown.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<BroadcastEvent>,
}

impl Subscription {
    pub fn new(topic: String, receiver: mpsc::UnboundedReceiver<BroadcastEvent>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next event; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.receiver.try_recv().ok()
    }
}
