//! Client-side message synchronization core for Chorus.
//!
//! Async work (history fetches, sends, broadcast forwarding) is done by
//! [`Client`] methods, which push [`FetchEvent`]s into an unbounded channel.
//! The [`Cache`] drains that channel from the UI thread, applies each event
//! to per-channel state, and emits [`PostProcessEvent`]s for follow-up
//! fetches the driver runs through [`Client::process_post`].

pub mod backend;
pub mod channel;
pub mod content;
pub mod error;
pub mod member;
pub mod message;
pub mod scroll;
pub mod server;
pub mod typing;
pub mod validation;

pub use ahash::{AHashMap, AHashSet};
pub use chrono;
pub use smol_str;
pub use tracing;
pub use uuid;

use std::fmt::{self, Debug, Display, Formatter};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

use backend::{
    message_topic, typing_topic, Broadcast, BroadcastEvent, RowStore, Subscription, TypingSignal,
};
use channel::{Channel, Channels};
use error::{ClientError, ClientResult};
use member::{Member, Members};
use message::{Message, MessageId, Profile};
use scroll::ScrollState;
use server::{Server, Servers};
use typing::TYPING_TIMEOUT;

pub type IndexMap<K, V> = indexmap::IndexMap<K, V, ahash::RandomState>;

pub type EventSender = tokio::sync::mpsc::UnboundedSender<FetchEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<FetchEvent>;
pub type PostEventSender = tokio::sync::mpsc::UnboundedSender<PostProcessEvent>;
pub type PostEventReceiver = tokio::sync::mpsc::UnboundedReceiver<PostProcessEvent>;

/// Page size for history loads, both the initial window and backward pages.
pub const HISTORY_PAGE_SIZE: usize = 50;

#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Session {
    pub session_token: SmolStr,
    pub user_id: Uuid,
    pub username: SmolStr,
    pub endpoint: SmolStr,
}

impl Debug for Session {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Display for Session {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{} on {}", self.username, self.endpoint)
    }
}

/// Follow-up work the cache asks the driver to perform.
#[derive(Debug, Clone)]
pub enum PostProcessEvent {
    /// Refetch the canonical row announced by a broadcast preview.
    FetchMessage { channel_id: Uuid, message_id: Uuid },
    /// Fetch the profile of an author we have no cached member for.
    FetchProfile(Uuid),
}

/// State changes flowing from async work into the cache.
#[derive(Debug)]
pub enum FetchEvent {
    InitialMessages {
        channel_id: Uuid,
        /// Ordered oldest first.
        messages: Vec<Message>,
    },
    HistoryChunk {
        channel_id: Uuid,
        /// Ordered oldest first, all strictly older than the window.
        messages: Vec<Message>,
        reached_top: bool,
    },
    /// A create request resolved; `echo_id` names the optimistic entry to
    /// promote.
    MessageSent {
        channel_id: Uuid,
        echo_id: Option<u64>,
        message: Message,
    },
    /// Canonical row fetched after a broadcast preview.
    FetchedMessage { channel_id: Uuid, message: Message },
    Broadcast(BroadcastEvent),
    MessageEdited {
        channel_id: Uuid,
        message_id: Uuid,
        new_content: String,
        updated_at: DateTime<Utc>,
    },
    EmbeddingBackfilled {
        channel_id: Uuid,
        message_id: Uuid,
        embedding: Vec<f32>,
    },
    MessageDeleted {
        channel_id: Uuid,
        message_id: MessageId,
    },
    ChannelCreated {
        server_id: Uuid,
        channel_id: Uuid,
        name: SmolStr,
        description: Option<String>,
    },
    ChannelDeleted { channel_id: Uuid },
    ServerAdded {
        server_id: Uuid,
        name: SmolStr,
        owner_id: Uuid,
        invite_code: SmolStr,
    },
    ProfileUpdated {
        user_id: Uuid,
        profile: Profile,
        is_ai: bool,
    },
    FailedToSendMessage { channel_id: Uuid, echo_id: u64 },
}

/// Single-writer client state. Owns every channel's message window; applied
/// events come from one receiver, so arrival order is apply order.
pub struct Cache {
    current_user: Uuid,
    servers: Servers,
    channels: Channels,
    members: Members,
    event_receiver: EventReceiver,
    post_sender: PostEventSender,
}

impl Debug for Cache {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.debug_struct("Cache")
            .field("current_user", &self.current_user)
            .field("servers", &self.servers.len())
            .field("channels", &self.channels.len())
            .field("members", &self.members.len())
            .finish()
    }
}

impl Cache {
    pub fn new(
        current_user: Uuid,
        event_receiver: EventReceiver,
        post_sender: PostEventSender,
    ) -> Self {
        Self {
            current_user,
            servers: Servers::default(),
            channels: Channels::default(),
            members: Members::default(),
            event_receiver,
            post_sender,
        }
    }

    /// Called once per frame / tick: expire stale typing entries, then drain
    /// and apply all pending events in arrival order.
    pub fn maintain(&mut self) {
        for channel in self.channels.values_mut() {
            channel.typing.expire(TYPING_TIMEOUT);
        }

        while let Ok(event) = self.event_receiver.try_recv() {
            self.process_event(event);
        }
    }

    pub fn current_user(&self) -> Uuid {
        self.current_user
    }

    pub fn servers(&self) -> &Servers {
        &self.servers
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn members(&self) -> &Members {
        &self.members
    }

    pub fn get_server(&self, server_id: &Uuid) -> Option<&Server> {
        self.servers.get(server_id)
    }

    pub fn get_channel(&self, channel_id: &Uuid) -> Option<&Channel> {
        self.channels.get(channel_id)
    }

    pub fn get_channel_mut(&mut self, channel_id: Uuid) -> &mut Channel {
        self.channels.entry(channel_id).or_default()
    }

    pub fn get_member(&self, user_id: &Uuid) -> Option<&Member> {
        self.members.get(user_id)
    }

    /// Replace a channel's window wholesale. `messages` must be ordered
    /// oldest first.
    pub fn set_messages(&mut self, channel_id: Uuid, messages: Vec<Message>) {
        self.get_channel_mut(channel_id).messages.set_all(messages);
    }

    /// Insert one message at its ordered position; idempotent by id.
    /// Returns whether a new entry was created.
    pub fn add_message(&mut self, channel_id: Uuid, message: Message) -> bool {
        self.get_channel_mut(channel_id).messages.insert(message)
    }

    pub fn update_message(
        &mut self,
        channel_id: Uuid,
        id: &MessageId,
        update: impl FnOnce(&mut Message),
    ) -> bool {
        match self
            .channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.messages.get_mut(id))
        {
            Some(message) => {
                update(message);
                true
            }
            None => false,
        }
    }

    pub fn delete_message(&mut self, channel_id: Uuid, id: &MessageId) -> Option<Message> {
        self.channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.messages.remove(id))
    }

    /// Drop a channel's materialized window and ephemeral state, keeping its
    /// metadata. Other channels are untouched.
    pub fn clear_channel(&mut self, channel_id: &Uuid) {
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.reset_window();
        }
    }

    /// Insert the optimistic entry for text the current user just submitted
    /// and hand back its echo id. Content is validated and trimmed here,
    /// before any network call.
    pub fn prepare_send_message(&mut self, channel_id: Uuid, content: &str) -> ClientResult<u64> {
        validation::validate_message_content(content).map_err(ClientError::Validation)?;

        let author = self.current_user;
        let profile = self
            .members
            .get(&author)
            .map(Member::profile)
            .unwrap_or_default();
        let echo_id = rand::thread_rng().gen();
        let mut message =
            Message::optimistic(channel_id, author, profile, content.trim().to_string());
        message.id = MessageId::Unack(echo_id);

        self.get_channel_mut(channel_id).messages.insert(message);
        Ok(echo_id)
    }

    /// Arm the in-flight guard for a backward page and return its cursor,
    /// or `None` when a fetch is already running, the top was reached, or
    /// the window is empty.
    pub fn begin_history_fetch(&mut self, channel_id: Uuid) -> Option<DateTime<Utc>> {
        let channel = self.get_channel_mut(channel_id);
        if channel.loading_history || channel.reached_top {
            return None;
        }
        let before = channel.messages.oldest()?.created_at;
        channel.loading_history = true;
        Some(before)
    }

    /// Arm the guard for the initial page; `false` when one is in flight.
    pub fn begin_initial_fetch(&mut self, channel_id: Uuid) -> bool {
        let channel = self.get_channel_mut(channel_id);
        if channel.init_fetching {
            return false;
        }
        channel.init_fetching = true;
        true
    }

    /// Whether the scroll position asks for a backward page right now.
    pub fn should_fetch_older(&self, channel_id: &Uuid, scroll: &ScrollState) -> bool {
        scroll.is_at_top()
            && self.channels.get(channel_id).map_or(false, |channel| {
                channel.has_more_history()
                    && !channel.loading_history
                    && !channel.messages.is_empty()
            })
    }

    pub fn process_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::InitialMessages {
                channel_id,
                messages,
            } => {
                self.request_missing_profiles(&messages);
                let reached_top = messages.len() < HISTORY_PAGE_SIZE;
                let channel = self.get_channel_mut(channel_id);
                channel.init_fetching = false;
                channel.reached_top = reached_top;
                channel.messages.set_all(messages);
            }
            FetchEvent::HistoryChunk {
                channel_id,
                messages,
                reached_top,
            } => {
                self.request_missing_profiles(&messages);
                let channel = self.get_channel_mut(channel_id);
                channel.loading_history = false;
                if reached_top {
                    channel.reached_top = true;
                }
                channel.messages.prepend(messages);
            }
            FetchEvent::MessageSent {
                channel_id,
                echo_id,
                message,
            } => {
                let window = &mut self.get_channel_mut(channel_id).messages;
                match echo_id {
                    Some(echo) => window.ack(MessageId::Unack(echo), message),
                    None => {
                        window.insert(message);
                    }
                }
            }
            FetchEvent::FetchedMessage {
                channel_id,
                message,
            } => {
                self.request_missing_profiles(std::slice::from_ref(&message));
                let window = &mut self.get_channel_mut(channel_id).messages;
                // An optimistic entry for the same author and content is the
                // same message seen through the echo path; promote it rather
                // than showing it twice.
                match window.find_unacked(message.author, &message.content) {
                    Some(unack) if !window.contains(&message.id) => window.ack(unack, message),
                    _ => {
                        window.insert(message);
                    }
                }
            }
            FetchEvent::Broadcast(event) => self.process_broadcast(event),
            FetchEvent::MessageEdited {
                channel_id,
                message_id,
                new_content,
                updated_at,
            } => {
                self.update_message(channel_id, &MessageId::Ack(message_id), |message| {
                    message.content = new_content;
                    message.updated_at = updated_at;
                });
            }
            FetchEvent::EmbeddingBackfilled {
                channel_id,
                message_id,
                embedding,
            } => {
                self.update_message(channel_id, &MessageId::Ack(message_id), |message| {
                    message.embedding = Some(embedding);
                });
            }
            FetchEvent::MessageDeleted {
                channel_id,
                message_id,
            } => {
                self.delete_message(channel_id, &message_id);
            }
            FetchEvent::ChannelCreated {
                server_id,
                channel_id,
                name,
                description,
            } => {
                let channel = self.get_channel_mut(channel_id);
                channel.name = name;
                channel.server_id = server_id;
                channel.description = description;

                let server = self.servers.entry(server_id).or_default();
                if !server.channels.contains(&channel_id) {
                    server.channels.push(channel_id);
                }
            }
            FetchEvent::ChannelDeleted { channel_id } => {
                // Dropping the channel drops its window and typing set with it.
                if let Some(channel) = self.channels.shift_remove(&channel_id) {
                    if let Some(server) = self.servers.get_mut(&channel.server_id) {
                        server.channels.retain(|id| *id != channel_id);
                    }
                }
            }
            FetchEvent::ServerAdded {
                server_id,
                name,
                owner_id,
                invite_code,
            } => {
                let server = self.servers.entry(server_id).or_default();
                server.name = name;
                server.owner_id = owner_id;
                server.invite_code = invite_code;
                server.members.insert(owner_id);
                server.fetched = true;
            }
            FetchEvent::ProfileUpdated {
                user_id,
                profile,
                is_ai,
            } => {
                let member = self.members.entry(user_id).or_default();
                member.username = profile.username;
                member.display_name = profile.display_name;
                member.avatar_url = profile.avatar_url;
                member.is_ai = is_ai;
                member.fetched = true;
            }
            FetchEvent::FailedToSendMessage {
                channel_id,
                echo_id,
            } => {
                tracing::error!("failed to send message with echo id {}", echo_id);
                self.update_message(channel_id, &MessageId::Unack(echo_id), |message| {
                    message.failed_to_send = true;
                });
            }
        }
    }

    fn process_broadcast(&mut self, event: BroadcastEvent) {
        match event {
            BroadcastEvent::Message(preview) => {
                // Previews are never inserted directly; the canonical row is
                // refetched by id. If we already hold that id (our own echo,
                // or a duplicate delivery) there is nothing to do.
                let held = self
                    .channels
                    .get(&preview.channel_id)
                    .map_or(false, |channel| {
                        channel
                            .messages
                            .contains(&MessageId::Ack(preview.message_id))
                    });
                if !held {
                    let _ = self.post_sender.send(PostProcessEvent::FetchMessage {
                        channel_id: preview.channel_id,
                        message_id: preview.message_id,
                    });
                }
            }
            BroadcastEvent::Typing(TypingSignal {
                channel_id,
                user_id,
                username,
                is_typing,
            }) => {
                let channel = self.get_channel_mut(channel_id);
                if is_typing {
                    channel.typing.start(user_id, username);
                } else {
                    channel.typing.stop(&user_id);
                }
            }
        }
    }

    fn request_missing_profiles(&self, messages: &[Message]) {
        for author in messages.iter().filter_map(|message| message.author) {
            if self.members.get(&author).map_or(true, |m| !m.fetched) {
                let _ = self
                    .post_sender
                    .send(PostProcessEvent::FetchProfile(author));
            }
        }
    }
}

/// Handle for async work against the row store and broadcast transport.
/// Cheap to clone when the backends are.
pub struct Client<S, B> {
    store: S,
    bus: B,
    session: Session,
}

impl<S, B> Debug for Client<S, B> {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        fmt.debug_struct("Client")
            .field("session", &self.session)
            .finish()
    }
}

impl<S: Clone, B: Clone> Clone for Client<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            session: self.session.clone(),
        }
    }
}

impl<S: RowStore, B: Broadcast> Client<S, B> {
    pub fn new(store: S, bus: B, session: Session) -> Self {
        Self { store, bus, session }
    }

    pub fn user_id(&self) -> Uuid {
        self.session.user_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Lease the message topic of a channel for the life of the returned
    /// guard.
    pub fn subscribe_messages(&self, channel_id: &Uuid) -> Subscription {
        self.bus.subscribe(&message_topic(channel_id))
    }

    pub fn subscribe_typing(&self, channel_id: &Uuid) -> Subscription {
        self.bus.subscribe(&typing_topic(channel_id))
    }

    /// Load the most recent page of a channel and hand it to the cache.
    pub async fn fetch_messages(
        &self,
        channel_id: Uuid,
        events: &EventSender,
    ) -> ClientResult<()> {
        let mut messages = self
            .store
            .recent_messages(channel_id, HISTORY_PAGE_SIZE)
            .await?;
        messages.reverse();
        let _ = events.send(FetchEvent::InitialMessages {
            channel_id,
            messages,
        });
        Ok(())
    }

    /// Load one backward page strictly older than `before`.
    pub async fn fetch_messages_before(
        &self,
        channel_id: Uuid,
        before: DateTime<Utc>,
        events: &EventSender,
    ) -> ClientResult<()> {
        let mut messages = self
            .store
            .messages_before(channel_id, before, HISTORY_PAGE_SIZE)
            .await?;
        let reached_top = messages.len() < HISTORY_PAGE_SIZE;
        messages.reverse();
        let _ = events.send(FetchEvent::HistoryChunk {
            channel_id,
            messages,
            reached_top,
        });
        Ok(())
    }

    /// Persist a message prepared by [`Cache::prepare_send_message`]. On
    /// success the ack flows back through the event channel; on failure the
    /// optimistic entry is marked instead of retracted.
    pub async fn send_message(
        &self,
        channel_id: Uuid,
        echo_id: u64,
        content: &str,
        events: &EventSender,
    ) -> ClientResult<Uuid> {
        match self
            .store
            .create_message(channel_id, self.session.user_id, content.trim())
            .await
        {
            Ok(message) => {
                let message_id = message.id.id().unwrap_or_default();
                let _ = events.send(FetchEvent::MessageSent {
                    channel_id,
                    echo_id: Some(echo_id),
                    message,
                });
                Ok(message_id)
            }
            Err(err) => {
                let _ = events.send(FetchEvent::FailedToSendMessage {
                    channel_id,
                    echo_id,
                });
                Err(err)
            }
        }
    }

    /// Publish a typing start or stop signal on the channel's typing topic.
    pub async fn send_typing(&self, channel_id: Uuid, is_typing: bool) -> ClientResult<()> {
        let event = BroadcastEvent::Typing(TypingSignal {
            channel_id,
            user_id: self.session.user_id,
            username: self.session.username.clone(),
            is_typing,
        });
        self.bus.publish(&typing_topic(&channel_id), event).await
    }

    /// Execute one follow-up the cache asked for.
    pub async fn process_post(
        &self,
        events: &EventSender,
        post: PostProcessEvent,
    ) -> ClientResult<()> {
        tracing::debug!("processing post event: {:?}", post);
        match post {
            PostProcessEvent::FetchMessage {
                channel_id,
                message_id,
            } => {
                if let Some(message) = self.store.message_by_id(message_id).await? {
                    let _ = events.send(FetchEvent::FetchedMessage {
                        channel_id,
                        message,
                    });
                }
                Ok(())
            }
            PostProcessEvent::FetchProfile(user_id) => {
                if let Some(profile) = self.store.profile(user_id).await? {
                    let _ = events.send(FetchEvent::ProfileUpdated {
                        user_id,
                        profile,
                        is_ai: false,
                    });
                }
                Ok(())
            }
        }
    }
}

/// Forward everything a leased subscription yields into the cache's event
/// queue. Ends when either side goes away.
pub async fn forward_broadcasts(mut subscription: Subscription, events: EventSender) {
    while let Some(event) = subscription.recv().await {
        if events.send(FetchEvent::Broadcast(event)).is_err() {
            break;
        }
    }
    tracing::debug!("subscription to {} ended", subscription.topic());
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{testbed::*, *};
    use crate::backend::MessagePreview;

    struct Peer {
        cache: Cache,
        events: EventSender,
        posts: PostEventReceiver,
        client: Client<MemoryStore, MemoryBus>,
    }

    impl Peer {
        fn new(store: &MemoryStore, bus: &MemoryBus, user_id: Uuid, username: &str) -> Self {
            let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
            let (post_tx, post_rx) = tokio::sync::mpsc::unbounded_channel();
            let session = Session {
                session_token: SmolStr::new("token"),
                user_id,
                username: SmolStr::new(username),
                endpoint: SmolStr::new("mem://local"),
            };
            Self {
                cache: Cache::new(user_id, event_rx, post_tx),
                events: event_tx,
                posts: post_rx,
                client: Client::new(store.clone(), bus.clone(), session),
            }
        }

        /// Move pending broadcasts into the event queue and apply everything.
        fn pump(&mut self, subscription: &mut Subscription) {
            while let Some(event) = subscription.try_recv() {
                self.events.send(FetchEvent::Broadcast(event)).unwrap();
            }
            self.cache.maintain();
        }

        async fn run_posts(&mut self) {
            while let Ok(post) = self.posts.try_recv() {
                self.client.process_post(&self.events, post).await.unwrap();
            }
            self.cache.maintain();
        }

        fn window_contents(&self, channel_id: &Uuid) -> Vec<String> {
            self.cache
                .get_channel(channel_id)
                .map(|channel| {
                    channel
                        .messages
                        .iter()
                        .map(|message| message.content.clone())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    fn seeded(store: &MemoryStore, channel_id: Uuid, author: Uuid, count: usize) {
        for i in 0..count {
            store.seed_message(channel_id, author, &format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn initial_load_is_capped_and_ordered() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        seeded(&store, channel_id, author, 120);

        let mut peer = Peer::new(&store, &bus, author, "alice");
        assert!(peer.cache.begin_initial_fetch(channel_id));
        assert!(!peer.cache.begin_initial_fetch(channel_id));
        peer.client
            .fetch_messages(channel_id, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();

        let channel = peer.cache.get_channel(&channel_id).unwrap();
        assert_eq!(channel.messages.len(), HISTORY_PAGE_SIZE);
        assert!(channel.has_more_history());
        assert!(!channel.init_fetching);
        assert_eq!(channel.messages.oldest().unwrap().content, "m70");
        assert_eq!(channel.messages.newest().unwrap().content, "m119");
    }

    #[tokio::test]
    async fn pagination_walks_to_the_top_without_duplicates() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let author = Uuid::new_v4();
        seeded(&store, channel_id, author, 120);

        let mut peer = Peer::new(&store, &bus, author, "alice");
        peer.client
            .fetch_messages(channel_id, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();

        // Second page: 50 more, top not yet reached.
        let before = peer.cache.begin_history_fetch(channel_id).unwrap();
        // Guard holds while the fetch is in flight.
        assert!(peer.cache.begin_history_fetch(channel_id).is_none());
        peer.client
            .fetch_messages_before(channel_id, before, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();
        {
            let channel = peer.cache.get_channel(&channel_id).unwrap();
            assert_eq!(channel.messages.len(), 100);
            assert!(channel.has_more_history());
            assert!(!channel.loading_history);
        }

        // Third page comes back short, which ends pagination.
        let before = peer.cache.begin_history_fetch(channel_id).unwrap();
        peer.client
            .fetch_messages_before(channel_id, before, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();
        let channel = peer.cache.get_channel(&channel_id).unwrap();
        assert_eq!(channel.messages.len(), 120);
        assert!(!channel.has_more_history());
        assert!(peer.cache.begin_history_fetch(channel_id).is_none());

        let contents = peer.window_contents(&channel_id);
        let expected: Vec<String> = (0..120).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn optimistic_send_acks_in_place_and_ignores_own_echo() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        store.add_profile(user_id, "alice");

        let mut peer = Peer::new(&store, &bus, user_id, "alice");
        let mut subscription = peer.client.subscribe_messages(&channel_id);

        let echo_id = peer.cache.prepare_send_message(channel_id, "hello").unwrap();
        {
            let channel = peer.cache.get_channel(&channel_id).unwrap();
            assert_eq!(channel.messages.len(), 1);
            assert!(channel.messages.contains(&MessageId::Unack(echo_id)));
        }

        let message_id = peer
            .client
            .send_message(channel_id, echo_id, "hello", &peer.events)
            .await
            .unwrap();
        // The ack and our own broadcast preview both arrive; the window must
        // converge to a single canonical entry.
        peer.pump(&mut subscription);
        let channel = peer.cache.get_channel(&channel_id).unwrap();
        assert_eq!(channel.messages.len(), 1);
        assert!(!channel.messages.contains(&MessageId::Unack(echo_id)));
        assert!(channel.messages.contains(&MessageId::Ack(message_id)));
        // The preview was recognized as already held; no refetch queued.
        assert!(peer.posts.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reconciliation_converges_across_clients() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.add_profile(alice, "alice");
        store.add_profile(bob, "bob");

        let mut sender = Peer::new(&store, &bus, alice, "alice");
        let mut receiver = Peer::new(&store, &bus, bob, "bob");
        let mut subscription = receiver.client.subscribe_messages(&channel_id);

        let echo_id = sender
            .cache
            .prepare_send_message(channel_id, "hello")
            .unwrap();
        let message_id = sender
            .client
            .send_message(channel_id, echo_id, "hello", &sender.events)
            .await
            .unwrap();

        // Preview arrives, canonical row is refetched and merged.
        receiver.pump(&mut subscription);
        receiver.run_posts().await;
        {
            let channel = receiver.cache.get_channel(&channel_id).unwrap();
            assert_eq!(channel.messages.len(), 1);
            let message = channel.messages.newest().unwrap();
            assert_eq!(message.content, "hello");
            assert_eq!(message.author, Some(alice));
            assert_eq!(message.profile.username, "alice");
            assert!(!message.is_ai);
        }

        // The transport is at-least-once; a duplicate delivery of the same
        // preview must not create a second entry.
        let row = store.message_by_id(message_id).await.unwrap().unwrap();
        let duplicate = BroadcastEvent::Message(MessagePreview {
            message_id,
            channel_id,
            content: row.content.clone(),
            user_id: row.author,
            username: row.profile.username.clone(),
            created_at: row.created_at,
        });
        receiver
            .events
            .send(FetchEvent::Broadcast(duplicate))
            .unwrap();
        receiver.cache.maintain();
        receiver.run_posts().await;
        assert_eq!(
            receiver
                .cache
                .get_channel(&channel_id)
                .unwrap()
                .messages
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_send_marks_the_entry_instead_of_retracting_it() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        store
            .fail_creates
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let mut peer = Peer::new(&store, &bus, user_id, "alice");
        let echo_id = peer.cache.prepare_send_message(channel_id, "hello").unwrap();
        let result = peer
            .client
            .send_message(channel_id, echo_id, "hello", &peer.events)
            .await;
        assert!(matches!(result, Err(ClientError::Backend(_))));

        peer.cache.maintain();
        let channel = peer.cache.get_channel(&channel_id).unwrap();
        let message = channel.messages.get(&MessageId::Unack(echo_id)).unwrap();
        assert!(message.failed_to_send);
        assert_eq!(message.content, "hello");
    }

    #[tokio::test]
    async fn oversized_content_is_rejected_before_any_network_call() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let mut peer = Peer::new(&store, &bus, user_id, "alice");
        let oversized = "a".repeat(validation::MAX_MESSAGE_LENGTH + 1);
        let result = peer.cache.prepare_send_message(channel_id, &oversized);
        assert!(matches!(result, Err(ClientError::Validation(_))));
        // Nothing was inserted optimistically and nothing hit the store.
        assert!(peer
            .cache
            .get_channel(&channel_id)
            .map_or(true, |channel| channel.messages.is_empty()));
        assert_eq!(store.row_count(), 0);

        assert!(peer
            .cache
            .prepare_send_message(channel_id, "   ")
            .is_err());
    }

    #[tokio::test]
    async fn typing_signals_fan_out_and_filter_self() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut sender = Peer::new(&store, &bus, alice, "alice");
        let mut receiver = Peer::new(&store, &bus, bob, "bob");
        let mut sender_sub = sender.client.subscribe_typing(&channel_id);
        let mut receiver_sub = receiver.client.subscribe_typing(&channel_id);

        sender.client.send_typing(channel_id, true).await.unwrap();
        receiver.pump(&mut receiver_sub);
        sender.pump(&mut sender_sub);

        let bob_view = receiver.cache.get_channel(&channel_id).unwrap();
        assert_eq!(
            bob_view.typing.indicator_text(&bob).unwrap(),
            "alice is typing..."
        );
        // The sender sees their own signal come back and filters it out.
        let alice_view = sender.cache.get_channel(&channel_id).unwrap();
        assert_eq!(alice_view.typing.indicator_text(&alice), None);

        sender.client.send_typing(channel_id, false).await.unwrap();
        receiver.pump(&mut receiver_sub);
        let bob_view = receiver.cache.get_channel(&channel_id).unwrap();
        assert_eq!(bob_view.typing.indicator_text(&bob), None);
    }

    #[tokio::test]
    async fn live_insert_and_history_prepend_interleave_in_order() {
        let bus = MemoryBus::default();
        let store = MemoryStore::new(bus.clone());
        let channel_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.add_profile(alice, "alice");
        seeded(&store, channel_id, alice, 60);

        let mut peer = Peer::new(&store, &bus, bob, "bob");
        let mut subscription = peer.client.subscribe_messages(&channel_id);
        peer.client
            .fetch_messages(channel_id, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();
        assert_eq!(
            peer.cache.get_channel(&channel_id).unwrap().messages.len(),
            50
        );

        // A live message lands while the user scrolls up for history.
        let before = peer.cache.begin_history_fetch(channel_id).unwrap();
        store
            .create_message(channel_id, alice, "live")
            .await
            .unwrap();
        peer.pump(&mut subscription);
        peer.run_posts().await;

        peer.client
            .fetch_messages_before(channel_id, before, &peer.events)
            .await
            .unwrap();
        peer.cache.maintain();

        let contents = peer.window_contents(&channel_id);
        assert_eq!(contents.len(), 61);
        assert_eq!(contents.first().unwrap(), "m0");
        assert_eq!(contents.last().unwrap(), "live");
        assert!(!peer
            .cache
            .get_channel(&channel_id)
            .unwrap()
            .has_more_history());
    }

    #[test]
    fn scroll_position_gates_backward_fetches() {
        let (_, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (post_tx, _post_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cache = Cache::new(Uuid::new_v4(), event_rx, post_tx);
        let channel_id = Uuid::new_v4();
        cache.add_message(channel_id, Message::default());

        let mut scroll = ScrollState::new(400.0);
        scroll.apply_layout(2000.0);
        scroll.scroll_to_bottom();
        assert!(!cache.should_fetch_older(&channel_id, &scroll));

        scroll.scroll_to(0.0);
        assert!(cache.should_fetch_older(&channel_id, &scroll));

        cache.get_channel_mut(channel_id).loading_history = true;
        assert!(!cache.should_fetch_older(&channel_id, &scroll));

        let channel = cache.get_channel_mut(channel_id);
        channel.loading_history = false;
        channel.reached_top = true;
        assert!(!cache.should_fetch_older(&channel_id, &scroll));
    }

    #[tokio::test]
    async fn dropping_the_subscription_releases_the_topic() {
        let bus = MemoryBus::default();
        let channel_id = Uuid::new_v4();
        let topic = message_topic(&channel_id);

        let subscription = bus.subscribe(&topic);
        assert_eq!(bus.live_subscribers(&topic), 1);

        drop(subscription);
        assert_eq!(bus.live_subscribers(&topic), 0);

        // Publishing after release must not fail.
        bus.publish(
            &topic,
            BroadcastEvent::Typing(TypingSignal {
                channel_id,
                user_id: Uuid::new_v4(),
                username: SmolStr::new("alice"),
                is_typing: true,
            }),
        )
        .await
        .unwrap();
    }

    #[test]
    fn edits_deletes_and_embedding_backfill_apply() {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (post_tx, _post_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cache = Cache::new(Uuid::new_v4(), event_rx, post_tx);
        let channel_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        cache.add_message(
            channel_id,
            Message {
                id: MessageId::Ack(message_id),
                channel_id,
                content: "original".to_string(),
                ..Default::default()
            },
        );

        let edited_at = Utc::now();
        event_tx
            .send(FetchEvent::MessageEdited {
                channel_id,
                message_id,
                new_content: "edited".to_string(),
                updated_at: edited_at,
            })
            .unwrap();
        event_tx
            .send(FetchEvent::EmbeddingBackfilled {
                channel_id,
                message_id,
                embedding: vec![0.5, 0.25],
            })
            .unwrap();
        cache.maintain();

        let channel = cache.get_channel(&channel_id).unwrap();
        let message = channel.messages.get(&MessageId::Ack(message_id)).unwrap();
        assert_eq!(message.content, "edited");
        assert_eq!(message.updated_at, edited_at);
        assert_eq!(message.embedding.as_deref(), Some(&[0.5, 0.25][..]));

        event_tx
            .send(FetchEvent::MessageDeleted {
                channel_id,
                message_id: MessageId::Ack(message_id),
            })
            .unwrap();
        cache.maintain();
        assert!(cache.get_channel(&channel_id).unwrap().messages.is_empty());
    }

    #[test]
    fn channel_windows_are_independent() {
        let (_, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (post_tx, _post_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cache = Cache::new(Uuid::new_v4(), event_rx, post_tx);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        cache.set_messages(
            first,
            vec![Message {
                content: "in first".to_string(),
                ..Default::default()
            }],
        );
        cache.add_message(
            second,
            Message {
                content: "in second".to_string(),
                ..Default::default()
            },
        );

        cache.clear_channel(&first);
        assert!(cache.get_channel(&first).unwrap().messages.is_empty());
        assert_eq!(cache.get_channel(&second).unwrap().messages.len(), 1);
    }

    #[test]
    fn typing_entries_expire_during_maintain() {
        let (_, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (post_tx, _post_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cache = Cache::new(Uuid::new_v4(), event_rx, post_tx);
        let channel_id = Uuid::new_v4();
        let typer = Uuid::new_v4();

        cache
            .get_channel_mut(channel_id)
            .typing
            .start(typer, SmolStr::new("alice"));
        cache.maintain();
        assert!(cache.get_channel(&channel_id).unwrap().typing.is_typing(&typer));

        // Fresh entries survive maintain; only silence longer than the
        // timeout drops them.
        cache
            .get_channel_mut(channel_id)
            .typing
            .expire(Duration::from_secs(0));
        assert!(!cache.get_channel(&channel_id).unwrap().typing.is_typing(&typer));
    }

    #[test]
    fn session_debug_redacts_the_token() {
        let session = Session {
            session_token: SmolStr::new("super-secret"),
            user_id: Uuid::new_v4(),
            username: SmolStr::new("alice"),
            endpoint: SmolStr::new("mem://local"),
        };
        let debugged = format!("{:?}", session);
        assert!(!debugged.contains("super-secret"));
        assert!(debugged.contains("alice"));
    }

    #[test]
    fn channel_and_server_events_update_metadata() {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let (post_tx, _post_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cache = Cache::new(Uuid::new_v4(), event_rx, post_tx);
        let server_id = Uuid::new_v4();
        let channel_id = Uuid::new_v4();
        let owner = Uuid::new_v4();

        event_tx
            .send(FetchEvent::ServerAdded {
                server_id,
                name: SmolStr::new("rust"),
                owner_id: owner,
                invite_code: SmolStr::new("rust-abc123"),
            })
            .unwrap();
        event_tx
            .send(FetchEvent::ChannelCreated {
                server_id,
                channel_id,
                name: SmolStr::new("general"),
                description: None,
            })
            .unwrap();
        cache.maintain();

        let server = cache.get_server(&server_id).unwrap();
        assert!(server.is_owner(&owner));
        assert_eq!(server.channels, vec![channel_id]);
        assert_eq!(cache.get_channel(&channel_id).unwrap().name, "general");

        event_tx
            .send(FetchEvent::ChannelDeleted { channel_id })
            .unwrap();
        cache.maintain();
        assert!(cache.get_channel(&channel_id).is_none());
        assert!(cache.get_server(&server_id).unwrap().channels.is_empty());
    }
}
