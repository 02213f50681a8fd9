use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ConversationId, DeleteMode, DeliveryStatus, MediaKind, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload, ReadStatusChange, StickerPayload},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod rest;

/// Fixed page size for message history. A page shorter than this is the
/// end-of-history signal.
pub const MESSAGE_PAGE_SIZE: u32 = 50;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("message content must not be empty")]
    EmptyContent,
}

/// Server-side signal that something in the inbox changed. The payload only
/// hints at which conversation; consumers re-fetch wholesale either way.
#[derive(Debug, Clone, Copy)]
pub struct ConversationSignal {
    pub conversation_id: Option<ConversationId>,
}

/// File-based media send. The service owns the upload; this layer never
/// sees the stored URL until the created message comes back.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub media_kind: MediaKind,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
}

/// The remote conversation/message service this client synchronizes
/// against. Subscriptions hand back receivers; dropping a receiver is the
/// unsubscribe.
#[async_trait]
pub trait ConversationService: Send + Sync {
    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>>;
    async fn conversation(&self, conversation_id: ConversationId) -> Result<ConversationSummary>;
    /// Get-or-create; calling twice for the same pair returns the same id.
    async fn open_conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> Result<ConversationId>;
    /// Ascending by creation; `before` is an exclusive cursor.
    async fn messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_text(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessagePayload>;
    async fn send_media(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        upload: MediaUpload,
    ) -> Result<MessagePayload>;
    async fn send_sticker(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        sticker: StickerPayload,
        caption: Option<String>,
    ) -> Result<MessagePayload>;
    async fn mark_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()>;
    async fn delete_message(&self, message_id: MessageId) -> Result<()>;
    async fn unread_count(&self, user_id: UserId) -> Result<u32>;
    async fn subscribe_conversations(
        &self,
        user_id: UserId,
    ) -> Result<mpsc::Receiver<ConversationSignal>>;
    async fn subscribe_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<MessagePayload>>;
    async fn subscribe_read_status(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<ReadStatusChange>>;
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    ConversationsUpdated(Vec<ConversationSummary>),
    UnreadCountChanged(u32),
    MessagesReplaced {
        conversation_id: ConversationId,
    },
    MessageArrived(MessagePayload),
    DeliveryStatusChanged {
        message_id: MessageId,
        status: DeliveryStatus,
    },
    MessageHidden(MessageId),
    Error(String),
}

struct ClientState {
    user_id: Option<UserId>,
    conversations: Vec<ConversationSummary>,
    conversations_loading: bool,
    unread_total: u32,
    active_conversation: Option<ConversationId>,
    messages: Vec<MessagePayload>,
    messages_loading: bool,
    has_more_messages: bool,
    hidden_messages: HashSet<MessageId>,
    /// Bumped on every active-conversation change; message pages that were
    /// in flight under an older generation are discarded on arrival.
    fetch_generation: u64,
}

struct ConversationChannels {
    conversation_id: ConversationId,
    messages_task: JoinHandle<()>,
    read_status_task: JoinHandle<()>,
}

impl ConversationChannels {
    fn abort(self) {
        self.messages_task.abort();
        self.read_status_task.abort();
    }
}

#[derive(Default)]
struct ActiveChannels {
    conversations_task: Option<JoinHandle<()>>,
    conversation_scoped: Option<ConversationChannels>,
}

/// Client-side cache-and-sync layer between UI consumers and the remote
/// conversation service. One instance per signed-in session; explicitly
/// constructed and disposed so independent instances can coexist in tests.
pub struct MessagingClient {
    service: Arc<dyn ConversationService>,
    inner: Mutex<ClientState>,
    channels: Mutex<ActiveChannels>,
    events: broadcast::Sender<StoreEvent>,
}

impl MessagingClient {
    pub fn new(service: Arc<dyn ConversationService>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            service,
            inner: Mutex::new(ClientState {
                user_id: None,
                conversations: Vec::new(),
                conversations_loading: false,
                unread_total: 0,
                active_conversation: None,
                messages: Vec::new(),
                messages_loading: false,
                has_more_messages: false,
                hidden_messages: HashSet::new(),
                fetch_generation: 0,
            }),
            channels: Mutex::new(ActiveChannels::default()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Binds the client to a signed-in user: opens the session-global
    /// conversations channel and loads the inbox and unread counter. Any
    /// previous session is torn down first.
    pub async fn initialize(self: &Arc<Self>, user_id: UserId) -> Result<()> {
        self.dispose().await;
        {
            let mut guard = self.inner.lock().await;
            guard.user_id = Some(user_id);
        }

        let mut signals = self.service.subscribe_conversations(user_id).await?;
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                debug!(
                    conversation_id = ?signal.conversation_id,
                    "conversations channel signal; re-syncing inbox"
                );
                if let Err(err) = client.fetch_conversations().await {
                    let _ = client
                        .events
                        .send(StoreEvent::Error(format!("inbox refresh failed: {err}")));
                }
                if let Err(err) = client.fetch_unread_count().await {
                    let _ = client.events.send(StoreEvent::Error(format!(
                        "unread counter refresh failed: {err}"
                    )));
                }
            }
        });
        {
            let mut channels = self.channels.lock().await;
            if let Some(previous) = channels.conversations_task.replace(task) {
                previous.abort();
            }
        }

        self.fetch_conversations().await?;
        self.fetch_unread_count().await?;
        Ok(())
    }

    /// Unsubscribes every realtime channel and clears all session state.
    pub async fn dispose(&self) {
        let (conversations_task, scoped) = {
            let mut channels = self.channels.lock().await;
            (
                channels.conversations_task.take(),
                channels.conversation_scoped.take(),
            )
        };
        if let Some(task) = conversations_task {
            task.abort();
        }
        if let Some(scoped) = scoped {
            scoped.abort();
        }

        let mut guard = self.inner.lock().await;
        guard.fetch_generation += 1;
        guard.user_id = None;
        guard.conversations.clear();
        guard.conversations_loading = false;
        guard.unread_total = 0;
        guard.active_conversation = None;
        guard.messages.clear();
        guard.messages_loading = false;
        guard.has_more_messages = false;
        guard.hidden_messages.clear();
    }

    async fn session(&self) -> Result<UserId> {
        let guard = self.inner.lock().await;
        guard.user_id.ok_or_else(|| MessagingError::NotSignedIn.into())
    }

    async fn active_context(&self) -> Result<(UserId, ConversationId)> {
        let guard = self.inner.lock().await;
        let user_id = guard.user_id.ok_or(MessagingError::NotSignedIn)?;
        let conversation_id = guard
            .active_conversation
            .ok_or(MessagingError::NoActiveConversation)?;
        Ok((user_id, conversation_id))
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.fetch_generation == generation
    }

    /// Replaces the inbox with the server's conversation list. A failed
    /// fetch keeps the previous list so the UI never flashes empty.
    pub async fn fetch_conversations(&self) -> Result<()> {
        let user_id = self.session().await?;
        {
            let mut guard = self.inner.lock().await;
            guard.conversations_loading = true;
        }

        let result = self.service.conversations(user_id).await;

        let mut guard = self.inner.lock().await;
        guard.conversations_loading = false;
        match result {
            Ok(conversations) => {
                guard.conversations = conversations.clone();
                drop(guard);
                let _ = self
                    .events
                    .send(StoreEvent::ConversationsUpdated(conversations));
            }
            Err(err) => {
                warn!("conversation list fetch failed, keeping previous inbox: {err}");
            }
        }
        Ok(())
    }

    /// Idempotently obtains the conversation with `other_user_id` and
    /// refreshes the inbox so the new entry is present for navigation.
    pub async fn start_conversation(&self, other_user_id: UserId) -> Result<ConversationId> {
        let user_id = self.session().await?;
        let conversation_id = self
            .service
            .open_conversation(user_id, other_user_id)
            .await?;
        info!(
            conversation_id = conversation_id.0,
            other_user_id = other_user_id.0,
            "conversation opened"
        );
        self.fetch_conversations().await?;
        Ok(conversation_id)
    }

    /// Refreshes the global unread badge counter; cheaper than a full
    /// directory fetch, failure keeps the previous value.
    pub async fn fetch_unread_count(&self) -> Result<()> {
        let user_id = self.session().await?;
        match self.service.unread_count(user_id).await {
            Ok(unread) => {
                {
                    let mut guard = self.inner.lock().await;
                    guard.unread_total = unread;
                }
                let _ = self.events.send(StoreEvent::UnreadCountChanged(unread));
            }
            Err(err) => {
                warn!("unread count fetch failed, keeping previous value: {err}");
            }
        }
        Ok(())
    }

    /// Loads a page of history for `conversation_id`. With `load_more` the
    /// page strictly precedes the oldest cached message and is prepended;
    /// otherwise the cache is replaced wholesale. Results that arrive after
    /// the active conversation changed are discarded.
    pub async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        load_more: bool,
    ) -> Result<()> {
        let (generation, before) = {
            let mut guard = self.inner.lock().await;
            if load_more && !guard.has_more_messages {
                return Ok(());
            }
            guard.messages_loading = true;
            let before = if load_more {
                guard.messages.first().map(|m| m.message_id)
            } else {
                None
            };
            (guard.fetch_generation, before)
        };

        let result = self
            .service
            .messages(conversation_id, MESSAGE_PAGE_SIZE, before)
            .await;

        let mut guard = self.inner.lock().await;
        if guard.fetch_generation != generation
            || guard.active_conversation != Some(conversation_id)
        {
            info!(
                conversation_id = conversation_id.0,
                "discarding message page that resolved after a conversation switch"
            );
            return Ok(());
        }
        guard.messages_loading = false;
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    "message fetch failed, keeping cached window: {err}"
                );
                return Ok(());
            }
        };

        guard.has_more_messages = page.len() == MESSAGE_PAGE_SIZE as usize;
        if load_more {
            let existing: HashSet<MessageId> =
                guard.messages.iter().map(|m| m.message_id).collect();
            let mut merged: Vec<MessagePayload> = page
                .into_iter()
                .filter(|m| !existing.contains(&m.message_id))
                .collect();
            merged.append(&mut guard.messages);
            guard.messages = merged;
        } else {
            guard.messages = page;
        }
        drop(guard);
        let _ = self
            .events
            .send(StoreEvent::MessagesReplaced { conversation_id });
        Ok(())
    }

    /// Inserts `message` into the cache unless a message with the same id
    /// is already present or the cache belongs to another conversation.
    /// Keeps the window ascending by id. Returns whether it was inserted.
    async fn append_message(&self, message: MessagePayload) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.active_conversation != Some(message.conversation_id) {
            return false;
        }
        if guard
            .messages
            .iter()
            .any(|m| m.message_id == message.message_id)
        {
            return false;
        }
        let at = guard
            .messages
            .iter()
            .position(|m| m.message_id > message.message_id)
            .unwrap_or(guard.messages.len());
        guard.messages.insert(at, message.clone());
        drop(guard);
        let _ = self.events.send(StoreEvent::MessageArrived(message));
        true
    }

    /// Sends a text message to the active conversation. The created message
    /// is appended optimistically (dedup by id guards against the realtime
    /// echo winning the race) and the inbox is refreshed.
    pub async fn send_message(&self, content: &str) -> Result<MessagePayload> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MessagingError::EmptyContent.into());
        }
        let (user_id, conversation_id) = self.active_context().await?;
        let message = self
            .service
            .send_text(conversation_id, user_id, content)
            .await?;
        self.append_message(message.clone()).await;
        self.fetch_conversations().await?;
        Ok(message)
    }

    /// Same contract as [`send_message`](Self::send_message) for a
    /// file-based image or video upload.
    pub async fn send_media_message(&self, upload: MediaUpload) -> Result<MessagePayload> {
        let (user_id, conversation_id) = self.active_context().await?;
        let message = self
            .service
            .send_media(conversation_id, user_id, upload)
            .await?;
        self.append_message(message.clone()).await;
        self.fetch_conversations().await?;
        Ok(message)
    }

    /// Same contract for an externally hosted sticker; nothing is uploaded,
    /// the structured payload travels with the message.
    pub async fn send_sticker_message(
        &self,
        sticker: StickerPayload,
        caption: Option<String>,
    ) -> Result<MessagePayload> {
        let (user_id, conversation_id) = self.active_context().await?;
        let message = self
            .service
            .send_sticker(conversation_id, user_id, sticker, caption)
            .await?;
        self.append_message(message.clone()).await;
        self.fetch_conversations().await?;
        Ok(message)
    }

    /// Marks the active conversation read on the server, then applies a
    /// blanket local read-marking, zeroes the conversation's unread count
    /// and re-derives the global counter from the server.
    pub async fn mark_as_read(&self) -> Result<()> {
        let (user_id, conversation_id) = self.active_context().await?;
        self.service.mark_read(conversation_id, user_id).await?;

        {
            let mut guard = self.inner.lock().await;
            let now = Utc::now();
            for message in &mut guard.messages {
                if message.delivery_status < DeliveryStatus::Read {
                    message.delivery_status = DeliveryStatus::Read;
                }
                message.is_read = true;
                message.delivered_at.get_or_insert(now);
                message.read_at.get_or_insert(now);
            }
            if let Some(summary) = guard
                .conversations
                .iter_mut()
                .find(|c| c.conversation_id == conversation_id)
            {
                summary.unread_count = 0;
            }
        }

        self.fetch_unread_count().await
    }

    /// Local-only optimistic delivery marking for incoming messages; the
    /// server-side delivery acknowledgment happens elsewhere.
    pub async fn mark_as_delivered(&self, message_ids: &[MessageId]) -> Result<()> {
        let user_id = self.session().await?;
        let mut guard = self.inner.lock().await;
        let now = Utc::now();
        for message in &mut guard.messages {
            if message.sender_id == user_id {
                continue;
            }
            if !message_ids.contains(&message.message_id) {
                continue;
            }
            if message.delivery_status < DeliveryStatus::Delivered {
                message.delivery_status = DeliveryStatus::Delivered;
                message.delivered_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    /// Applies a delivery-status transition from the read-status channel.
    /// Transitions are monotonic; a stale or backward update is ignored.
    pub async fn update_message_delivery_status(
        &self,
        message_id: MessageId,
        status: DeliveryStatus,
    ) {
        let mut guard = self.inner.lock().await;
        let Some(message) = guard
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
        else {
            return;
        };
        if status <= message.delivery_status {
            return;
        }
        let now = Utc::now();
        message.delivery_status = status;
        message.delivered_at.get_or_insert(now);
        if status == DeliveryStatus::Read {
            message.is_read = true;
            message.read_at.get_or_insert(now);
        }
        drop(guard);
        let _ = self
            .events
            .send(StoreEvent::DeliveryStatusChanged { message_id, status });
    }

    /// Hides a message locally; with [`DeleteMode::Everyone`] the server
    /// hard delete is issued first. The cache keeps the entry so the UI can
    /// render a "message deleted" placeholder; the hidden-set only grows
    /// within a session.
    pub async fn delete_message(&self, message_id: MessageId, mode: DeleteMode) -> Result<()> {
        self.session().await?;
        if mode == DeleteMode::Everyone {
            self.service.delete_message(message_id).await?;
        }
        {
            let mut guard = self.inner.lock().await;
            guard.hidden_messages.insert(message_id);
        }
        let _ = self.events.send(StoreEvent::MessageHidden(message_id));
        self.fetch_conversations().await
    }

    /// Switches the active conversation. Conversation-scoped channels are
    /// torn down and the cache is cleared before anything is fetched for
    /// the new conversation, so no cross-conversation leakage is possible.
    pub async fn set_active_conversation(
        self: &Arc<Self>,
        conversation_id: Option<ConversationId>,
    ) -> Result<()> {
        self.teardown_conversation_channels().await;

        let generation = {
            let mut guard = self.inner.lock().await;
            guard.fetch_generation += 1;
            guard.active_conversation = conversation_id;
            guard.messages.clear();
            guard.messages_loading = false;
            guard.has_more_messages = false;
            guard.fetch_generation
        };

        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };

        match self.service.conversation(conversation_id).await {
            Ok(summary) => self.upsert_conversation(summary).await,
            Err(err) => warn!(
                conversation_id = conversation_id.0,
                "conversation summary fetch failed: {err}"
            ),
        }

        self.fetch_messages(conversation_id, false).await?;
        if !self.is_current(generation).await {
            return Ok(());
        }

        if let Err(err) = self.mark_as_read().await {
            warn!(
                conversation_id = conversation_id.0,
                "mark-as-read on conversation open failed: {err}"
            );
        }
        if !self.is_current(generation).await {
            return Ok(());
        }

        self.spawn_conversation_channels(conversation_id).await
    }

    async fn upsert_conversation(&self, summary: ConversationSummary) {
        let conversations = {
            let mut guard = self.inner.lock().await;
            match guard
                .conversations
                .iter_mut()
                .find(|c| c.conversation_id == summary.conversation_id)
            {
                Some(existing) => *existing = summary,
                None => guard.conversations.push(summary),
            }
            guard.conversations.clone()
        };
        let _ = self
            .events
            .send(StoreEvent::ConversationsUpdated(conversations));
    }

    async fn spawn_conversation_channels(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let mut messages_rx = self.service.subscribe_messages(conversation_id).await?;
        let mut read_rx = self.service.subscribe_read_status(conversation_id).await?;

        let client = Arc::clone(self);
        let messages_task = tokio::spawn(async move {
            while let Some(message) = messages_rx.recv().await {
                client.handle_incoming_message(message).await;
            }
        });

        let client = Arc::clone(self);
        let read_status_task = tokio::spawn(async move {
            while let Some(change) = read_rx.recv().await {
                if change.conversation_id != conversation_id {
                    continue;
                }
                let status = if change.is_read {
                    DeliveryStatus::Read
                } else {
                    DeliveryStatus::Delivered
                };
                client
                    .update_message_delivery_status(change.message_id, status)
                    .await;
            }
        });

        let mut channels = self.channels.lock().await;
        if self.inner.lock().await.active_conversation != Some(conversation_id) {
            // lost a switch race while subscribing; drop the channels unused
            messages_task.abort();
            read_status_task.abort();
            return Ok(());
        }
        if let Some(previous) = channels.conversation_scoped.replace(ConversationChannels {
            conversation_id,
            messages_task,
            read_status_task,
        }) {
            previous.abort();
        }
        Ok(())
    }

    async fn teardown_conversation_channels(&self) {
        let scoped = {
            let mut channels = self.channels.lock().await;
            channels.conversation_scoped.take()
        };
        if let Some(scoped) = scoped {
            debug!(
                conversation_id = scoped.conversation_id.0,
                "closing conversation-scoped channels"
            );
            scoped.abort();
        }
    }

    /// Entry point for the messages channel: dedup-insert, then re-mark the
    /// conversation read so the arrival is immediately acknowledged.
    async fn handle_incoming_message(self: &Arc<Self>, message: MessagePayload) {
        let conversation_id = message.conversation_id;
        if !self.append_message(message).await {
            return;
        }
        if let Err(err) = self.mark_as_read().await {
            warn!(
                conversation_id = conversation_id.0,
                "mark-as-read after realtime message failed: {err}"
            );
        }
    }

    // Read-only snapshots for UI consumers. Hidden-set filtering at render
    // time is the UI's job; the cache itself never drops entries.

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.conversations.clone()
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        self.inner.lock().await.messages.clone()
    }

    pub async fn hidden_messages(&self) -> HashSet<MessageId> {
        self.inner.lock().await.hidden_messages.clone()
    }

    pub async fn is_hidden(&self, message_id: MessageId) -> bool {
        self.inner.lock().await.hidden_messages.contains(&message_id)
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_conversation
    }

    pub async fn unread_total(&self) -> u32 {
        self.inner.lock().await.unread_total
    }

    pub async fn conversations_loading(&self) -> bool {
        self.inner.lock().await.conversations_loading
    }

    pub async fn messages_loading(&self) -> bool {
        self.inner.lock().await.messages_loading
    }

    pub async fn has_more_messages(&self) -> bool {
        self.inner.lock().await.has_more_messages
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod lib_tests;
