//! `ConversationService` over the marketplace's HTTP + WebSocket backend.
//!
//! REST calls carry the signed-in user as a query parameter; realtime
//! events arrive on a single websocket per service instance and are fanned
//! out to whichever channel subscriptions are registered.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MediaKind, MessageId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        ConversationSummary, MessagePayload, ReadStatusChange, ServerEvent, StickerPayload,
    },
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use crate::{ConversationService, ConversationSignal, MediaUpload};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Default)]
struct SubscriptionRegistry {
    conversations: Option<mpsc::Sender<ConversationSignal>>,
    messages: HashMap<ConversationId, mpsc::Sender<MessagePayload>>,
    read_status: HashMap<ConversationId, mpsc::Sender<ReadStatusChange>>,
}

pub struct RestConversationService {
    http: Client,
    base_url: String,
    user_id: UserId,
    subscriptions: Arc<Mutex<SubscriptionRegistry>>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

#[derive(Serialize)]
struct OpenConversationRequest {
    user_id: i64,
    other_user_id: i64,
}

#[derive(Deserialize)]
struct OpenConversationResponse {
    conversation_id: ConversationId,
}

#[derive(Serialize)]
struct SendTextRequest {
    sender_id: i64,
    content: String,
}

#[derive(Serialize)]
struct SendStickerRequest {
    sender_id: i64,
    sticker: StickerPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
}

#[derive(Deserialize)]
struct UnreadCountResponse {
    unread: u32,
}

fn media_kind_slug(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "image",
        MediaKind::Video => "video",
    }
}

/// Turns a non-2xx response into a typed [`ApiException`] when the body
/// carries the service's error envelope, a plain error otherwise.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(envelope) => Err(ApiException::from(envelope).into()),
        Err(_) => Err(anyhow!("request failed with status {status}: {body}")),
    }
}

impl RestConversationService {
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Self {
        Self::with_client(Client::new(), base_url, user_id)
    }

    /// Same as [`new`](Self::new) with a caller-configured HTTP client
    /// (proxy settings, timeouts).
    pub fn with_client(http: Client, base_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            user_id,
            subscriptions: Arc::new(Mutex::new(SubscriptionRegistry::default())),
            ws_task: Mutex::new(None),
        }
    }

    fn realtime_url(&self) -> Result<String> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid base url: {}", self.base_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("base url must be http or https, got {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("failed to derive websocket scheme"))?;
        url.set_path("/ws");
        url.set_query(Some(&format!("user_id={}", self.user_id.0)));
        Ok(url.into())
    }

    /// Opens the realtime websocket and spawns the reader loop if one is
    /// not already running. Subscriptions register their senders before
    /// calling this so no early event is dropped.
    async fn ensure_realtime_started(&self) -> Result<()> {
        let mut task_guard = self.ws_task.lock().await;
        if task_guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let ws_url = self.realtime_url()?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let subscriptions = Arc::clone(&self.subscriptions);
        let task = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => dispatch_event(&subscriptions, event).await,
                        Err(err) => warn!("invalid server event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });
        *task_guard = Some(task);
        Ok(())
    }

    /// Drops the realtime connection and every registered subscription.
    pub async fn disconnect(&self) {
        if let Some(task) = self.ws_task.lock().await.take() {
            task.abort();
        }
        let mut registry = self.subscriptions.lock().await;
        registry.conversations = None;
        registry.messages.clear();
        registry.read_status.clear();
    }
}

async fn dispatch_event(subscriptions: &Mutex<SubscriptionRegistry>, event: ServerEvent) {
    let mut registry = subscriptions.lock().await;
    match event {
        ServerEvent::ConversationsChanged { conversation_id } => {
            let stale = match registry.conversations.clone() {
                Some(tx) => tx.send(ConversationSignal { conversation_id }).await.is_err(),
                None => false,
            };
            if stale {
                // receiver gone: that subscription was dropped
                registry.conversations = None;
            }
        }
        ServerEvent::MessageReceived { message } => {
            let conversation_id = message.conversation_id;
            let stale = match registry.messages.get(&conversation_id).cloned() {
                Some(tx) => tx.send(message).await.is_err(),
                None => false,
            };
            if stale {
                registry.messages.remove(&conversation_id);
            }
        }
        ServerEvent::ReadStatusChanged {
            conversation_id,
            message_id,
            is_read,
        } => {
            let stale = match registry.read_status.get(&conversation_id).cloned() {
                Some(tx) => {
                    let change = ReadStatusChange {
                        conversation_id,
                        message_id,
                        is_read,
                    };
                    tx.send(change).await.is_err()
                }
                None => false,
            };
            if stale {
                registry.read_status.remove(&conversation_id);
            }
        }
        ServerEvent::Error(err) => {
            warn!(code = ?err.code, "server pushed error event: {}", err.message);
        }
    }
}

#[async_trait]
impl ConversationService for RestConversationService {
    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn conversation(&self, conversation_id: ConversationId) -> Result<ConversationSummary> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}",
                self.base_url, conversation_id.0
            ))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn open_conversation(
        &self,
        user_id: UserId,
        other_user_id: UserId,
    ) -> Result<ConversationId> {
        let response = self
            .http
            .post(format!("{}/conversations", self.base_url))
            .json(&OpenConversationRequest {
                user_id: user_id.0,
                other_user_id: other_user_id.0,
            })
            .send()
            .await?;
        let opened: OpenConversationResponse = check_status(response).await?.json().await?;
        Ok(opened.conversation_id)
    }

    async fn messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let limit = limit.clamp(1, 100);
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .query(&ListMessagesQuery {
                user_id: self.user_id.0,
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_text(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .json(&SendTextRequest {
                sender_id: sender_id.0,
                content: content.to_string(),
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_media(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        upload: MediaUpload,
    ) -> Result<MessagePayload> {
        let mut query = vec![
            ("sender_id", sender_id.0.to_string()),
            ("filename", upload.filename.clone()),
            (
                "mime_type",
                upload
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            ),
            ("media_kind", media_kind_slug(upload.media_kind).to_string()),
        ];
        if let Some(caption) = &upload.caption {
            query.push(("caption", caption.clone()));
        }
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/media",
                self.base_url, conversation_id.0
            ))
            .query(&query)
            .body(upload.bytes)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn send_sticker(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        sticker: StickerPayload,
        caption: Option<String>,
    ) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/stickers",
                self.base_url, conversation_id.0
            ))
            .json(&SendStickerRequest {
                sender_id: sender_id.0,
                sticker,
                caption,
            })
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn mark_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/read",
                self.base_url, conversation_id.0
            ))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: MessageId) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/messages/{}", self.base_url, message_id.0))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn unread_count(&self, user_id: UserId) -> Result<u32> {
        let response = self
            .http
            .get(format!("{}/unread_count", self.base_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        let counter: UnreadCountResponse = check_status(response).await?.json().await?;
        Ok(counter.unread)
    }

    async fn subscribe_conversations(
        &self,
        _user_id: UserId,
    ) -> Result<mpsc::Receiver<ConversationSignal>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions.lock().await.conversations = Some(tx);
        self.ensure_realtime_started().await?;
        Ok(rx)
    }

    async fn subscribe_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<MessagePayload>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions
            .lock()
            .await
            .messages
            .insert(conversation_id, tx);
        self.ensure_realtime_started().await?;
        Ok(rx)
    }

    async fn subscribe_read_status(
        &self,
        conversation_id: ConversationId,
    ) -> Result<mpsc::Receiver<ReadStatusChange>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions
            .lock()
            .await
            .read_status
            .insert(conversation_id, tx);
        self.ensure_realtime_started().await?;
        Ok(rx)
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod rest_tests;
