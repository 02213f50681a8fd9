use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, DeliveryStatus, MediaKind, MessageId, UserId},
    error::ApiError,
};

/// Inbox entry for one conversation. `last_message_*` and `unread_count`
/// are denormalized server-owned fields; clients mirror them, they never
/// derive them locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub counterpart_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

/// Externally hosted sticker reference. Nothing is uploaded for these; the
/// provider serves the media and the payload carries enough metadata to
/// render a placeholder before the asset loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerPayload {
    pub provider: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur_preview: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Exactly one payload kind per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    Media {
        media_kind: MediaKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Sticker {
        sticker: StickerPayload,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    /// Short text used for inbox previews.
    pub fn preview(&self) -> &str {
        match self {
            MessageBody::Text { content } => content,
            MessageBody::Media { media_kind, .. } => match media_kind {
                MediaKind::Image => "[image]",
                MediaKind::Video => "[video]",
            },
            MessageBody::Sticker { .. } => "[sticker]",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: MessageBody,
    pub delivery_status: DeliveryStatus,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadStatusChange {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ConversationsChanged {
        #[serde(default)]
        conversation_id: Option<ConversationId>,
    },
    MessageReceived {
        message: MessagePayload,
    },
    ReadStatusChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        is_read: bool,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_event_uses_tagged_wire_shape() {
        let json = r#"{"type":"read_status_changed","payload":{"conversation_id":4,"message_id":17,"is_read":true}}"#;
        let event: ServerEvent = serde_json::from_str(json).expect("decode");
        match event {
            ServerEvent::ReadStatusChanged {
                conversation_id,
                message_id,
                is_read,
            } => {
                assert_eq!(conversation_id, ConversationId(4));
                assert_eq!(message_id, MessageId(17));
                assert!(is_read);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn delivery_status_is_totally_ordered() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }

    #[test]
    fn media_preview_reflects_kind() {
        let body = MessageBody::Media {
            media_kind: MediaKind::Video,
            url: "https://cdn.example/clip.mp4".to_string(),
            caption: None,
        };
        assert_eq!(body.preview(), "[video]");
    }
}
