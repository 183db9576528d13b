use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GroupId, MessageId, Role};

/// Inbound live-socket frame. The socket only carries text bodies; file
/// messages arrive through the relay webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub body: String,
}

/// One structured error frame, sent before closing a rejected socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub url: String,
    pub filename: String,
    pub is_image: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    pub id: MessageId,
    pub body: Option<String>,
    pub file: Option<FileInfo>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderInfo {
    pub email: String,
    pub nickname: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Outbound fan-out payload: the stored message plus the sender's per-group
/// membership data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFrame {
    pub message: MessageBody,
    pub user: SenderInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipInfo {
    pub user: String,
    pub chat_group: String,
    pub role: Role,
    pub nickname: Option<String>,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_name: String,
    pub groupchat_name: Option<String>,
    pub is_private: bool,
    pub last_message_content: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_sender: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDetail {
    pub group_name: String,
    pub groupchat_name: Option<String>,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub members: Vec<MembershipInfo>,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub group: GroupId,
    pub author: String,
    pub body: Option<String>,
    pub file: Option<FileInfo>,
    pub created: DateTime<Utc>,
}

/// One page of group history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub results: Vec<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_before: Option<MessageId>,
}

/// Webhook batch pushed by the external pub/sub relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayBatch {
    pub channel: String,
    #[serde(default)]
    pub messages: Vec<RelayEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEvent {
    pub name: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Relay-assigned epoch millis; accepted on the wire, creation time stays
    /// server-assigned.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Acknowledgment for a relay batch. Skipped events are operator-visible via
/// logs; the relay itself only sees a success status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAck {
    pub status: String,
    pub processed: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_batch_deserializes_ably_shape() {
        let raw = r#"{
            "channel": "movie-fans",
            "messages": [
                {"name": "new-message", "clientId": "a@x.com", "data": "hi", "timestamp": 1712000000000},
                {"name": "new-file", "clientId": "b@x.com", "data": "[\"p.png\", \"image/png\", \"https://cdn/p.png\"]"}
            ]
        }"#;
        let batch: RelayBatch = serde_json::from_str(raw).expect("batch");
        assert_eq!(batch.channel, "movie-fans");
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].client_id, "a@x.com");
        assert_eq!(batch.messages[0].timestamp, Some(1712000000000));
        assert!(batch.messages[1].timestamp.is_none());
    }

    #[test]
    fn chat_frame_serializes_wire_field_names() {
        let frame = ChatFrame {
            message: MessageBody {
                id: MessageId(7),
                body: Some("hello".into()),
                file: None,
                created: Utc::now(),
            },
            user: SenderInfo {
                email: "a@x.com".into(),
                nickname: None,
                last_read_at: None,
            },
        };
        let value = serde_json::to_value(&frame).expect("json");
        assert_eq!(value["message"]["body"], "hello");
        assert_eq!(value["user"]["email"], "a@x.com");
        assert!(value["message"]["file"].is_null());
    }
}
