//! Harbor wire protocol: request/response and push payload types shared by
//! the server and native clients.
//!
//! Responsibilities:
//! - mutation request/response bodies for the chat functions API
//! - per-viewer encoded chat and message shapes
//! - the sequenced update envelope used by both live push and pull sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single update as delivered to a client, either over the live event
/// stream or from a pull-sync response. `seq`/`date` are present for
/// log-backed updates and absent for ephemeral ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    pub update: WireUpdate,
}

/// Inflated, viewer-ready update payloads. The server re-encodes these per
/// recipient: DM chats and message `out` flags differ between viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireUpdate {
    NewMessage {
        chat: WireChat,
        message: WireMessage,
    },
    MessageEdited {
        message: WireMessage,
    },
    MessagesDeleted {
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
    },
    /// Send reconciliation: maps a client-supplied random id onto the
    /// committed message id. Always delivered before its paired
    /// `new_message`.
    UpdateMessageId {
        chat_id: Uuid,
        random_id: i64,
        message_id: Uuid,
    },
    ChatRenamed {
        chat_id: Uuid,
        title: String,
    },
    ChatVisibilityChanged {
        chat_id: Uuid,
        is_public: bool,
    },
    ParticipantAdded {
        chat_id: Uuid,
        user_id: Uuid,
    },
    ParticipantDeleted {
        chat_id: Uuid,
        user_id: Uuid,
    },
    MemberRoleChanged {
        space_id: Uuid,
        user_id: Uuid,
        role: SpaceRole,
    },
    PinnedMessagesChanged {
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
    },
    MarkedUnread {
        chat_id: Uuid,
    },
    ThreadMoved {
        chat_id: Uuid,
        space_id: Uuid,
    },
}

/// Chat as seen by one viewer. DM framing flips per viewer: `peer_user_id`
/// is always the *other* side (or the viewer themselves for a self-DM).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireChat {
    Dm {
        id: Uuid,
        peer_user_id: Uuid,
    },
    Thread {
        id: Uuid,
        space_id: Uuid,
        title: Option<String>,
        is_public: bool,
    },
}

impl WireChat {
    pub fn id(&self) -> Uuid {
        match self {
            WireChat::Dm { id, .. } => *id,
            WireChat::Thread { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_date: Option<DateTime<Utc>>,
    /// True when the viewer is the sender.
    pub out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceRole {
    Owner,
    Admin,
    Member,
}

// ---------------------------------------------------------------------------
// Pull sync
// ---------------------------------------------------------------------------

/// Selects the ordering domain a pull-sync request reads from. The chat
/// selector accepts either a chat id or a DM peer, resolved server-side with
/// the same access checks as mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketSelector {
    User,
    Space { space_id: Uuid },
    Chat(ChatSelector),
}

/// Untagged: `{"chat_id": ...}` or `{"peer_user_id": ...}` directly under
/// the `chat` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatSelector {
    ChatId { chat_id: Uuid },
    PeerUserId { peer_user_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullUpdatesRequest {
    pub bucket: BucketSelector,
    pub start_seq: i64,
    #[serde(default)]
    pub total_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncResultType {
    Empty,
    Slice,
    TooLong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullUpdatesResponse {
    pub updates: Vec<PushFrame>,
    /// Highest seq covered by this response (or the bucket head when empty).
    pub seq: i64,
    pub date: Option<DateTime<Utc>>,
    #[serde(rename = "final")]
    pub is_final: bool,
    pub result_type: SyncResultType,
}

// ---------------------------------------------------------------------------
// Mutation requests/responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpaceRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpaceResponse {
    pub space_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role: SpaceRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRoleRequest {
    pub role: SpaceRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateChatRequest {
    Dm {
        peer_user_id: Uuid,
    },
    Thread {
        space_id: Uuid,
        title: String,
        is_public: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatResponse {
    pub chat: WireChat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// Client-supplied idempotency token; retries with the same value are
    /// collapsed onto the first committed message.
    pub random_id: i64,
    pub text: String,
}

/// Self-updates embedded in the send response: `update_message_id` followed
/// by `new_message`, in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub updates: Vec<PushFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessagesRequest {
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPatchRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddParticipantRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPinnedRequest {
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveThreadRequest {
    pub space_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_frame_omits_absent_seq() {
        let frame = PushFrame {
            seq: None,
            date: None,
            update: WireUpdate::MarkedUnread {
                chat_id: Uuid::nil(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("seq").is_none());
        assert!(value.get("date").is_none());
        assert_eq!(value["update"]["type"], "marked_unread");
    }

    #[test]
    fn sync_result_type_uses_wire_names() {
        assert_eq!(
            serde_json::to_value(SyncResultType::TooLong).unwrap(),
            serde_json::json!("TOO_LONG")
        );
    }

    #[test]
    fn chat_selector_accepts_flat_shapes() {
        let req: PullUpdatesRequest = serde_json::from_value(serde_json::json!({
            "bucket": { "chat": { "peer_user_id": Uuid::nil() } },
            "start_seq": 5
        }))
        .unwrap();
        assert!(matches!(
            req.bucket,
            BucketSelector::Chat(ChatSelector::PeerUserId { .. })
        ));
        let req: PullUpdatesRequest = serde_json::from_value(serde_json::json!({
            "bucket": "user",
            "start_seq": 0
        }))
        .unwrap();
        assert!(matches!(req.bucket, BucketSelector::User));
    }

    #[test]
    fn final_flag_renames() {
        let resp = PullUpdatesResponse {
            updates: vec![],
            seq: 4,
            date: None,
            is_final: true,
            result_type: SyncResultType::Empty,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["final"], true);
        assert_eq!(value["result_type"], "EMPTY");
    }
}
