//! Update/sync core types: ordering buckets, the closed set of log payload
//! kinds, and the sequenced entry shape shared by the log store, fan-out and
//! pull sync.

pub mod fanout;
pub mod mailbox;
pub mod pull;
pub mod resolver;

use chrono::{DateTime, Utc};
use harbor_proto::SpaceRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ordering domain. Every bucket owns its own monotonically increasing
/// sequence counter; sequences are never shared across buckets and never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    User(Uuid),
    Space(Uuid),
    Chat(Uuid),
}

impl Bucket {
    pub fn kind(&self) -> BucketKind {
        match self {
            Bucket::User(_) => BucketKind::User,
            Bucket::Space(_) => BucketKind::Space,
            Bucket::Chat(_) => BucketKind::Chat,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Bucket::User(id) | Bucket::Space(id) | Bucket::Chat(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    User,
    Space,
    Chat,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::User => "user",
            BucketKind::Space => "space",
            BucketKind::Chat => "chat",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "user" => Some(BucketKind::User),
            "space" => Some(BucketKind::Space),
            "chat" => Some(BucketKind::Chat),
            _ => None,
        }
    }

    pub fn bucket(&self, id: Uuid) -> Bucket {
        match self {
            BucketKind::User => Bucket::User(id),
            BucketKind::Space => Bucket::Space(id),
            BucketKind::Chat => Bucket::Chat(id),
        }
    }
}

/// Stored log payloads. Minimal identifiers only: the log is replayed and
/// inflated against current state at read time, never frozen at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdatePayload {
    NewMessage {
        chat_id: Uuid,
        message_id: Uuid,
    },
    MessageEdited {
        chat_id: Uuid,
        message_id: Uuid,
    },
    MessagesDeleted {
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
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

/// One committed, immutable entry in a bucket's log.
#[derive(Debug, Clone)]
pub struct SequencedUpdate {
    pub bucket: Bucket,
    pub seq: i64,
    pub date: DateTime<Utc>,
    pub payload: UpdatePayload,
}

/// Slice of a bucket's log plus the bucket head, so callers can detect
/// remaining backlog without a second query.
#[derive(Debug, Clone)]
pub struct LogSlice {
    pub entries: Vec<SequencedUpdate>,
    pub latest_seq: i64,
    pub latest_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_json() {
        let payload = UpdatePayload::MessagesDeleted {
            chat_id: Uuid::new_v4(),
            message_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "messages_deleted");
        let back: UpdatePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn bucket_kind_maps_to_db_names() {
        for kind in [BucketKind::User, BucketKind::Space, BucketKind::Chat] {
            assert_eq!(BucketKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(BucketKind::from_db("mailbox"), None);
    }
}
