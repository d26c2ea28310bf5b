//! Per-viewer wire encoding and log-entry inflation. Stored updates carry
//! minimal identifiers; this module reconstructs the wire-ready shapes from
//! current state, identically for live push and catch-up, so a client sees
//! the same bytes either way.

use std::collections::HashMap;

use harbor_proto::{PushFrame, WireChat, WireMessage, WireUpdate};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::MessageCipher;
use crate::store::{ChatKind, ChatSnapshot, MessageRecord};
use crate::updates::{SequencedUpdate, UpdatePayload};

pub fn encode_chat(chat: &ChatSnapshot, viewer: Uuid) -> WireChat {
    match chat.kind {
        ChatKind::Dm => {
            // The peer is always the other side; a self-DM's peer is the
            // viewer themselves.
            let a = chat.dm_user_a.unwrap_or(viewer);
            let b = chat.dm_user_b.unwrap_or(viewer);
            let peer = if a == viewer { b } else { a };
            WireChat::Dm {
                id: chat.id,
                peer_user_id: peer,
            }
        }
        ChatKind::Thread => WireChat::Thread {
            id: chat.id,
            space_id: chat.space_id.unwrap_or_default(),
            title: chat.title.clone(),
            is_public: chat.is_public,
        },
    }
}

pub fn encode_message(
    record: &MessageRecord,
    viewer: Uuid,
    cipher: &dyn MessageCipher,
) -> Option<WireMessage> {
    let plaintext = match cipher.decrypt(&record.body) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(message_id = %record.id, error = %err, "failed to decrypt message body");
            return None;
        }
    };
    let text = String::from_utf8(plaintext).ok()?;
    Some(WireMessage {
        id: record.id,
        chat_id: record.chat_id,
        sender_id: record.sender_id,
        text,
        date: record.date,
        edit_date: record.edit_date,
        out: record.sender_id == viewer,
    })
}

/// State needed to inflate a batch of log entries. Chat buckets need the
/// chat snapshot and referenced message rows; space and user buckets decode
/// directly.
pub struct InflateContext<'a> {
    pub chat: Option<&'a ChatSnapshot>,
    pub messages: &'a HashMap<Uuid, MessageRecord>,
}

impl InflateContext<'_> {
    fn live_message(&self, message_id: Uuid) -> Option<&MessageRecord> {
        self.messages
            .get(&message_id)
            .filter(|m| m.deleted_at.is_none())
    }
}

/// Inflates one stored payload for one viewer. Returns `None` only when the
/// referenced row is gone (a later tombstone in the same log supersedes the
/// entry); every payload kind is matched exhaustively.
pub fn inflate(
    payload: &UpdatePayload,
    ctx: &InflateContext<'_>,
    viewer: Uuid,
    cipher: &dyn MessageCipher,
) -> Option<WireUpdate> {
    match payload {
        UpdatePayload::NewMessage { message_id, .. } => {
            let chat = ctx.chat?;
            let message = encode_message(ctx.live_message(*message_id)?, viewer, cipher)?;
            Some(WireUpdate::NewMessage {
                chat: encode_chat(chat, viewer),
                message,
            })
        }
        UpdatePayload::MessageEdited { message_id, .. } => {
            let message = encode_message(ctx.live_message(*message_id)?, viewer, cipher)?;
            Some(WireUpdate::MessageEdited { message })
        }
        UpdatePayload::MessagesDeleted {
            chat_id,
            message_ids,
        } => Some(WireUpdate::MessagesDeleted {
            chat_id: *chat_id,
            message_ids: message_ids.clone(),
        }),
        UpdatePayload::ChatRenamed { chat_id, title } => Some(WireUpdate::ChatRenamed {
            chat_id: *chat_id,
            title: title.clone(),
        }),
        UpdatePayload::ChatVisibilityChanged { chat_id, is_public } => {
            Some(WireUpdate::ChatVisibilityChanged {
                chat_id: *chat_id,
                is_public: *is_public,
            })
        }
        UpdatePayload::ParticipantAdded { chat_id, user_id } => {
            Some(WireUpdate::ParticipantAdded {
                chat_id: *chat_id,
                user_id: *user_id,
            })
        }
        UpdatePayload::ParticipantDeleted { chat_id, user_id } => {
            Some(WireUpdate::ParticipantDeleted {
                chat_id: *chat_id,
                user_id: *user_id,
            })
        }
        UpdatePayload::MemberRoleChanged {
            space_id,
            user_id,
            role,
        } => Some(WireUpdate::MemberRoleChanged {
            space_id: *space_id,
            user_id: *user_id,
            role: *role,
        }),
        UpdatePayload::PinnedMessagesChanged {
            chat_id,
            message_ids,
        } => Some(WireUpdate::PinnedMessagesChanged {
            chat_id: *chat_id,
            message_ids: message_ids.clone(),
        }),
        UpdatePayload::MarkedUnread { chat_id } => Some(WireUpdate::MarkedUnread {
            chat_id: *chat_id,
        }),
        UpdatePayload::ThreadMoved { chat_id, space_id } => Some(WireUpdate::ThreadMoved {
            chat_id: *chat_id,
            space_id: *space_id,
        }),
    }
}

/// Inflates a run of sequenced entries into push frames for one viewer,
/// preserving order and seq/date stamps.
pub fn frames_for_viewer(
    entries: &[SequencedUpdate],
    ctx: &InflateContext<'_>,
    viewer: Uuid,
    cipher: &dyn MessageCipher,
) -> Vec<PushFrame> {
    entries
        .iter()
        .filter_map(|entry| {
            inflate(&entry.payload, ctx, viewer, cipher).map(|update| PushFrame {
                seq: Some(entry.seq),
                date: Some(entry.date),
                update,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PassthroughCipher;
    use chrono::Utc;

    fn dm(a: Uuid, b: Uuid) -> ChatSnapshot {
        ChatSnapshot {
            id: Uuid::new_v4(),
            kind: ChatKind::Dm,
            space_id: None,
            title: None,
            is_public: false,
            dm_user_a: Some(a),
            dm_user_b: Some(b),
            created_by: Some(a),
            pinned_message_ids: vec![],
            update_seq: 0,
            last_update_date: None,
            participants: vec![a, b],
            space_members: vec![],
        }
    }

    #[test]
    fn dm_peer_framing_flips_per_viewer() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let chat = dm(a, b);
        let for_a = encode_chat(&chat, a);
        let for_b = encode_chat(&chat, b);
        assert!(matches!(for_a, WireChat::Dm { peer_user_id, .. } if peer_user_id == b));
        assert!(matches!(for_b, WireChat::Dm { peer_user_id, .. } if peer_user_id == a));
    }

    #[test]
    fn out_flag_is_per_viewer() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let record = MessageRecord {
            id: Uuid::new_v4(),
            chat_id: Uuid::new_v4(),
            sender_id: a,
            random_id: 1,
            body: b"hello".to_vec(),
            date: Utc::now(),
            edit_date: None,
            deleted_at: None,
        };
        let cipher = PassthroughCipher;
        let for_a = encode_message(&record, a, &cipher).unwrap();
        let for_b = encode_message(&record, b, &cipher).unwrap();
        assert!(for_a.out);
        assert!(!for_b.out);
        assert_eq!(for_b.text, "hello");
    }

    #[test]
    fn tombstoned_message_does_not_inflate() {
        let a = Uuid::new_v4();
        let chat = dm(a, a);
        let message_id = Uuid::new_v4();
        let mut messages = HashMap::new();
        messages.insert(
            message_id,
            MessageRecord {
                id: message_id,
                chat_id: chat.id,
                sender_id: a,
                random_id: 1,
                body: b"gone".to_vec(),
                date: Utc::now(),
                edit_date: None,
                deleted_at: Some(Utc::now()),
            },
        );
        let ctx = InflateContext {
            chat: Some(&chat),
            messages: &messages,
        };
        let payload = UpdatePayload::NewMessage {
            chat_id: chat.id,
            message_id,
        };
        assert!(inflate(&payload, &ctx, a, &PassthroughCipher).is_none());
    }
}
