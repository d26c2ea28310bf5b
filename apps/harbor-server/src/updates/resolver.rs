//! Update-group resolution: who is entitled to observe a bucket's changes.
//!
//! Resolution is pure over a `ChatSnapshot`, and snapshots are taken under
//! the owning row's lock, so a membership change and the group computed for
//! it can never disagree. Resolution runs fresh per mutation because
//! membership is often the thing changing.

use uuid::Uuid;

use crate::store::{ChatKind, ChatSnapshot};
use crate::updates::Bucket;

#[derive(Debug, Clone)]
pub struct UpdateGroup {
    pub bucket: Bucket,
    pub recipients: Vec<Uuid>,
}

pub fn resolve_update_group(chat: &ChatSnapshot) -> UpdateGroup {
    let recipients = match chat.kind {
        // DM: the two sides; a self-DM resolves to exactly one recipient.
        ChatKind::Dm => {
            let mut users = Vec::with_capacity(2);
            if let Some(a) = chat.dm_user_a {
                users.push(a);
            }
            if let Some(b) = chat.dm_user_b {
                if !users.contains(&b) {
                    users.push(b);
                }
            }
            users
        }
        ChatKind::Thread if chat.is_public => {
            chat.space_members.iter().map(|m| m.user_id).collect()
        }
        ChatKind::Thread => chat.participants.clone(),
    };
    UpdateGroup {
        bucket: Bucket::Chat(chat.id),
        recipients,
    }
}

pub fn can_observe(chat: &ChatSnapshot, user_id: Uuid) -> bool {
    resolve_update_group(chat).recipients.contains(&user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SpaceMember;
    use harbor_proto::SpaceRole;

    fn thread(is_public: bool) -> ChatSnapshot {
        ChatSnapshot {
            id: Uuid::new_v4(),
            kind: ChatKind::Thread,
            space_id: Some(Uuid::new_v4()),
            title: Some("general".into()),
            is_public,
            dm_user_a: None,
            dm_user_b: None,
            created_by: None,
            pinned_message_ids: vec![],
            update_seq: 0,
            last_update_date: None,
            participants: vec![],
            space_members: vec![],
        }
    }

    #[test]
    fn self_dm_resolves_to_one_recipient() {
        let me = Uuid::new_v4();
        let mut chat = thread(false);
        chat.kind = ChatKind::Dm;
        chat.space_id = None;
        chat.dm_user_a = Some(me);
        chat.dm_user_b = Some(me);
        let group = resolve_update_group(&chat);
        assert_eq!(group.recipients, vec![me]);
    }

    #[test]
    fn private_thread_uses_explicit_participants() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let outsider = Uuid::new_v4();
        let mut chat = thread(false);
        chat.participants = vec![a, b];
        chat.space_members = vec![
            SpaceMember {
                user_id: a,
                role: SpaceRole::Owner,
            },
            SpaceMember {
                user_id: outsider,
                role: SpaceRole::Member,
            },
        ];
        let group = resolve_update_group(&chat);
        assert!(group.recipients.contains(&a));
        assert!(group.recipients.contains(&b));
        assert!(!group.recipients.contains(&outsider));
    }

    #[test]
    fn public_thread_uses_space_membership() {
        let a = Uuid::new_v4();
        let m = Uuid::new_v4();
        let mut chat = thread(true);
        chat.participants = vec![a];
        chat.space_members = vec![
            SpaceMember {
                user_id: a,
                role: SpaceRole::Admin,
            },
            SpaceMember {
                user_id: m,
                role: SpaceRole::Member,
            },
        ];
        let group = resolve_update_group(&chat);
        assert_eq!(group.recipients.len(), 2);
        assert!(group.recipients.contains(&m));
    }
}
