//! In-memory backend. Used when no `DATABASE_URL` is configured and by the
//! router tests. A single write lock over the whole state serializes
//! sequencing, which gives the same observable per-bucket ordering as the
//! Postgres row locks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use harbor_proto::SpaceRole;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::updates::resolver;
use crate::updates::{Bucket, BucketKind, LogSlice, SequencedUpdate, UpdatePayload};

use super::{
    apply_write, ChatKind, ChatPlan, ChatSnapshot, Committed, MessageRecord, NewChat, SpaceMember,
    SpacePlan, SpaceSnapshot, StoreError,
};

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    spaces: HashMap<Uuid, SpaceRec>,
    space_members: HashMap<Uuid, HashMap<Uuid, SpaceRole>>,
    chats: HashMap<Uuid, ChatRec>,
    participants: HashMap<Uuid, Vec<Uuid>>,
    messages: HashMap<Uuid, MessageRecord>,
    dm_index: HashMap<(Uuid, Uuid), Uuid>,
    idempotency: HashMap<(Uuid, Uuid, i64), Uuid>,
    logs: HashMap<(BucketKind, Uuid), Vec<SequencedUpdate>>,
    mailbox_seq: HashMap<Uuid, (i64, Option<DateTime<Utc>>)>,
}

#[derive(Debug, Clone)]
struct SpaceRec {
    id: Uuid,
    title: String,
    update_seq: i64,
    last_update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ChatRec {
    id: Uuid,
    kind: ChatKind,
    space_id: Option<Uuid>,
    title: Option<String>,
    is_public: bool,
    dm_user_a: Option<Uuid>,
    dm_user_b: Option<Uuid>,
    created_by: Option<Uuid>,
    pinned_message_ids: Vec<Uuid>,
    update_seq: i64,
    last_update_date: Option<DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn create_space(&self, actor: Uuid, title: &str) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().await;
        let id = Uuid::new_v4();
        inner.spaces.insert(
            id,
            SpaceRec {
                id,
                title: title.to_string(),
                update_seq: 0,
                last_update_date: None,
            },
        );
        inner
            .space_members
            .entry(id)
            .or_default()
            .insert(actor, SpaceRole::Owner);
        Ok(id)
    }

    pub async fn create_chat(
        &self,
        actor: Uuid,
        new_chat: NewChat,
    ) -> Result<(ChatSnapshot, bool), StoreError> {
        let mut inner = self.inner.write().await;
        match new_chat {
            NewChat::Dm { peer_user_id } => {
                let key = dm_key(actor, peer_user_id);
                if let Some(existing) = inner.dm_index.get(&key).copied() {
                    let snapshot = inner.chat_snapshot(existing)?;
                    return Ok((snapshot, false));
                }
                let id = Uuid::new_v4();
                inner.chats.insert(
                    id,
                    ChatRec {
                        id,
                        kind: ChatKind::Dm,
                        space_id: None,
                        title: None,
                        is_public: false,
                        dm_user_a: Some(actor),
                        dm_user_b: Some(peer_user_id),
                        created_by: Some(actor),
                        pinned_message_ids: Vec::new(),
                        update_seq: 0,
                        last_update_date: None,
                    },
                );
                let mut members = vec![actor];
                if peer_user_id != actor {
                    members.push(peer_user_id);
                }
                inner.participants.insert(id, members);
                inner.dm_index.insert(key, id);
                let snapshot = inner.chat_snapshot(id)?;
                Ok((snapshot, true))
            }
            NewChat::Thread {
                space_id,
                title,
                is_public,
            } => {
                if title.trim().is_empty() {
                    return Err(StoreError::Validation("title required".into()));
                }
                let is_member = inner
                    .space_members
                    .get(&space_id)
                    .map(|m| m.contains_key(&actor))
                    .unwrap_or(false);
                if !is_member {
                    return Err(StoreError::Denied("not a space member"));
                }
                let id = Uuid::new_v4();
                inner.chats.insert(
                    id,
                    ChatRec {
                        id,
                        kind: ChatKind::Thread,
                        space_id: Some(space_id),
                        title: Some(title),
                        is_public,
                        dm_user_a: None,
                        dm_user_b: None,
                        created_by: Some(actor),
                        pinned_message_ids: Vec::new(),
                        update_seq: 0,
                        last_update_date: None,
                    },
                );
                inner.participants.insert(id, vec![actor]);
                let snapshot = inner.chat_snapshot(id)?;
                Ok((snapshot, true))
            }
        }
    }

    pub async fn commit_chat<F>(
        &self,
        chat_id: Uuid,
        aux_space: Option<Uuid>,
        plan: F,
    ) -> Result<Committed, StoreError>
    where
        F: FnOnce(&ChatSnapshot, Option<&SpaceSnapshot>) -> Result<ChatPlan, StoreError> + Send,
    {
        let mut inner = self.inner.write().await;
        let snapshot = inner.chat_snapshot(chat_id)?;
        let aux = match aux_space {
            Some(space_id) => Some(inner.space_snapshot(space_id)?),
            None => None,
        };
        let plan = plan(&snapshot, aux.as_ref())?;

        // Message writes first: a failed edit must abort before any append.
        let mut edited = None;
        if let Some(edit) = &plan.write.edit_message {
            let record = inner
                .messages
                .get_mut(&edit.message_id)
                .filter(|m| m.chat_id == chat_id && m.deleted_at.is_none())
                .ok_or(StoreError::NotFound("message"))?;
            if record.sender_id != edit.sender_id {
                return Err(StoreError::Denied("not the sender"));
            }
            record.body = edit.body.clone();
            record.edit_date = Some(Utc::now());
            edited = Some(record.clone());
        }
        let now = Utc::now();
        for message_id in &plan.write.tombstone_messages {
            if let Some(record) = inner
                .messages
                .get_mut(message_id)
                .filter(|m| m.chat_id == chat_id)
            {
                record.deleted_at = Some(now);
            }
        }

        {
            let members = inner.participants.entry(chat_id).or_default();
            for user_id in &plan.write.add_participants {
                if !members.contains(user_id) {
                    members.push(*user_id);
                }
            }
            members.retain(|u| !plan.write.remove_participants.contains(u));
        }

        let mut updates = Vec::with_capacity(plan.log.len());
        {
            let chat = inner
                .chats
                .get_mut(&chat_id)
                .ok_or(StoreError::NotFound("chat"))?;
            if let Some(title) = &plan.write.set_title {
                chat.title = Some(title.clone());
            }
            if let Some(public) = plan.write.set_public {
                chat.is_public = public;
            }
            if let Some(space_id) = plan.write.set_space {
                chat.space_id = Some(space_id);
            }
            if let Some(pinned) = &plan.write.set_pinned {
                chat.pinned_message_ids = pinned.clone();
            }
            let mut seq = chat.update_seq;
            for payload in &plan.log {
                seq += 1;
                let date = Utc::now();
                chat.update_seq = seq;
                chat.last_update_date = Some(date);
                updates.push(SequencedUpdate {
                    bucket: Bucket::Chat(chat_id),
                    seq,
                    date,
                    payload: payload.clone(),
                });
            }
        }
        for entry in &updates {
            inner
                .logs
                .entry((BucketKind::Chat, chat_id))
                .or_default()
                .push(entry.clone());
        }

        let mailbox = inner.enqueue_mailbox(plan.mailbox);

        let mut after = snapshot;
        apply_write(&mut after, &plan.write);
        Ok(Committed {
            recipients: plan.recipients,
            updates,
            mailbox,
            chat: Some(after),
            message: edited,
            duplicate: false,
        })
    }

    pub async fn commit_space<F>(&self, space_id: Uuid, plan: F) -> Result<Committed, StoreError>
    where
        F: FnOnce(&SpaceSnapshot) -> Result<SpacePlan, StoreError> + Send,
    {
        let mut inner = self.inner.write().await;
        let snapshot = inner.space_snapshot(space_id)?;
        let plan = plan(&snapshot)?;

        if let Some(member) = &plan.member_upsert {
            inner
                .space_members
                .entry(space_id)
                .or_default()
                .insert(member.user_id, member.role);
        }

        let mut updates = Vec::with_capacity(plan.log.len());
        {
            let space = inner
                .spaces
                .get_mut(&space_id)
                .ok_or(StoreError::NotFound("space"))?;
            for payload in &plan.log {
                let seq = space.update_seq + 1;
                let date = Utc::now();
                space.update_seq = seq;
                space.last_update_date = Some(date);
                updates.push(SequencedUpdate {
                    bucket: Bucket::Space(space_id),
                    seq,
                    date,
                    payload: payload.clone(),
                });
            }
        }
        for entry in &updates {
            inner
                .logs
                .entry((BucketKind::Space, space_id))
                .or_default()
                .push(entry.clone());
        }

        Ok(Committed {
            recipients: plan.recipients,
            updates,
            mailbox: Vec::new(),
            chat: None,
            message: None,
            duplicate: false,
        })
    }

    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        random_id: i64,
        body: Vec<u8>,
    ) -> Result<Committed, StoreError> {
        let mut inner = self.inner.write().await;
        let snapshot = inner.chat_snapshot(chat_id)?;
        let group = resolver::resolve_update_group(&snapshot);
        if !group.recipients.contains(&sender_id) {
            return Err(StoreError::Denied("not a participant"));
        }

        // Idempotency: a retried send returns the original commit untouched.
        if let Some(existing) = inner
            .idempotency
            .get(&(chat_id, sender_id, random_id))
            .copied()
        {
            let message = inner
                .messages
                .get(&existing)
                .cloned()
                .ok_or(StoreError::NotFound("message"))?;
            return Ok(Committed {
                recipients: group.recipients,
                updates: Vec::new(),
                mailbox: Vec::new(),
                chat: Some(snapshot),
                message: Some(message),
                duplicate: true,
            });
        }

        let message = MessageRecord {
            id: Uuid::new_v4(),
            chat_id,
            sender_id,
            random_id,
            body,
            date: Utc::now(),
            edit_date: None,
            deleted_at: None,
        };
        inner.messages.insert(message.id, message.clone());
        inner
            .idempotency
            .insert((chat_id, sender_id, random_id), message.id);

        let entry = {
            let chat = inner
                .chats
                .get_mut(&chat_id)
                .ok_or(StoreError::NotFound("chat"))?;
            let seq = chat.update_seq + 1;
            let date = Utc::now();
            chat.update_seq = seq;
            chat.last_update_date = Some(date);
            SequencedUpdate {
                bucket: Bucket::Chat(chat_id),
                seq,
                date,
                payload: UpdatePayload::NewMessage {
                    chat_id,
                    message_id: message.id,
                },
            }
        };
        inner
            .logs
            .entry((BucketKind::Chat, chat_id))
            .or_default()
            .push(entry.clone());

        Ok(Committed {
            recipients: group.recipients,
            updates: vec![entry],
            mailbox: Vec::new(),
            chat: Some(snapshot),
            message: Some(message),
            duplicate: false,
        })
    }

    pub async fn get_updates(
        &self,
        bucket: Bucket,
        start_seq: i64,
        limit: i64,
    ) -> Result<LogSlice, StoreError> {
        let inner = self.inner.read().await;
        let log = inner.logs.get(&(bucket.kind(), bucket.id()));
        let (latest_seq, latest_date) = match log.and_then(|l| l.last()) {
            Some(last) => (last.seq, Some(last.date)),
            None => (0, None),
        };
        let entries = log
            .map(|l| {
                l.iter()
                    .filter(|e| e.seq > start_seq)
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(LogSlice {
            entries,
            latest_seq,
            latest_date,
        })
    }

    pub async fn chat_snapshot(&self, chat_id: Uuid) -> Result<ChatSnapshot, StoreError> {
        self.inner.read().await.chat_snapshot(chat_id)
    }

    pub async fn chat_for_message(&self, message_id: Uuid) -> Result<Uuid, StoreError> {
        self.inner
            .read()
            .await
            .messages
            .get(&message_id)
            .filter(|m| m.deleted_at.is_none())
            .map(|m| m.chat_id)
            .ok_or(StoreError::NotFound("message"))
    }

    pub async fn dm_chat_for(
        &self,
        user_id: Uuid,
        peer_user_id: Uuid,
    ) -> Result<Option<ChatSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        match inner.dm_index.get(&dm_key(user_id, peer_user_id)) {
            Some(chat_id) => Ok(Some(inner.chat_snapshot(*chat_id)?)),
            None => Ok(None),
        }
    }

    pub async fn messages_by_ids(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, MessageRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).map(|m| (*id, m.clone())))
            .collect())
    }

    pub async fn space_role(
        &self,
        space_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<SpaceRole>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .space_members
            .get(&space_id)
            .and_then(|m| m.get(&user_id))
            .copied())
    }

    pub async fn space_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .space_members
            .iter()
            .filter(|(_, members)| members.contains_key(&user_id))
            .map(|(space_id, _)| *space_id)
            .collect())
    }
}

impl Inner {
    fn chat_snapshot(&self, chat_id: Uuid) -> Result<ChatSnapshot, StoreError> {
        let chat = self.chats.get(&chat_id).ok_or(StoreError::NotFound("chat"))?;
        let participants = self.participants.get(&chat_id).cloned().unwrap_or_default();
        let space_members = chat
            .space_id
            .and_then(|space_id| self.space_members.get(&space_id))
            .map(|members| {
                members
                    .iter()
                    .map(|(user_id, role)| SpaceMember {
                        user_id: *user_id,
                        role: *role,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ChatSnapshot {
            id: chat.id,
            kind: chat.kind,
            space_id: chat.space_id,
            title: chat.title.clone(),
            is_public: chat.is_public,
            dm_user_a: chat.dm_user_a,
            dm_user_b: chat.dm_user_b,
            created_by: chat.created_by,
            pinned_message_ids: chat.pinned_message_ids.clone(),
            update_seq: chat.update_seq,
            last_update_date: chat.last_update_date,
            participants,
            space_members,
        })
    }

    fn space_snapshot(&self, space_id: Uuid) -> Result<SpaceSnapshot, StoreError> {
        let space = self
            .spaces
            .get(&space_id)
            .ok_or(StoreError::NotFound("space"))?;
        let members = self
            .space_members
            .get(&space_id)
            .map(|members| {
                members
                    .iter()
                    .map(|(user_id, role)| SpaceMember {
                        user_id: *user_id,
                        role: *role,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(SpaceSnapshot {
            id: space.id,
            title: space.title.clone(),
            update_seq: space.update_seq,
            last_update_date: space.last_update_date,
            members,
        })
    }

    fn enqueue_mailbox(
        &mut self,
        entries: Vec<(Uuid, UpdatePayload)>,
    ) -> Vec<(Uuid, SequencedUpdate)> {
        let mut out = Vec::with_capacity(entries.len());
        for (user_id, payload) in entries {
            let slot = self.mailbox_seq.entry(user_id).or_insert((0, None));
            let seq = slot.0 + 1;
            let date = Utc::now();
            *slot = (seq, Some(date));
            let entry = SequencedUpdate {
                bucket: Bucket::User(user_id),
                seq,
                date,
                payload,
            };
            self.logs
                .entry((BucketKind::User, user_id))
                .or_default()
                .push(entry.clone());
            out.push((user_id, entry));
        }
        out
    }
}

fn dm_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
