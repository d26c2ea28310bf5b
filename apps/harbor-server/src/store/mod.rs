//! Persistence layer. A `Store` wraps either the in-memory backend (dev and
//! router tests) or Postgres via sqlx; both expose the same locked-commit
//! contract: the owning entity row is locked, the mutation plan is computed
//! against the snapshot visible under that lock, and the log append plus
//! entity stamp land in the same transaction.

mod memory;
mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use harbor_proto::SpaceRole;
use sqlx::PgPool;
use uuid::Uuid;

use crate::updates::{Bucket, LogSlice, SequencedUpdate, UpdatePayload};

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("denied: {0}")]
    Denied(&'static str),
    #[error("not found: {0}")]
    NotFound(&'static str),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Dm,
    Thread,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Dm => "dm",
            ChatKind::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMember {
    pub user_id: Uuid,
    pub role: SpaceRole,
}

/// Chat state as read under the owning row's lock. Carries the membership
/// needed for update-group resolution so the resolver can stay pure.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub id: Uuid,
    pub kind: ChatKind,
    pub space_id: Option<Uuid>,
    pub title: Option<String>,
    pub is_public: bool,
    pub dm_user_a: Option<Uuid>,
    pub dm_user_b: Option<Uuid>,
    pub created_by: Option<Uuid>,
    pub pinned_message_ids: Vec<Uuid>,
    pub update_seq: i64,
    pub last_update_date: Option<DateTime<Utc>>,
    pub participants: Vec<Uuid>,
    pub space_members: Vec<SpaceMember>,
}

impl ChatSnapshot {
    pub fn space_role(&self, user_id: Uuid) -> Option<SpaceRole> {
        self.space_members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.role)
    }

    /// Creator of the thread, or a space admin/owner.
    pub fn can_manage(&self, user_id: Uuid) -> bool {
        if self.created_by == Some(user_id) {
            return true;
        }
        matches!(
            self.space_role(user_id),
            Some(SpaceRole::Owner) | Some(SpaceRole::Admin)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SpaceSnapshot {
    pub id: Uuid,
    pub title: String,
    pub update_seq: i64,
    pub last_update_date: Option<DateTime<Utc>>,
    pub members: Vec<SpaceMember>,
}

impl SpaceSnapshot {
    pub fn role(&self, user_id: Uuid) -> Option<SpaceRole> {
        self.members
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.role)
    }
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub random_id: i64,
    pub body: Vec<u8>,
    pub date: DateTime<Utc>,
    pub edit_date: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Field changes applied to the locked chat (and its dependent rows) inside
/// the committing transaction.
#[derive(Debug, Clone, Default)]
pub struct ChatWrite {
    pub set_title: Option<String>,
    pub set_public: Option<bool>,
    pub set_space: Option<Uuid>,
    pub set_pinned: Option<Vec<Uuid>>,
    pub add_participants: Vec<Uuid>,
    pub remove_participants: Vec<Uuid>,
    pub edit_message: Option<MessageEdit>,
    pub tombstone_messages: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct MessageEdit {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub body: Vec<u8>,
}

/// Output of a mutation's planning phase, computed under the entity lock.
/// `log` is appended to the chat bucket in order; `mailbox` entries go to
/// each listed user's User bucket in the same transaction.
#[derive(Debug, Clone, Default)]
pub struct ChatPlan {
    pub write: ChatWrite,
    pub log: Vec<UpdatePayload>,
    pub mailbox: Vec<(Uuid, UpdatePayload)>,
    pub recipients: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct SpacePlan {
    pub member_upsert: Option<SpaceMember>,
    pub log: Vec<UpdatePayload>,
    pub recipients: Vec<Uuid>,
}

/// Everything the post-commit phase needs: the sequenced entries that were
/// appended, the update group resolved in-transaction, and the data required
/// to encode per recipient.
#[derive(Debug, Clone)]
pub struct Committed {
    pub recipients: Vec<Uuid>,
    pub updates: Vec<SequencedUpdate>,
    pub mailbox: Vec<(Uuid, SequencedUpdate)>,
    pub chat: Option<ChatSnapshot>,
    pub message: Option<MessageRecord>,
    /// True when an idempotency collision was recovered: the previously
    /// committed result is returned and no new log entry exists.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub enum NewChat {
    Dm {
        peer_user_id: Uuid,
    },
    Thread {
        space_id: Uuid,
        title: String,
        is_public: bool,
    },
}

#[derive(Clone)]
pub struct Store {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryStore>),
    Postgres(PgPool),
}

impl Store {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryStore::new())),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn db_pool(&self) -> Option<&PgPool> {
        match &self.backend {
            Backend::Postgres(pool) => Some(pool),
            Backend::Memory(_) => None,
        }
    }

    pub async fn create_space(&self, actor: Uuid, title: &str) -> Result<Uuid, StoreError> {
        if title.trim().is_empty() {
            return Err(StoreError::Validation("title required".into()));
        }
        match &self.backend {
            Backend::Memory(mem) => mem.create_space(actor, title).await,
            Backend::Postgres(pool) => postgres::create_space(pool, actor, title).await,
        }
    }

    pub async fn create_chat(
        &self,
        actor: Uuid,
        new_chat: NewChat,
    ) -> Result<(ChatSnapshot, bool), StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.create_chat(actor, new_chat).await,
            Backend::Postgres(pool) => postgres::create_chat(pool, actor, new_chat).await,
        }
    }

    /// Locked-commit for chat-bucket mutations. Locks the chat row, snapshots
    /// chat state and membership under the lock, lets `plan` decide the field
    /// changes and log payloads, then applies writes, appends log entries and
    /// stamps the chat atomically. `aux_space` additionally snapshots another
    /// space's membership (thread moves need the destination's roster).
    pub async fn commit_chat<F>(
        &self,
        chat_id: Uuid,
        aux_space: Option<Uuid>,
        plan: F,
    ) -> Result<Committed, StoreError>
    where
        F: FnOnce(&ChatSnapshot, Option<&SpaceSnapshot>) -> Result<ChatPlan, StoreError> + Send,
    {
        match &self.backend {
            Backend::Memory(mem) => mem.commit_chat(chat_id, aux_space, plan).await,
            Backend::Postgres(pool) => postgres::commit_chat(pool, chat_id, aux_space, plan).await,
        }
    }

    /// Locked-commit for space-bucket mutations (membership and roles).
    pub async fn commit_space<F>(&self, space_id: Uuid, plan: F) -> Result<Committed, StoreError>
    where
        F: FnOnce(&SpaceSnapshot) -> Result<SpacePlan, StoreError> + Send,
    {
        match &self.backend {
            Backend::Memory(mem) => mem.commit_space(space_id, plan).await,
            Backend::Postgres(pool) => postgres::commit_space(pool, space_id, plan).await,
        }
    }

    /// Insert a message and append its `new_message` entry under the chat
    /// lock. A `(chat_id, sender_id, random_id)` collision is recovered by
    /// returning the previously committed message with `duplicate = true`
    /// and appending nothing.
    pub async fn send_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        random_id: i64,
        body: Vec<u8>,
    ) -> Result<Committed, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.send_message(chat_id, sender_id, random_id, body).await,
            Backend::Postgres(pool) => {
                postgres::send_message(pool, chat_id, sender_id, random_id, body).await
            }
        }
    }

    pub async fn get_updates(
        &self,
        bucket: Bucket,
        start_seq: i64,
        limit: i64,
    ) -> Result<LogSlice, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.get_updates(bucket, start_seq, limit).await,
            Backend::Postgres(pool) => postgres::get_updates(pool, bucket, start_seq, limit).await,
        }
    }

    pub async fn chat_snapshot(&self, chat_id: Uuid) -> Result<ChatSnapshot, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.chat_snapshot(chat_id).await,
            Backend::Postgres(pool) => postgres::chat_snapshot(pool, chat_id).await,
        }
    }

    pub async fn chat_for_message(&self, message_id: Uuid) -> Result<Uuid, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.chat_for_message(message_id).await,
            Backend::Postgres(pool) => postgres::chat_for_message(pool, message_id).await,
        }
    }

    pub async fn dm_chat_for(
        &self,
        user_id: Uuid,
        peer_user_id: Uuid,
    ) -> Result<Option<ChatSnapshot>, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.dm_chat_for(user_id, peer_user_id).await,
            Backend::Postgres(pool) => postgres::dm_chat_for(pool, user_id, peer_user_id).await,
        }
    }

    pub async fn messages_by_ids(
        &self,
        ids: &[Uuid],
    ) -> Result<HashMap<Uuid, MessageRecord>, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.messages_by_ids(ids).await,
            Backend::Postgres(pool) => postgres::messages_by_ids(pool, ids).await,
        }
    }

    pub async fn space_role(
        &self,
        space_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<SpaceRole>, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.space_role(space_id, user_id).await,
            Backend::Postgres(pool) => postgres::space_role(pool, space_id, user_id).await,
        }
    }

    pub async fn space_ids_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        match &self.backend {
            Backend::Memory(mem) => mem.space_ids_for_user(user_id).await,
            Backend::Postgres(pool) => postgres::space_ids_for_user(pool, user_id).await,
        }
    }
}

/// Applies a plan's field changes to an in-memory snapshot. Both backends
/// use this to hand the post-mutation snapshot back to the caller without a
/// re-read.
pub(crate) fn apply_write(snapshot: &mut ChatSnapshot, write: &ChatWrite) {
    if let Some(title) = &write.set_title {
        snapshot.title = Some(title.clone());
    }
    if let Some(public) = write.set_public {
        snapshot.is_public = public;
    }
    if let Some(space_id) = write.set_space {
        snapshot.space_id = Some(space_id);
    }
    if let Some(pinned) = &write.set_pinned {
        snapshot.pinned_message_ids = pinned.clone();
    }
    for user_id in &write.add_participants {
        if !snapshot.participants.contains(user_id) {
            snapshot.participants.push(*user_id);
        }
    }
    snapshot
        .participants
        .retain(|u| !write.remove_participants.contains(u));
}
