//! Application state and the mutation-function layer.
//!
//! Every mutation follows the same three-phase protocol: (1) validate and
//! authorize against pre-mutation state, (2) commit atomically through the
//! store's locked-commit path, (3) best-effort post-commit fan-out to live
//! sessions. Phase 3 failures never roll back phase 2; offline recipients
//! recover through the mailbox and pull sync.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use harbor_proto::{
    BucketSelector, ChatPatchRequest, ChatSelector, CreateChatRequest, CreateChatResponse,
    CreateSpaceRequest, CreateSpaceResponse, PullUpdatesRequest, PullUpdatesResponse, PushFrame,
    SendMessageRequest, SendMessageResponse, SpaceRole, WireUpdate,
};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::{MessageCipher, PassthroughCipher};
use crate::encode::{self, InflateContext};
use crate::metrics;
use crate::registry::{ConnectionRegistry, InMemoryRegistry, RedisRegistry};
use crate::store::{
    ChatKind, ChatPlan, Committed, MessageEdit, NewChat, SpaceMember, SpacePlan, Store, StoreError,
};
use crate::updates::fanout::Fanout;
use crate::updates::pull::{self, SYNC_BATCH_LIMIT};
use crate::updates::resolver;
use crate::updates::{mailbox, Bucket, SequencedUpdate, UpdatePayload};

/// External push-notification sink. Best-effort-once: failures are the
/// sink's problem, never the mutation's.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, user_id: Uuid, update: &WireUpdate);
}

struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, user_id: Uuid, _update: &WireUpdate) {
        debug!(%user_id, "notification suppressed (no sink configured)");
    }
}

#[derive(Clone)]
pub struct AppState {
    store: Store,
    registry: Arc<dyn ConnectionRegistry>,
    fanout: Fanout,
    cipher: Arc<dyn MessageCipher>,
    notifications: Arc<dyn NotificationSink>,
    sync_total_limit: i64,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            store: Store::memory(),
            registry: Arc::new(InMemoryRegistry::new()),
            fanout: Fanout::new(),
            cipher: Arc::new(PassthroughCipher),
            notifications: Arc::new(NoopSink),
            sync_total_limit: pull::DEFAULT_TOTAL_LIMIT,
        }
    }

    pub fn with_db(pool: PgPool) -> Self {
        Self {
            store: Store::postgres(pool),
            ..Self::new()
        }
    }

    pub fn with_redis(mut self, client: redis::Client) -> Self {
        self.registry = Arc::new(RedisRegistry::new(Arc::new(client)));
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn MessageCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    pub fn with_sync_total_limit(mut self, limit: i64) -> Self {
        self.sync_total_limit = limit.max(1);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Session lifecycle (SSE)
    // -----------------------------------------------------------------------

    pub async fn connect_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> broadcast::Receiver<PushFrame> {
        let rx = self.fanout.subscribe(session_id).await;
        self.registry.register(user_id, session_id).await;
        if let Ok(space_ids) = self.store.space_ids_for_user(user_id).await {
            for space_id in space_ids {
                self.registry.register_space_presence(space_id, user_id).await;
            }
        }
        metrics::LIVE_SESSIONS.inc();
        rx
    }

    pub async fn disconnect_session(&self, user_id: Uuid, session_id: Uuid) {
        self.fanout.unsubscribe(session_id).await;
        self.registry.unregister(user_id, session_id).await;
        if self.registry.sessions_for_user(user_id).await.is_empty() {
            if let Ok(space_ids) = self.store.space_ids_for_user(user_id).await {
                for space_id in space_ids {
                    self.registry
                        .unregister_space_presence(space_id, user_id)
                        .await;
                }
            }
        }
        metrics::LIVE_SESSIONS.dec();
    }

    // -----------------------------------------------------------------------
    // Spaces
    // -----------------------------------------------------------------------

    pub async fn create_space(
        &self,
        actor: Uuid,
        req: CreateSpaceRequest,
    ) -> Result<CreateSpaceResponse, StoreError> {
        let space_id = self.store.create_space(actor, &req.title).await?;
        Ok(CreateSpaceResponse { space_id })
    }

    pub async fn add_member(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        space_id: Uuid,
        user_id: Uuid,
        role: SpaceRole,
    ) -> Result<(), StoreError> {
        if role == SpaceRole::Owner {
            return Err(StoreError::Validation("cannot grant owner".into()));
        }
        let committed = self
            .store
            .commit_space(space_id, |space| {
                require_admin(space.role(actor))?;
                let mut recipients: Vec<Uuid> =
                    space.members.iter().map(|m| m.user_id).collect();
                if !recipients.contains(&user_id) {
                    recipients.push(user_id);
                }
                Ok(SpacePlan {
                    member_upsert: Some(SpaceMember { user_id, role }),
                    log: vec![UpdatePayload::MemberRoleChanged {
                        space_id,
                        user_id,
                        role,
                    }],
                    recipients,
                })
            })
            .await?;
        self.fan_out(actor, origin_session, &committed, Some(space_id))
            .await;
        Ok(())
    }

    pub async fn change_role(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        space_id: Uuid,
        user_id: Uuid,
        role: SpaceRole,
    ) -> Result<(), StoreError> {
        if role == SpaceRole::Owner {
            return Err(StoreError::Validation("cannot grant owner".into()));
        }
        let committed = self
            .store
            .commit_space(space_id, |space| {
                require_admin(space.role(actor))?;
                let current = space.role(user_id).ok_or(StoreError::NotFound("member"))?;
                if current == SpaceRole::Owner && space.role(actor) != Some(SpaceRole::Owner) {
                    return Err(StoreError::Denied("space owner required"));
                }
                Ok(SpacePlan {
                    member_upsert: Some(SpaceMember { user_id, role }),
                    log: vec![UpdatePayload::MemberRoleChanged {
                        space_id,
                        user_id,
                        role,
                    }],
                    recipients: space.members.iter().map(|m| m.user_id).collect(),
                })
            })
            .await?;
        self.fan_out(actor, origin_session, &committed, Some(space_id))
            .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    pub async fn create_chat(
        &self,
        actor: Uuid,
        req: CreateChatRequest,
    ) -> Result<CreateChatResponse, StoreError> {
        let new_chat = match req {
            CreateChatRequest::Dm { peer_user_id } => NewChat::Dm { peer_user_id },
            CreateChatRequest::Thread {
                space_id,
                title,
                is_public,
            } => NewChat::Thread {
                space_id,
                title,
                is_public,
            },
        };
        let (snapshot, _created) = self.store.create_chat(actor, new_chat).await?;
        Ok(CreateChatResponse {
            chat: encode::encode_chat(&snapshot, actor),
        })
    }

    pub async fn send_message(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        req: SendMessageRequest,
    ) -> Result<SendMessageResponse, StoreError> {
        if req.text.is_empty() {
            return Err(StoreError::Validation("text required".into()));
        }
        let body = self.cipher.encrypt(req.text.as_bytes());
        let committed = self
            .store
            .send_message(chat_id, actor, req.random_id, body)
            .await?;
        let message = committed
            .message
            .clone()
            .ok_or(StoreError::NotFound("message"))?;

        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;

        // Self response: reconciliation first, then the message itself. The
        // update_message_id frame is ephemeral and carries no seq.
        let chat = committed.chat.as_ref().ok_or(StoreError::NotFound("chat"))?;
        let mut updates = vec![PushFrame {
            seq: None,
            date: None,
            update: WireUpdate::UpdateMessageId {
                chat_id,
                random_id: req.random_id,
                message_id: message.id,
            },
        }];
        if let Some(wire) = encode::encode_message(&message, actor, self.cipher.as_ref()) {
            updates.push(PushFrame {
                seq: committed.updates.first().map(|e| e.seq),
                date: committed.updates.first().map(|e| e.date),
                update: WireUpdate::NewMessage {
                    chat: encode::encode_chat(chat, actor),
                    message: wire,
                },
            });
        }
        Ok(SendMessageResponse {
            message_id: message.id,
            updates,
        })
    }

    pub async fn edit_message(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        message_id: Uuid,
        text: String,
    ) -> Result<(), StoreError> {
        if text.is_empty() {
            return Err(StoreError::Validation("text required".into()));
        }
        let chat_id = self.store.chat_for_message(message_id).await?;
        let body = self.cipher.encrypt(text.as_bytes());
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                let group = resolver::resolve_update_group(chat);
                if !group.recipients.contains(&actor) {
                    return Err(StoreError::Denied("not a participant"));
                }
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        edit_message: Some(MessageEdit {
                            message_id,
                            sender_id: actor,
                            body,
                        }),
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::MessageEdited {
                        chat_id,
                        message_id,
                    }],
                    mailbox: Vec::new(),
                    recipients: group.recipients,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    pub async fn delete_messages(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Err(StoreError::Validation("message_ids required".into()));
        }
        let messages = self.store.messages_by_ids(&message_ids).await?;
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                let group = resolver::resolve_update_group(chat);
                if !group.recipients.contains(&actor) {
                    return Err(StoreError::Denied("not a participant"));
                }
                for id in &message_ids {
                    let record = messages
                        .get(id)
                        .filter(|m| m.chat_id == chat_id && m.deleted_at.is_none())
                        .ok_or(StoreError::NotFound("message"))?;
                    if record.sender_id != actor && !chat.can_manage(actor) {
                        return Err(StoreError::Denied("cannot delete others' messages"));
                    }
                }
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        tombstone_messages: message_ids.clone(),
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::MessagesDeleted {
                        chat_id,
                        message_ids: message_ids.clone(),
                    }],
                    mailbox: Vec::new(),
                    recipients: group.recipients,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    /// Rename and/or visibility change. Making a public thread private
    /// notifies the pre-change group: members losing access get a
    /// `participant_deleted` update plus a durable mailbox entry; retained
    /// participants do not.
    pub async fn patch_chat(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        req: ChatPatchRequest,
    ) -> Result<(), StoreError> {
        if req.title.is_none() && req.is_public.is_none() {
            return Err(StoreError::Validation("nothing to change".into()));
        }
        if let Some(title) = &req.title {
            if title.trim().is_empty() {
                return Err(StoreError::Validation("title required".into()));
            }
        }
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                if chat.kind != ChatKind::Thread {
                    return Err(StoreError::Validation("cannot modify a dm".into()));
                }
                if !chat.can_manage(actor) {
                    return Err(StoreError::Denied("insufficient role"));
                }
                let old_group = resolver::resolve_update_group(chat).recipients;
                let mut plan = ChatPlan::default();
                if let Some(title) = req.title.clone() {
                    plan.write.set_title = Some(title.clone());
                    plan.log.push(UpdatePayload::ChatRenamed { chat_id, title });
                }
                let mut new_group = old_group.clone();
                if let Some(is_public) = req.is_public {
                    if is_public != chat.is_public {
                        plan.write.set_public = Some(is_public);
                        plan.log.push(UpdatePayload::ChatVisibilityChanged {
                            chat_id,
                            is_public,
                        });
                        if !is_public {
                            // Going private: explicit participants keep
                            // access, everyone else in the old group is out.
                            let excluded = mailbox::visibility_exclusions(
                                &old_group,
                                &chat.participants,
                            );
                            plan.mailbox = mailbox::removal_entries(chat_id, &excluded);
                            new_group = chat.participants.clone();
                        } else {
                            new_group = chat
                                .space_members
                                .iter()
                                .map(|m| m.user_id)
                                .collect();
                        }
                    }
                }
                plan.recipients = new_group;
                Ok(plan)
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    pub async fn add_participant(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), StoreError> {
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                if chat.kind != ChatKind::Thread {
                    return Err(StoreError::Validation("cannot modify a dm".into()));
                }
                let self_join = user_id == actor && chat.is_public;
                if !self_join && !chat.can_manage(actor) {
                    return Err(StoreError::Denied("insufficient role"));
                }
                if chat.participants.contains(&user_id) {
                    return Err(StoreError::Validation("already a participant".into()));
                }
                let mut recipients = resolver::resolve_update_group(chat).recipients;
                if !recipients.contains(&user_id) {
                    recipients.push(user_id);
                }
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        add_participants: vec![user_id],
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::ParticipantAdded { chat_id, user_id }],
                    mailbox: Vec::new(),
                    recipients,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    /// Removal notifies the pre-change group (including the removed user)
    /// and enqueues a durable mailbox entry for the removed user in the
    /// removing transaction.
    pub async fn remove_participant(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), StoreError> {
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                if chat.kind != ChatKind::Thread {
                    return Err(StoreError::Validation("cannot modify a dm".into()));
                }
                if user_id != actor && !chat.can_manage(actor) {
                    return Err(StoreError::Denied("insufficient role"));
                }
                if !chat.participants.contains(&user_id) {
                    return Err(StoreError::NotFound("participant"));
                }
                let old_group = resolver::resolve_update_group(chat).recipients;
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        remove_participants: vec![user_id],
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::ParticipantDeleted { chat_id, user_id }],
                    mailbox: mailbox::removal_entries(chat_id, &[user_id]),
                    recipients: old_group,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    pub async fn set_pinned(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        message_ids: Vec<Uuid>,
    ) -> Result<(), StoreError> {
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                let group = resolver::resolve_update_group(chat);
                let allowed = match chat.kind {
                    ChatKind::Dm => group.recipients.contains(&actor),
                    ChatKind::Thread => chat.can_manage(actor),
                };
                if !allowed {
                    return Err(StoreError::Denied("insufficient role"));
                }
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        set_pinned: Some(message_ids.clone()),
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::PinnedMessagesChanged {
                        chat_id,
                        message_ids: message_ids.clone(),
                    }],
                    mailbox: Vec::new(),
                    recipients: group.recipients,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    /// Cross-device state: lands in the caller's own User bucket so other
    /// devices converge even if offline right now.
    pub async fn mark_unread(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
    ) -> Result<(), StoreError> {
        let committed = self
            .store
            .commit_chat(chat_id, None, |chat, _| {
                let group = resolver::resolve_update_group(chat);
                if !group.recipients.contains(&actor) {
                    return Err(StoreError::Denied("not a participant"));
                }
                Ok(ChatPlan {
                    write: Default::default(),
                    log: Vec::new(),
                    mailbox: vec![(actor, UpdatePayload::MarkedUnread { chat_id })],
                    recipients: vec![actor],
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    pub async fn move_thread(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        chat_id: Uuid,
        space_id: Uuid,
    ) -> Result<(), StoreError> {
        let committed = self
            .store
            .commit_chat(chat_id, Some(space_id), |chat, destination| {
                if chat.kind != ChatKind::Thread {
                    return Err(StoreError::Validation("cannot move a dm".into()));
                }
                if !chat.can_manage(actor) {
                    return Err(StoreError::Denied("insufficient role"));
                }
                let destination = destination.ok_or(StoreError::NotFound("space"))?;
                if destination.role(actor).is_none() {
                    return Err(StoreError::Denied("not a member of target space"));
                }
                let mut recipients = resolver::resolve_update_group(chat).recipients;
                if chat.is_public {
                    for member in &destination.members {
                        if !recipients.contains(&member.user_id) {
                            recipients.push(member.user_id);
                        }
                    }
                }
                Ok(ChatPlan {
                    write: crate::store::ChatWrite {
                        set_space: Some(space_id),
                        ..Default::default()
                    },
                    log: vec![UpdatePayload::ThreadMoved { chat_id, space_id }],
                    mailbox: Vec::new(),
                    recipients,
                })
            })
            .await?;
        self.record_commit(&committed);
        self.fan_out(actor, origin_session, &committed, None).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pull sync
    // -----------------------------------------------------------------------

    pub async fn pull_updates(
        &self,
        actor: Uuid,
        req: PullUpdatesRequest,
    ) -> Result<PullUpdatesResponse, StoreError> {
        if req.start_seq < 0 {
            return Err(StoreError::Validation("start_seq must be >= 0".into()));
        }
        let total_limit = req
            .total_limit
            .unwrap_or(self.sync_total_limit)
            .clamp(1, self.sync_total_limit.max(1));

        // Chat selectors go through the same resolver and access rules as
        // mutations.
        let (bucket, chat) = match &req.bucket {
            BucketSelector::User => (Bucket::User(actor), None),
            BucketSelector::Space { space_id } => {
                if self.store.space_role(*space_id, actor).await?.is_none() {
                    return Err(StoreError::Denied("not a space member"));
                }
                (Bucket::Space(*space_id), None)
            }
            BucketSelector::Chat(selector) => {
                let snapshot = match selector {
                    ChatSelector::ChatId { chat_id } => self.store.chat_snapshot(*chat_id).await?,
                    ChatSelector::PeerUserId { peer_user_id } => self
                        .store
                        .dm_chat_for(actor, *peer_user_id)
                        .await?
                        .ok_or(StoreError::NotFound("chat"))?,
                };
                if !resolver::can_observe(&snapshot, actor) {
                    return Err(StoreError::Denied("not a participant"));
                }
                (Bucket::Chat(snapshot.id), Some(snapshot))
            }
        };

        let page = if req.start_seq == 0 {
            // First sync adopts the head; history comes from bulk fetches.
            let head = self.store.get_updates(bucket, 0, 0).await?;
            pull::first_sync_head(&head)
        } else {
            let slice = self
                .store
                .get_updates(bucket, req.start_seq, SYNC_BATCH_LIMIT)
                .await?;
            pull::classify(slice, req.start_seq, total_limit)
        };
        metrics::PULL_REQUESTS
            .with_label_values(&[result_type_label(page.result_type)])
            .inc();

        let message_ids: Vec<Uuid> = page
            .entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                UpdatePayload::NewMessage { message_id, .. }
                | UpdatePayload::MessageEdited { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect();
        let messages = self.store.messages_by_ids(&message_ids).await?;
        let ctx = InflateContext {
            chat: chat.as_ref(),
            messages: &messages,
        };
        let updates =
            encode::frames_for_viewer(&page.entries, &ctx, actor, self.cipher.as_ref());

        Ok(PullUpdatesResponse {
            updates,
            seq: page.seq,
            date: page.date,
            is_final: page.is_final,
            result_type: page.result_type,
        })
    }

    // -----------------------------------------------------------------------
    // Post-commit side effects
    // -----------------------------------------------------------------------

    fn record_commit(&self, committed: &Committed) {
        for entry in &committed.updates {
            metrics::UPDATES_APPENDED
                .with_label_values(&[entry.bucket.kind().as_str()])
                .inc();
        }
        for _ in &committed.mailbox {
            metrics::UPDATES_APPENDED.with_label_values(&["user"]).inc();
            metrics::MAILBOX_ENQUEUED.inc();
        }
    }

    /// Best-effort live push, strictly after commit. Primary-bucket frames
    /// are re-encoded per recipient; mailbox frames cover users the primary
    /// frames didn't reach. Recipients with no live session fall through to
    /// the notification sink.
    async fn fan_out(
        &self,
        actor: Uuid,
        origin_session: Option<Uuid>,
        committed: &Committed,
        space_scope: Option<Uuid>,
    ) {
        let messages = commit_messages(committed);
        let ctx = InflateContext {
            chat: committed.chat.as_ref(),
            messages: &messages,
        };
        // Space-scoped pushes consult the registry's presence view; others
        // target the resolved group directly.
        let live_space_users: Option<HashSet<Uuid>> = match space_scope {
            Some(space_id) => Some(
                self.registry
                    .user_ids_for_space(space_id)
                    .await
                    .into_iter()
                    .collect(),
            ),
            None => None,
        };

        let mut pushed: HashSet<Uuid> = HashSet::new();
        if !committed.updates.is_empty() {
            for recipient in &committed.recipients {
                if let Some(live) = &live_space_users {
                    if !live.contains(recipient) {
                        self.notify_offline(*recipient, &committed.updates, &ctx);
                        continue;
                    }
                }
                let frames = encode::frames_for_viewer(
                    &committed.updates,
                    &ctx,
                    *recipient,
                    self.cipher.as_ref(),
                );
                if frames.is_empty() {
                    continue;
                }
                let skip = if *recipient == actor {
                    origin_session
                } else {
                    None
                };
                let delivered = self
                    .fanout
                    .push_to_user(self.registry.as_ref(), *recipient, &frames, skip)
                    .await;
                pushed.insert(*recipient);
                if delivered == 0 && *recipient != actor {
                    self.notify_offline(*recipient, &committed.updates, &ctx);
                }
            }
        }

        for (user_id, entry) in &committed.mailbox {
            if pushed.contains(user_id) {
                continue;
            }
            let frames =
                encode::frames_for_viewer(std::slice::from_ref(entry), &ctx, *user_id, self.cipher.as_ref());
            if frames.is_empty() {
                continue;
            }
            let skip = if *user_id == actor {
                origin_session
            } else {
                None
            };
            let _ = self
                .fanout
                .push_to_user(self.registry.as_ref(), *user_id, &frames, skip)
                .await;
        }
    }

    fn notify_offline(
        &self,
        user_id: Uuid,
        entries: &[SequencedUpdate],
        ctx: &InflateContext<'_>,
    ) {
        if let Some(entry) = entries.last() {
            if let Some(update) =
                encode::inflate(&entry.payload, ctx, user_id, self.cipher.as_ref())
            {
                self.notifications.notify(user_id, &update);
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

fn commit_messages(committed: &Committed) -> HashMap<Uuid, crate::store::MessageRecord> {
    let mut map = HashMap::new();
    if let Some(message) = &committed.message {
        map.insert(message.id, message.clone());
    }
    map
}

fn require_admin(role: Option<SpaceRole>) -> Result<(), StoreError> {
    match role {
        Some(SpaceRole::Owner) | Some(SpaceRole::Admin) => Ok(()),
        Some(SpaceRole::Member) => Err(StoreError::Denied("insufficient role")),
        None => Err(StoreError::Denied("not a space member")),
    }
}

fn result_type_label(result_type: harbor_proto::SyncResultType) -> &'static str {
    match result_type {
        harbor_proto::SyncResultType::Empty => "empty",
        harbor_proto::SyncResultType::Slice => "slice",
        harbor_proto::SyncResultType::TooLong => "too_long",
    }
}
