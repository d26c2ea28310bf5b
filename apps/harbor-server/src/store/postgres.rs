//! Postgres backend. Sequencing is serialized by `SELECT ... FOR UPDATE` on
//! the owning row (`chat`, `space`, or `user_mailbox`), so correctness holds
//! across replicas; log append and entity stamp always land in the same
//! transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use harbor_proto::SpaceRole;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::updates::resolver;
use crate::updates::{Bucket, BucketKind, LogSlice, SequencedUpdate, UpdatePayload};

use super::{
    apply_write, ChatKind, ChatPlan, ChatSnapshot, Committed, MessageRecord, NewChat, SpaceMember,
    SpacePlan, SpaceSnapshot, StoreError,
};

type Tx<'a> = Transaction<'a, Postgres>;

#[derive(Debug, FromRow)]
struct ChatRow {
    id: Uuid,
    kind: String,
    space_id: Option<Uuid>,
    title: Option<String>,
    is_public: bool,
    dm_user_a: Option<Uuid>,
    dm_user_b: Option<Uuid>,
    created_by: Option<Uuid>,
    pinned_message_ids: Json<Vec<Uuid>>,
    update_seq: i64,
    last_update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct SpaceRow {
    id: Uuid,
    title: String,
    update_seq: i64,
    last_update_date: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct MemberRow {
    user_id: Uuid,
    role: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    chat_id: Uuid,
    sender_id: Uuid,
    random_id: i64,
    body: Vec<u8>,
    date: DateTime<Utc>,
    edit_date: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for MessageRecord {
    fn from(row: MessageRow) -> Self {
        MessageRecord {
            id: row.id,
            chat_id: row.chat_id,
            sender_id: row.sender_id,
            random_id: row.random_id,
            body: row.body,
            date: row.date,
            edit_date: row.edit_date,
            deleted_at: row.deleted_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct UpdateRow {
    bucket_kind: String,
    bucket_id: Uuid,
    seq: i64,
    date: DateTime<Utc>,
    payload: Json<UpdatePayload>,
}

impl UpdateRow {
    fn into_update(self) -> Option<SequencedUpdate> {
        let kind = BucketKind::from_db(&self.bucket_kind)?;
        Some(SequencedUpdate {
            bucket: kind.bucket(self.bucket_id),
            seq: self.seq,
            date: self.date,
            payload: self.payload.0,
        })
    }
}

const CHAT_COLUMNS: &str = "id, kind, space_id, title, is_public, dm_user_a, dm_user_b, \
     created_by, pinned_message_ids, update_seq, last_update_date";

const MESSAGE_COLUMNS: &str =
    "id, chat_id, sender_id, random_id, body, date, edit_date, deleted_at";

fn role_from_db(value: &str) -> SpaceRole {
    match value {
        "owner" => SpaceRole::Owner,
        "admin" => SpaceRole::Admin,
        _ => SpaceRole::Member,
    }
}

fn role_to_db(role: SpaceRole) -> &'static str {
    match role {
        SpaceRole::Owner => "owner",
        SpaceRole::Admin => "admin",
        SpaceRole::Member => "member",
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}

pub async fn create_space(pool: &PgPool, actor: Uuid, title: &str) -> Result<Uuid, StoreError> {
    let mut tx = pool.begin().await?;
    let space_id: Uuid =
        sqlx::query_scalar(r#"INSERT INTO space (title) VALUES ($1) RETURNING id"#)
            .bind(title)
            .fetch_one(tx.as_mut())
            .await?;
    sqlx::query(r#"INSERT INTO space_member (space_id, user_id, role) VALUES ($1, $2, 'owner')"#)
        .bind(space_id)
        .bind(actor)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;
    Ok(space_id)
}

pub async fn create_chat(
    pool: &PgPool,
    actor: Uuid,
    new_chat: NewChat,
) -> Result<(ChatSnapshot, bool), StoreError> {
    match new_chat {
        NewChat::Dm { peer_user_id } => {
            let insert = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO chat (kind, dm_user_a, dm_user_b, created_by)
                VALUES ('dm', $1, $2, $3)
                RETURNING id
                "#,
            )
            .bind(actor)
            .bind(peer_user_id)
            .bind(actor)
            .fetch_one(pool)
            .await;

            match insert {
                Ok(chat_id) => {
                    let mut tx = pool.begin().await?;
                    sqlx::query(
                        r#"
                        INSERT INTO chat_participant (chat_id, user_id)
                        SELECT $1, u FROM UNNEST($2::uuid[]) AS u
                        ON CONFLICT DO NOTHING
                        "#,
                    )
                    .bind(chat_id)
                    .bind(vec![actor, peer_user_id])
                    .execute(tx.as_mut())
                    .await?;
                    tx.commit().await?;
                    let snapshot = chat_snapshot(pool, chat_id).await?;
                    Ok((snapshot, true))
                }
                // Concurrent creation of the same pair: hand back the winner.
                Err(err) if is_unique_violation(&err) => {
                    let existing = dm_chat_for(pool, actor, peer_user_id)
                        .await?
                        .ok_or(StoreError::NotFound("chat"))?;
                    Ok((existing, false))
                }
                Err(err) => Err(err.into()),
            }
        }
        NewChat::Thread {
            space_id,
            title,
            is_public,
        } => {
            if title.trim().is_empty() {
                return Err(StoreError::Validation("title required".into()));
            }
            if space_role(pool, space_id, actor).await?.is_none() {
                return Err(StoreError::Denied("not a space member"));
            }
            let mut tx = pool.begin().await?;
            let chat_id: Uuid = sqlx::query_scalar(
                r#"
                INSERT INTO chat (kind, space_id, title, is_public, created_by)
                VALUES ('thread', $1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(space_id)
            .bind(&title)
            .bind(is_public)
            .bind(actor)
            .fetch_one(tx.as_mut())
            .await?;
            sqlx::query(r#"INSERT INTO chat_participant (chat_id, user_id) VALUES ($1, $2)"#)
                .bind(chat_id)
                .bind(actor)
                .execute(tx.as_mut())
                .await?;
            tx.commit().await?;
            let snapshot = chat_snapshot(pool, chat_id).await?;
            Ok((snapshot, true))
        }
    }
}

pub async fn commit_chat<F>(
    pool: &PgPool,
    chat_id: Uuid,
    aux_space: Option<Uuid>,
    plan: F,
) -> Result<Committed, StoreError>
where
    F: FnOnce(&ChatSnapshot, Option<&SpaceSnapshot>) -> Result<ChatPlan, StoreError> + Send,
{
    let mut tx = pool.begin().await?;
    let snapshot = locked_chat_snapshot(&mut tx, chat_id).await?;
    let aux = match aux_space {
        Some(space_id) => Some(space_snapshot_tx(&mut tx, space_id, false).await?),
        None => None,
    };
    let plan = plan(&snapshot, aux.as_ref())?;

    let mut edited = None;
    if let Some(edit) = &plan.write.edit_message {
        let sender: Option<Uuid> = sqlx::query_scalar(
            r#"SELECT sender_id FROM message WHERE id = $1 AND chat_id = $2 AND deleted_at IS NULL"#,
        )
        .bind(edit.message_id)
        .bind(chat_id)
        .fetch_optional(tx.as_mut())
        .await?;
        match sender {
            None => return Err(StoreError::NotFound("message")),
            Some(sender) if sender != edit.sender_id => {
                return Err(StoreError::Denied("not the sender"))
            }
            Some(_) => {}
        }
        let row: MessageRow = sqlx::query_as(&format!(
            r#"UPDATE message SET body = $1, edit_date = NOW()
               WHERE id = $2 RETURNING {MESSAGE_COLUMNS}"#
        ))
        .bind(&edit.body)
        .bind(edit.message_id)
        .fetch_one(tx.as_mut())
        .await?;
        edited = Some(row.into());
    }
    if !plan.write.tombstone_messages.is_empty() {
        sqlx::query(
            r#"UPDATE message SET deleted_at = NOW()
               WHERE chat_id = $1 AND id = ANY($2) AND deleted_at IS NULL"#,
        )
        .bind(chat_id)
        .bind(&plan.write.tombstone_messages)
        .execute(tx.as_mut())
        .await?;
    }

    if !plan.write.add_participants.is_empty() {
        sqlx::query(
            r#"
            INSERT INTO chat_participant (chat_id, user_id)
            SELECT $1, u FROM UNNEST($2::uuid[]) AS u
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(chat_id)
        .bind(&plan.write.add_participants)
        .execute(tx.as_mut())
        .await?;
    }
    if !plan.write.remove_participants.is_empty() {
        sqlx::query(r#"DELETE FROM chat_participant WHERE chat_id = $1 AND user_id = ANY($2)"#)
            .bind(chat_id)
            .bind(&plan.write.remove_participants)
            .execute(tx.as_mut())
            .await?;
    }

    sqlx::query(
        r#"
        UPDATE chat SET
            title = COALESCE($2, title),
            is_public = COALESCE($3, is_public),
            space_id = COALESCE($4, space_id),
            pinned_message_ids = COALESCE($5, pinned_message_ids)
        WHERE id = $1
        "#,
    )
    .bind(chat_id)
    .bind(&plan.write.set_title)
    .bind(plan.write.set_public)
    .bind(plan.write.set_space)
    .bind(plan.write.set_pinned.clone().map(Json))
    .execute(tx.as_mut())
    .await?;

    let updates =
        append_chat_updates(&mut tx, chat_id, snapshot.update_seq, &plan.log).await?;
    let mailbox = enqueue_mailbox(&mut tx, &plan.mailbox).await?;
    tx.commit().await?;

    let mut after = snapshot;
    apply_write(&mut after, &plan.write);
    if let Some(last) = updates.last() {
        after.update_seq = last.seq;
        after.last_update_date = Some(last.date);
    }
    Ok(Committed {
        recipients: plan.recipients,
        updates,
        mailbox,
        chat: Some(after),
        message: edited,
        duplicate: false,
    })
}

pub async fn commit_space<F>(
    pool: &PgPool,
    space_id: Uuid,
    plan: F,
) -> Result<Committed, StoreError>
where
    F: FnOnce(&SpaceSnapshot) -> Result<SpacePlan, StoreError> + Send,
{
    let mut tx = pool.begin().await?;
    let snapshot = space_snapshot_tx(&mut tx, space_id, true).await?;
    let plan = plan(&snapshot)?;

    if let Some(member) = &plan.member_upsert {
        sqlx::query(
            r#"
            INSERT INTO space_member (space_id, user_id, role)
            VALUES ($1, $2, $3)
            ON CONFLICT (space_id, user_id) DO UPDATE SET role = EXCLUDED.role
            "#,
        )
        .bind(space_id)
        .bind(member.user_id)
        .bind(role_to_db(member.role))
        .execute(tx.as_mut())
        .await?;
    }

    let mut updates = Vec::with_capacity(plan.log.len());
    let mut seq = snapshot.update_seq;
    let mut last_date = None;
    for payload in &plan.log {
        seq += 1;
        let date = Utc::now();
        sqlx::query(
            r#"INSERT INTO update_log (bucket_kind, bucket_id, seq, date, payload)
               VALUES ('space', $1, $2, $3, $4)"#,
        )
        .bind(space_id)
        .bind(seq)
        .bind(date)
        .bind(Json(payload.clone()))
        .execute(tx.as_mut())
        .await?;
        last_date = Some(date);
        updates.push(SequencedUpdate {
            bucket: Bucket::Space(space_id),
            seq,
            date,
            payload: payload.clone(),
        });
    }
    if let Some(date) = last_date {
        sqlx::query(r#"UPDATE space SET update_seq = $2, last_update_date = $3 WHERE id = $1"#)
            .bind(space_id)
            .bind(seq)
            .bind(date)
            .execute(tx.as_mut())
            .await?;
    }
    tx.commit().await?;

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
    pool: &PgPool,
    chat_id: Uuid,
    sender_id: Uuid,
    random_id: i64,
    body: Vec<u8>,
) -> Result<Committed, StoreError> {
    let mut tx = pool.begin().await?;
    let snapshot = locked_chat_snapshot(&mut tx, chat_id).await?;
    let group = resolver::resolve_update_group(&snapshot);
    if !group.recipients.contains(&sender_id) {
        return Err(StoreError::Denied("not a participant"));
    }

    let inserted: Option<MessageRow> = sqlx::query_as(&format!(
        r#"
        INSERT INTO message (chat_id, sender_id, random_id, body)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (chat_id, sender_id, random_id) DO NOTHING
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(chat_id)
    .bind(sender_id)
    .bind(random_id)
    .bind(&body)
    .fetch_optional(tx.as_mut())
    .await?;

    let Some(row) = inserted else {
        // Retried send: recover the committed result, append nothing.
        let existing: MessageRow = sqlx::query_as(&format!(
            r#"SELECT {MESSAGE_COLUMNS} FROM message
               WHERE chat_id = $1 AND sender_id = $2 AND random_id = $3"#
        ))
        .bind(chat_id)
        .bind(sender_id)
        .bind(random_id)
        .fetch_one(tx.as_mut())
        .await?;
        tx.rollback().await?;
        return Ok(Committed {
            recipients: group.recipients,
            updates: Vec::new(),
            mailbox: Vec::new(),
            chat: Some(snapshot),
            message: Some(existing.into()),
            duplicate: true,
        });
    };

    let payload = UpdatePayload::NewMessage {
        chat_id,
        message_id: row.id,
    };
    let updates =
        append_chat_updates(&mut tx, chat_id, snapshot.update_seq, &[payload]).await?;
    tx.commit().await?;

    Ok(Committed {
        recipients: group.recipients,
        updates,
        mailbox: Vec::new(),
        chat: Some(snapshot),
        message: Some(row.into()),
        duplicate: false,
    })
}

pub async fn get_updates(
    pool: &PgPool,
    bucket: Bucket,
    start_seq: i64,
    limit: i64,
) -> Result<LogSlice, StoreError> {
    let rows: Vec<UpdateRow> = sqlx::query_as(
        r#"
        SELECT bucket_kind, bucket_id, seq, date, payload
        FROM update_log
        WHERE bucket_kind = $1 AND bucket_id = $2 AND seq > $3
        ORDER BY seq ASC
        LIMIT $4
        "#,
    )
    .bind(bucket.kind().as_str())
    .bind(bucket.id())
    .bind(start_seq)
    .bind(limit.max(0))
    .fetch_all(pool)
    .await?;

    // Head comes from the entity stamp, the same row the writer updates in
    // the appending transaction.
    let stamp_query = match bucket.kind() {
        BucketKind::Chat => r#"SELECT update_seq, last_update_date FROM chat WHERE id = $1"#,
        BucketKind::Space => r#"SELECT update_seq, last_update_date FROM space WHERE id = $1"#,
        BucketKind::User => {
            r#"SELECT update_seq, last_update_date FROM user_mailbox WHERE user_id = $1"#
        }
    };
    let stamp: Option<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(stamp_query)
        .bind(bucket.id())
        .fetch_optional(pool)
        .await?;
    let (latest_seq, latest_date) = stamp.unwrap_or((0, None));

    Ok(LogSlice {
        entries: rows.into_iter().filter_map(UpdateRow::into_update).collect(),
        latest_seq,
        latest_date,
    })
}

pub async fn chat_snapshot(pool: &PgPool, chat_id: Uuid) -> Result<ChatSnapshot, StoreError> {
    let row: ChatRow =
        sqlx::query_as(&format!(r#"SELECT {CHAT_COLUMNS} FROM chat WHERE id = $1"#))
            .bind(chat_id)
            .fetch_optional(pool)
            .await?
            .ok_or(StoreError::NotFound("chat"))?;
    hydrate_chat(pool, row).await
}

pub async fn chat_for_message(pool: &PgPool, message_id: Uuid) -> Result<Uuid, StoreError> {
    sqlx::query_scalar(r#"SELECT chat_id FROM message WHERE id = $1 AND deleted_at IS NULL"#)
        .bind(message_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::NotFound("message"))
}

pub async fn dm_chat_for(
    pool: &PgPool,
    user_id: Uuid,
    peer_user_id: Uuid,
) -> Result<Option<ChatSnapshot>, StoreError> {
    let row: Option<ChatRow> = sqlx::query_as(&format!(
        r#"
        SELECT {CHAT_COLUMNS} FROM chat
        WHERE kind = 'dm'
          AND LEAST(dm_user_a, dm_user_b) = LEAST($1::uuid, $2::uuid)
          AND GREATEST(dm_user_a, dm_user_b) = GREATEST($1::uuid, $2::uuid)
        "#
    ))
    .bind(user_id)
    .bind(peer_user_id)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Some(hydrate_chat(pool, row).await?)),
        None => Ok(None),
    }
}

pub async fn messages_by_ids(
    pool: &PgPool,
    ids: &[Uuid],
) -> Result<HashMap<Uuid, MessageRecord>, StoreError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<MessageRow> = sqlx::query_as(&format!(
        r#"SELECT {MESSAGE_COLUMNS} FROM message WHERE id = ANY($1)"#
    ))
    .bind(ids)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.id, MessageRecord::from(row)))
        .collect())
}

pub async fn space_role(
    pool: &PgPool,
    space_id: Uuid,
    user_id: Uuid,
) -> Result<Option<SpaceRole>, StoreError> {
    let role: Option<String> = sqlx::query_scalar(
        r#"SELECT role FROM space_member WHERE space_id = $1 AND user_id = $2"#,
    )
    .bind(space_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(role.as_deref().map(role_from_db))
}

pub async fn space_ids_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
    Ok(
        sqlx::query_scalar(r#"SELECT space_id FROM space_member WHERE user_id = $1"#)
            .bind(user_id)
            .fetch_all(pool)
            .await?,
    )
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Locks the chat row and snapshots it with its membership inside the
/// transaction, so update-group resolution never sees membership older than
/// the lock point.
async fn locked_chat_snapshot(tx: &mut Tx<'_>, chat_id: Uuid) -> Result<ChatSnapshot, StoreError> {
    let row: ChatRow = sqlx::query_as(&format!(
        r#"SELECT {CHAT_COLUMNS} FROM chat WHERE id = $1 FOR UPDATE"#
    ))
    .bind(chat_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(StoreError::NotFound("chat"))?;

    let participants: Vec<Uuid> =
        sqlx::query_scalar(r#"SELECT user_id FROM chat_participant WHERE chat_id = $1"#)
            .bind(chat_id)
            .fetch_all(tx.as_mut())
            .await?;
    let space_members = match row.space_id {
        Some(space_id) => fetch_members(tx, space_id).await?,
        None => Vec::new(),
    };
    Ok(build_snapshot(row, participants, space_members))
}

async fn space_snapshot_tx(
    tx: &mut Tx<'_>,
    space_id: Uuid,
    lock: bool,
) -> Result<SpaceSnapshot, StoreError> {
    let query = if lock {
        r#"SELECT id, title, update_seq, last_update_date FROM space WHERE id = $1 FOR UPDATE"#
    } else {
        r#"SELECT id, title, update_seq, last_update_date FROM space WHERE id = $1"#
    };
    let row: SpaceRow = sqlx::query_as(query)
        .bind(space_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(StoreError::NotFound("space"))?;
    let members = fetch_members(tx, space_id).await?;
    Ok(SpaceSnapshot {
        id: row.id,
        title: row.title,
        update_seq: row.update_seq,
        last_update_date: row.last_update_date,
        members,
    })
}

async fn fetch_members(tx: &mut Tx<'_>, space_id: Uuid) -> Result<Vec<SpaceMember>, StoreError> {
    let rows: Vec<MemberRow> =
        sqlx::query_as(r#"SELECT user_id, role FROM space_member WHERE space_id = $1"#)
            .bind(space_id)
            .fetch_all(tx.as_mut())
            .await?;
    Ok(rows
        .into_iter()
        .map(|row| SpaceMember {
            user_id: row.user_id,
            role: role_from_db(&row.role),
        })
        .collect())
}

async fn hydrate_chat(pool: &PgPool, row: ChatRow) -> Result<ChatSnapshot, StoreError> {
    let participants: Vec<Uuid> =
        sqlx::query_scalar(r#"SELECT user_id FROM chat_participant WHERE chat_id = $1"#)
            .bind(row.id)
            .fetch_all(pool)
            .await?;
    let space_members = match row.space_id {
        Some(space_id) => {
            let rows: Vec<MemberRow> =
                sqlx::query_as(r#"SELECT user_id, role FROM space_member WHERE space_id = $1"#)
                    .bind(space_id)
                    .fetch_all(pool)
                    .await?;
            rows.into_iter()
                .map(|r| SpaceMember {
                    user_id: r.user_id,
                    role: role_from_db(&r.role),
                })
                .collect()
        }
        None => Vec::new(),
    };
    Ok(build_snapshot(row, participants, space_members))
}

fn build_snapshot(
    row: ChatRow,
    participants: Vec<Uuid>,
    space_members: Vec<SpaceMember>,
) -> ChatSnapshot {
    ChatSnapshot {
        id: row.id,
        kind: if row.kind == "dm" {
            ChatKind::Dm
        } else {
            ChatKind::Thread
        },
        space_id: row.space_id,
        title: row.title,
        is_public: row.is_public,
        dm_user_a: row.dm_user_a,
        dm_user_b: row.dm_user_b,
        created_by: row.created_by,
        pinned_message_ids: row.pinned_message_ids.0,
        update_seq: row.update_seq,
        last_update_date: row.last_update_date,
        participants,
        space_members,
    }
}

/// Appends entries to the chat bucket and stamps the chat row; the caller
/// already holds the chat's row lock.
async fn append_chat_updates(
    tx: &mut Tx<'_>,
    chat_id: Uuid,
    current_seq: i64,
    payloads: &[UpdatePayload],
) -> Result<Vec<SequencedUpdate>, StoreError> {
    let mut updates = Vec::with_capacity(payloads.len());
    let mut seq = current_seq;
    let mut last_date = None;
    for payload in payloads {
        seq += 1;
        let date = Utc::now();
        sqlx::query(
            r#"INSERT INTO update_log (bucket_kind, bucket_id, seq, date, payload)
               VALUES ('chat', $1, $2, $3, $4)"#,
        )
        .bind(chat_id)
        .bind(seq)
        .bind(date)
        .bind(Json(payload.clone()))
        .execute(tx.as_mut())
        .await?;
        last_date = Some(date);
        updates.push(SequencedUpdate {
            bucket: Bucket::Chat(chat_id),
            seq,
            date,
            payload: payload.clone(),
        });
    }
    if let Some(date) = last_date {
        sqlx::query(r#"UPDATE chat SET update_seq = $2, last_update_date = $3 WHERE id = $1"#)
            .bind(chat_id)
            .bind(seq)
            .bind(date)
            .execute(tx.as_mut())
            .await?;
    }
    Ok(updates)
}

/// Upserts each recipient's mailbox row to claim the next User-bucket seq,
/// then appends the log entry under it. Runs inside the primary mutation's
/// transaction: membership-affecting changes are never best-effort.
async fn enqueue_mailbox(
    tx: &mut Tx<'_>,
    entries: &[(Uuid, UpdatePayload)],
) -> Result<Vec<(Uuid, SequencedUpdate)>, StoreError> {
    let mut out = Vec::with_capacity(entries.len());
    for (user_id, payload) in entries {
        let date = Utc::now();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_mailbox (user_id, update_seq, last_update_date)
            VALUES ($1, 1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET update_seq = user_mailbox.update_seq + 1,
                    last_update_date = EXCLUDED.last_update_date
            RETURNING update_seq
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_one(tx.as_mut())
        .await?;
        sqlx::query(
            r#"INSERT INTO update_log (bucket_kind, bucket_id, seq, date, payload)
               VALUES ('user', $1, $2, $3, $4)"#,
        )
        .bind(user_id)
        .bind(seq)
        .bind(date)
        .bind(Json(payload.clone()))
        .execute(tx.as_mut())
        .await?;
        out.push((
            *user_id,
            SequencedUpdate {
                bucket: Bucket::User(*user_id),
                seq,
                date,
                payload: payload.clone(),
            },
        ));
    }
    Ok(out)
}
