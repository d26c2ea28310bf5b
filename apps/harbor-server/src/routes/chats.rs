use axum::{
    extract::{Path, State},
    Json,
};
use harbor_proto::{
    AddParticipantRequest, ChatPatchRequest, CreateChatRequest, CreateChatResponse,
    DeleteMessagesRequest, EditMessageRequest, MoveThreadRequest, SendMessageRequest,
    SendMessageResponse, SetPinnedRequest,
};
use serde_json::json;
use uuid::Uuid;

use super::{auth::CurrentUser, map_store_err, ApiResult};
use crate::state::AppState;

pub async fn create_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateChatRequest>,
) -> ApiResult<CreateChatResponse> {
    let resp = state
        .create_chat(user.user_id, req)
        .await
        .map_err(map_store_err)?;
    Ok(Json(resp))
}

pub async fn send_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    let resp = state
        .send_message(user.user_id, user.session_id, chat_id, req)
        .await
        .map_err(map_store_err)?;
    Ok(Json(resp))
}

pub async fn edit_message(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(message_id): Path<Uuid>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .edit_message(user.user_id, user.session_id, message_id, req.text)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn delete_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<DeleteMessagesRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .delete_messages(user.user_id, user.session_id, chat_id, req.message_ids)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn patch_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<ChatPatchRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .patch_chat(user.user_id, user.session_id, chat_id, req)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn add_participant(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<AddParticipantRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .add_participant(user.user_id, user.session_id, chat_id, req.user_id)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((chat_id, participant_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<serde_json::Value> {
    state
        .remove_participant(user.user_id, user.session_id, chat_id, participant_id)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn set_pinned(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<SetPinnedRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .set_pinned(user.user_id, user.session_id, chat_id, req.message_ids)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn mark_unread(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
) -> ApiResult<serde_json::Value> {
    state
        .mark_unread(user.user_id, user.session_id, chat_id)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn move_thread(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(req): Json<MoveThreadRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .move_thread(user.user_id, user.session_id, chat_id, req.space_id)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}
