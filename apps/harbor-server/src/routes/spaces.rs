use axum::{
    extract::{Path, State},
    Json,
};
use harbor_proto::{AddMemberRequest, ChangeRoleRequest, CreateSpaceRequest, CreateSpaceResponse};
use serde_json::json;
use uuid::Uuid;

use super::{auth::CurrentUser, map_store_err, ApiResult};
use crate::state::AppState;

pub async fn create_space(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<CreateSpaceRequest>,
) -> ApiResult<CreateSpaceResponse> {
    let resp = state
        .create_space(user.user_id, req)
        .await
        .map_err(map_store_err)?;
    Ok(Json(resp))
}

pub async fn add_member(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(space_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .add_member(user.user_id, user.session_id, space_id, req.user_id, req.role)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn change_role(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((space_id, member_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ChangeRoleRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .change_role(user.user_id, user.session_id, space_id, member_id, req.role)
        .await
        .map_err(map_store_err)?;
    Ok(Json(json!({ "ok": true })))
}
