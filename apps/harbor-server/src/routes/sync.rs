use axum::{extract::State, Json};
use harbor_proto::{PullUpdatesRequest, PullUpdatesResponse};

use super::{auth::CurrentUser, map_store_err, ApiResult};
use crate::state::AppState;

pub async fn pull_updates(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<PullUpdatesRequest>,
) -> ApiResult<PullUpdatesResponse> {
    let resp = state
        .pull_updates(user.user_id, req)
        .await
        .map_err(map_store_err)?;
    Ok(Json(resp))
}
