mod auth;
mod chats;
mod spaces;
mod sse;
mod sync;

use axum::{
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::state::AppState;
use crate::store::StoreError;

pub use auth::CurrentUser;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(health_check))
        .route("/metrics", get(sse::prometheus_metrics))
        .route("/v1/spaces", post(spaces::create_space))
        .route("/v1/spaces/:space_id/members", post(spaces::add_member))
        .route(
            "/v1/spaces/:space_id/members/:member_id",
            patch(spaces::change_role),
        )
        .route("/v1/chats", post(chats::create_chat))
        .route("/v1/chats/:chat_id", patch(chats::patch_chat))
        .route("/v1/chats/:chat_id/messages", post(chats::send_message))
        .route(
            "/v1/chats/:chat_id/messages/delete",
            post(chats::delete_messages),
        )
        .route("/v1/messages/:message_id", patch(chats::edit_message))
        .route(
            "/v1/chats/:chat_id/participants",
            post(chats::add_participant),
        )
        .route(
            "/v1/chats/:chat_id/participants/:participant_id",
            delete(chats::remove_participant),
        )
        .route("/v1/chats/:chat_id/pinned", put(chats::set_pinned))
        .route("/v1/chats/:chat_id/mark-unread", post(chats::mark_unread))
        .route("/v1/chats/:chat_id/move", post(chats::move_thread))
        .route("/v1/updates/pull", post(sync::pull_updates))
        .route("/v1/events", get(sse::stream_updates))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    BadRequest(String),
    Internal,
}

pub(crate) fn map_store_err(err: StoreError) -> ApiError {
    match err {
        StoreError::Validation(msg) => ApiError::BadRequest(msg),
        StoreError::Denied(msg) => ApiError::Forbidden(msg),
        StoreError::NotFound(what) => ApiError::NotFound(what),
        StoreError::Database(err) => {
            error!(error = %err, "database error");
            ApiError::Internal
        }
        StoreError::Serde(err) => {
            error!(error = %err, "payload serialization error");
            ApiError::Internal
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                axum::http::StatusCode::UNAUTHORIZED,
                Json(ApiErrorBody {
                    error: "unauthorized",
                    message: None,
                }),
            )
                .into_response(),
            ApiError::Forbidden(msg) => (
                axum::http::StatusCode::FORBIDDEN,
                Json(ApiErrorBody {
                    error: "forbidden",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::Internal => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody {
                    error: "internal",
                    message: None,
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use harbor_proto::PushFrame;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;
    use tower::util::ServiceExt;
    use uuid::Uuid;

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        user: Uuid,
        session: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-harbor-user-id", user.to_string())
            .header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header("x-harbor-session-id", session.to_string());
        }
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::from("{}"),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn drain(rx: &mut broadcast::Receiver<PushFrame>) -> Vec<PushFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    async fn create_dm(app: &Router, actor: Uuid, peer: Uuid) -> Uuid {
        let (status, body) = call(
            app,
            "POST",
            "/v1/chats",
            actor,
            None,
            Some(json!({ "dm": { "peer_user_id": peer } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["chat"]["id"].as_str().unwrap().parse().unwrap()
    }

    async fn send_text(
        app: &Router,
        actor: Uuid,
        session: Option<Uuid>,
        chat_id: Uuid,
        random_id: i64,
        text: &str,
    ) -> Value {
        let (status, body) = call(
            app,
            "POST",
            &format!("/v1/chats/{chat_id}/messages"),
            actor,
            session,
            Some(json!({ "random_id": random_id, "text": text })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    #[tokio::test]
    async fn missing_identity_header_is_unauthorized() {
        let app = build_router(AppState::new());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/spaces")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "title": "eng" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn dm_send_flips_encoding_and_skips_origin_session() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let alice_session = Uuid::new_v4();
        let bob_session = Uuid::new_v4();
        let mut alice_rx = state.connect_session(alice, alice_session).await;
        let mut bob_rx = state.connect_session(bob, bob_session).await;

        let chat_id = create_dm(&app, alice, bob).await;
        let resp = send_text(&app, alice, Some(alice_session), chat_id, 42, "hi bob").await;

        // Self response: reconciliation strictly before the message.
        let updates = resp["updates"].as_array().unwrap();
        assert_eq!(updates[0]["update"]["type"], "update_message_id");
        assert_eq!(updates[0]["update"]["data"]["random_id"], 42);
        assert!(updates[0].get("seq").is_none());
        assert_eq!(updates[1]["update"]["type"], "new_message");
        assert_eq!(updates[1]["seq"], 1);
        assert_eq!(
            updates[1]["update"]["data"]["chat"]["peer_user_id"],
            bob.to_string()
        );
        assert_eq!(updates[1]["update"]["data"]["message"]["out"], true);

        // Bob's live frame is re-encoded for him: peer is Alice, out=false.
        let bob_frames = drain(&mut bob_rx);
        assert_eq!(bob_frames.len(), 1);
        let frame = serde_json::to_value(&bob_frames[0]).unwrap();
        assert_eq!(frame["update"]["type"], "new_message");
        assert_eq!(
            frame["update"]["data"]["chat"]["peer_user_id"],
            alice.to_string()
        );
        assert_eq!(frame["update"]["data"]["message"]["out"], false);
        assert_eq!(frame["update"]["data"]["message"]["text"], "hi bob");

        // The originating session already has the result in the response.
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn duplicate_random_id_collapses_onto_first_message() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;

        let first = send_text(&app, alice, None, chat_id, 7, "once").await;
        let second = send_text(&app, alice, None, chat_id, 7, "once").await;
        assert_eq!(first["message_id"], second["message_id"]);

        // Exactly one log entry exists for the chat bucket.
        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            bob,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["seq"], 1);
    }

    #[tokio::test]
    async fn private_thread_fan_out_excludes_non_participants() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();
        let outsider = Uuid::new_v4();

        let (_, space) = call(
            &app,
            "POST",
            "/v1/spaces",
            owner,
            None,
            Some(json!({ "title": "eng" })),
        )
        .await;
        let space_id: Uuid = space["space_id"].as_str().unwrap().parse().unwrap();
        for user in [member, outsider] {
            let (status, _) = call(
                &app,
                "POST",
                &format!("/v1/spaces/{space_id}/members"),
                owner,
                None,
                Some(json!({ "user_id": user, "role": "member" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, chat) = call(
            &app,
            "POST",
            "/v1/chats",
            owner,
            None,
            Some(json!({ "thread": { "space_id": space_id, "title": "secret", "is_public": false } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let chat_id: Uuid = chat["chat"]["id"].as_str().unwrap().parse().unwrap();
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/participants"),
            owner,
            None,
            Some(json!({ "user_id": member })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut member_rx = state.connect_session(member, Uuid::new_v4()).await;
        let mut outsider_rx = state.connect_session(outsider, Uuid::new_v4()).await;
        send_text(&app, owner, None, chat_id, 1, "confidential").await;

        assert_eq!(drain(&mut member_rx).len(), 1);
        assert!(drain(&mut outsider_rx).is_empty());

        // Pull access follows the same group resolution.
        let (status, _) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            outsider,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn offline_removal_is_recovered_from_the_user_bucket() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let owner = Uuid::new_v4();
        let member = Uuid::new_v4();

        let (_, space) = call(
            &app,
            "POST",
            "/v1/spaces",
            owner,
            None,
            Some(json!({ "title": "ops" })),
        )
        .await;
        let space_id: Uuid = space["space_id"].as_str().unwrap().parse().unwrap();
        call(
            &app,
            "POST",
            &format!("/v1/spaces/{space_id}/members"),
            owner,
            None,
            Some(json!({ "user_id": member, "role": "member" })),
        )
        .await;
        let (_, chat) = call(
            &app,
            "POST",
            "/v1/chats",
            owner,
            None,
            Some(json!({ "thread": { "space_id": space_id, "title": "oncall", "is_public": false } })),
        )
        .await;
        let chat_id: Uuid = chat["chat"]["id"].as_str().unwrap().parse().unwrap();
        call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/participants"),
            owner,
            None,
            Some(json!({ "user_id": member })),
        )
        .await;

        // Give the member a known user-bucket position before the removal.
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/mark-unread"),
            member,
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            "DELETE",
            &format!("/v1/chats/{chat_id}/participants/{member}"),
            owner,
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Offline the whole time; catch-up from the user bucket sees it.
        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            member,
            None,
            Some(json!({ "bucket": "user", "start_seq": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result_type"], "SLICE");
        assert_eq!(body["final"], true);
        let updates = body["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["update"]["type"], "participant_deleted");
        assert_eq!(updates[0]["update"]["data"]["user_id"], member.to_string());
    }

    #[tokio::test]
    async fn going_private_notifies_only_the_excluded() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let owner = Uuid::new_v4();
        let participant = Uuid::new_v4();
        let bystander = Uuid::new_v4();

        let (_, space) = call(
            &app,
            "POST",
            "/v1/spaces",
            owner,
            None,
            Some(json!({ "title": "all-hands" })),
        )
        .await;
        let space_id: Uuid = space["space_id"].as_str().unwrap().parse().unwrap();
        for user in [participant, bystander] {
            call(
                &app,
                "POST",
                &format!("/v1/spaces/{space_id}/members"),
                owner,
                None,
                Some(json!({ "user_id": user, "role": "member" })),
            )
            .await;
        }
        let (_, chat) = call(
            &app,
            "POST",
            "/v1/chats",
            owner,
            None,
            Some(json!({ "thread": { "space_id": space_id, "title": "announce", "is_public": true } })),
        )
        .await;
        let chat_id: Uuid = chat["chat"]["id"].as_str().unwrap().parse().unwrap();
        call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/participants"),
            owner,
            None,
            Some(json!({ "user_id": participant })),
        )
        .await;

        let mut participant_rx = state.connect_session(participant, Uuid::new_v4()).await;
        let mut bystander_rx = state.connect_session(bystander, Uuid::new_v4()).await;

        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/v1/chats/{chat_id}"),
            owner,
            None,
            Some(json!({ "is_public": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Retained participant sees the visibility change on the chat bucket.
        let participant_frames = drain(&mut participant_rx);
        assert_eq!(participant_frames.len(), 1);
        let frame = serde_json::to_value(&participant_frames[0]).unwrap();
        assert_eq!(frame["update"]["type"], "chat_visibility_changed");

        // The excluded member gets a participant_deleted from their mailbox.
        let bystander_frames = drain(&mut bystander_rx);
        assert_eq!(bystander_frames.len(), 1);
        let frame = serde_json::to_value(&bystander_frames[0]).unwrap();
        assert_eq!(frame["update"]["type"], "participant_deleted");
        assert_eq!(
            frame["update"]["data"]["user_id"],
            bystander.to_string()
        );
    }

    #[tokio::test]
    async fn deep_backlog_reports_too_long() {
        let state = AppState::new().with_sync_total_limit(5);
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;
        for i in 1..=10 {
            send_text(&app, alice, None, chat_id, i, "spam").await;
        }

        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            bob,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result_type"], "TOO_LONG");
        assert_eq!(body["seq"], 10);
        assert!(body["updates"].as_array().unwrap().is_empty());
        assert_eq!(body["final"], false);
    }

    #[tokio::test]
    async fn catch_up_slice_matches_live_encoding() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;
        send_text(&app, alice, None, chat_id, 1, "first").await;
        send_text(&app, alice, None, chat_id, 2, "second").await;

        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            bob,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result_type"], "SLICE");
        assert_eq!(body["final"], true);
        assert_eq!(body["seq"], 2);
        let updates = body["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["seq"], 2);
        assert_eq!(updates[0]["update"]["data"]["message"]["text"], "second");
        assert_eq!(updates[0]["update"]["data"]["message"]["out"], false);
        assert_eq!(
            updates[0]["update"]["data"]["chat"]["peer_user_id"],
            alice.to_string()
        );
    }

    #[tokio::test]
    async fn edit_and_delete_flow_through_the_chat_bucket() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;
        let sent = send_text(&app, alice, None, chat_id, 1, "tpyo").await;
        let message_id: Uuid = sent["message_id"].as_str().unwrap().parse().unwrap();

        let mut bob_rx = state.connect_session(bob, Uuid::new_v4()).await;
        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/v1/messages/{message_id}"),
            alice,
            None,
            Some(json!({ "text": "typo" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let frames = drain(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        let frame = serde_json::to_value(&frames[0]).unwrap();
        assert_eq!(frame["update"]["type"], "message_edited");
        assert_eq!(frame["update"]["data"]["message"]["text"], "typo");

        // Bob cannot delete Alice's message in a DM.
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/messages/delete"),
            bob,
            None,
            Some(json!({ "message_ids": [message_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/chats/{chat_id}/messages/delete"),
            alice,
            None,
            Some(json!({ "message_ids": [message_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let frames = drain(&mut bob_rx);
        assert_eq!(frames.len(), 1);
        let frame = serde_json::to_value(&frames[0]).unwrap();
        assert_eq!(frame["update"]["type"], "messages_deleted");

        // A tombstoned message no longer inflates during catch-up.
        let (_, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            bob,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 1
            })),
        )
        .await;
        let types: Vec<&str> = body["updates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["update"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["messages_deleted"]);
    }

    #[tokio::test]
    async fn first_sync_adopts_the_bucket_head() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;
        for i in 1..=3 {
            send_text(&app, alice, None, chat_id, i, "history").await;
        }

        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            bob,
            None,
            Some(json!({
                "bucket": { "chat": { "peer_user_id": alice } },
                "start_seq": 0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result_type"], "EMPTY");
        assert_eq!(body["seq"], 3);
        assert_eq!(body["final"], true);
        assert!(body["updates"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_reconciliation_is_never_replayed_by_catch_up() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let chat_id = create_dm(&app, alice, bob).await;
        send_text(&app, alice, None, chat_id, 1, "first").await;
        let sent = send_text(&app, alice, None, chat_id, 2, "second").await;

        // The sender's own catch-up carries only log-backed entries; the
        // random_id reconciliation lives in the send response alone, and the
        // committed new_message carries the id the client needs.
        let (status, body) = call(
            &app,
            "POST",
            "/v1/updates/pull",
            alice,
            None,
            Some(json!({
                "bucket": { "chat": { "chat_id": chat_id } },
                "start_seq": 1
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let updates = body["updates"].as_array().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates
            .iter()
            .all(|u| u["update"]["type"] != "update_message_id"));
        assert_eq!(updates[0]["update"]["type"], "new_message");
        assert_eq!(
            updates[0]["update"]["data"]["message"]["id"],
            sent["message_id"]
        );
    }

    #[tokio::test]
    async fn only_the_owner_can_change_the_owners_role() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let owner = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let member = Uuid::new_v4();

        let (_, space) = call(
            &app,
            "POST",
            "/v1/spaces",
            owner,
            None,
            Some(json!({ "title": "core" })),
        )
        .await;
        let space_id: Uuid = space["space_id"].as_str().unwrap().parse().unwrap();
        call(
            &app,
            "POST",
            &format!("/v1/spaces/{space_id}/members"),
            owner,
            None,
            Some(json!({ "user_id": admin, "role": "admin" })),
        )
        .await;
        call(
            &app,
            "POST",
            &format!("/v1/spaces/{space_id}/members"),
            owner,
            None,
            Some(json!({ "user_id": member, "role": "member" })),
        )
        .await;

        // Admin authority covers ordinary members.
        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/v1/spaces/{space_id}/members/{member}"),
            admin,
            None,
            Some(json!({ "role": "admin" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // But not the owner.
        let (status, _) = call(
            &app,
            "PATCH",
            &format!("/v1/spaces/{space_id}/members/{owner}"),
            admin,
            None,
            Some(json!({ "role": "member" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
