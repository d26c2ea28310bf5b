use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_core::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{metrics, state::AppState};

use super::{auth::CurrentUser, ApiError};

pub async fn prometheus_metrics() -> String {
    metrics::export_prometheus()
}

/// Live update stream for one session. Registers the session (and the
/// user's space presence) for the lifetime of the connection; a dropped
/// stream deregisters so fan-out stops targeting it.
pub async fn stream_updates(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session_id = user
        .session_id
        .ok_or_else(|| ApiError::BadRequest("x-harbor-session-id required".into()))?;
    let rx = state.connect_session(user.user_id, session_id).await;
    let guard = DisconnectGuard {
        state,
        user_id: user.user_id,
        session_id,
    };
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let _guard = &guard;
        match msg {
            Ok(frame) => {
                let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".into());
                Some(Ok(Event::default().event("update").data(data)))
            }
            // Lagged receiver: the session overflowed its channel and missed
            // frames; the client recovers via pull sync.
            Err(_) => Some(Ok(Event::default().event("gap").data("{}"))),
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct DisconnectGuard {
    state: AppState,
    user_id: Uuid,
    session_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let user_id = self.user_id;
        let session_id = self.session_id;
        tokio::spawn(async move {
            state.disconnect_session(user_id, session_id).await;
        });
    }
}
