use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use uuid::Uuid;

use super::ApiError;

/// Caller identity as asserted by the gateway in front of this service.
/// The session id is optional: non-streaming clients may omit it, at the
/// cost of echoed pushes to their own device.
#[derive(Clone, Copy, Debug)]
pub struct CurrentUser {
    pub user_id: Uuid,
    pub session_id: Option<Uuid>,
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id =
            header_uuid(&parts.headers, "x-harbor-user-id").ok_or(ApiError::Unauthorized)?;
        let session_id = header_uuid(&parts.headers, "x-harbor-session-id");
        Ok(CurrentUser {
            user_id,
            session_id,
        })
    }
}

fn header_uuid(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}
