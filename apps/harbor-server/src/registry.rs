//! Connection registry: which sessions are live for a user, and which users
//! are present in a space. Fan-out treats this as best-effort, eventually
//! consistent state; a session that drops a moment before push simply
//! misses the push and relies on catch-up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

const PRESENCE_TTL_SECONDS: usize = 300;

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    async fn register(&self, user_id: Uuid, session_id: Uuid);
    async fn unregister(&self, user_id: Uuid, session_id: Uuid);
    async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Uuid>;
    async fn register_space_presence(&self, space_id: Uuid, user_id: Uuid);
    async fn unregister_space_presence(&self, space_id: Uuid, user_id: Uuid);
    async fn user_ids_for_space(&self, space_id: Uuid) -> Vec<Uuid>;
}

/// Single-instance registry; the default when no Redis is configured.
#[derive(Default)]
pub struct InMemoryRegistry {
    users: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
    spaces: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRegistry for InMemoryRegistry {
    async fn register(&self, user_id: Uuid, session_id: Uuid) {
        self.users
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(session_id);
    }

    async fn unregister(&self, user_id: Uuid, session_id: Uuid) {
        let mut users = self.users.write().await;
        if let Some(sessions) = users.get_mut(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                users.remove(&user_id);
            }
        }
    }

    async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        self.users
            .read()
            .await
            .get(&user_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn register_space_presence(&self, space_id: Uuid, user_id: Uuid) {
        self.spaces
            .write()
            .await
            .entry(space_id)
            .or_default()
            .insert(user_id);
    }

    async fn unregister_space_presence(&self, space_id: Uuid, user_id: Uuid) {
        let mut spaces = self.spaces.write().await;
        if let Some(users) = spaces.get_mut(&space_id) {
            users.remove(&user_id);
            if users.is_empty() {
                spaces.remove(&space_id);
            }
        }
    }

    async fn user_ids_for_space(&self, space_id: Uuid) -> Vec<Uuid> {
        self.spaces
            .read()
            .await
            .get(&space_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Redis-backed registry for multi-replica deployments. All operations are
/// best-effort: failures are logged and degrade to "nobody live", which
/// pull sync covers.
pub struct RedisRegistry {
    client: Arc<redis::Client>,
}

impl RedisRegistry {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    fn user_key(user_id: Uuid) -> String {
        format!("presence:user:{user_id}:sessions")
    }

    fn space_key(space_id: Uuid) -> String {
        format!("presence:space:{space_id}:users")
    }

    async fn sadd(&self, key: String, member: String) {
        match self.client.get_async_connection().await {
            Ok(mut conn) => {
                let result: Result<(), _> = redis::pipe()
                    .sadd(&key, &member)
                    .ignore()
                    .expire(&key, PRESENCE_TTL_SECONDS)
                    .ignore()
                    .query_async(&mut conn)
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, key, "presence registration failed");
                }
            }
            Err(err) => warn!(error = %err, "redis connection failed"),
        }
    }

    async fn srem(&self, key: String, member: String) {
        match self.client.get_async_connection().await {
            Ok(mut conn) => {
                if let Err(err) = conn.srem::<_, _, ()>(&key, &member).await {
                    warn!(error = %err, key, "presence removal failed");
                }
            }
            Err(err) => warn!(error = %err, "redis connection failed"),
        }
    }

    async fn smembers(&self, key: String) -> Vec<Uuid> {
        match self.client.get_async_connection().await {
            Ok(mut conn) => match conn.smembers::<_, Vec<String>>(&key).await {
                Ok(members) => members
                    .iter()
                    .filter_map(|m| Uuid::parse_str(m).ok())
                    .collect(),
                Err(err) => {
                    warn!(error = %err, key, "presence lookup failed");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(error = %err, "redis connection failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl ConnectionRegistry for RedisRegistry {
    async fn register(&self, user_id: Uuid, session_id: Uuid) {
        self.sadd(Self::user_key(user_id), session_id.to_string())
            .await;
    }

    async fn unregister(&self, user_id: Uuid, session_id: Uuid) {
        self.srem(Self::user_key(user_id), session_id.to_string())
            .await;
    }

    async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Uuid> {
        self.smembers(Self::user_key(user_id)).await
    }

    async fn register_space_presence(&self, space_id: Uuid, user_id: Uuid) {
        self.sadd(Self::space_key(space_id), user_id.to_string())
            .await;
    }

    async fn unregister_space_presence(&self, space_id: Uuid, user_id: Uuid) {
        self.srem(Self::space_key(space_id), user_id.to_string())
            .await;
    }

    async fn user_ids_for_space(&self, space_id: Uuid) -> Vec<Uuid> {
        self.smembers(Self::space_key(space_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_tracks_multi_device_sessions() {
        let registry = InMemoryRegistry::new();
        let user = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        registry.register(user, s1).await;
        registry.register(user, s2).await;
        assert_eq!(registry.sessions_for_user(user).await.len(), 2);

        registry.unregister(user, s1).await;
        assert_eq!(registry.sessions_for_user(user).await, vec![s2]);
        registry.unregister(user, s2).await;
        assert!(registry.sessions_for_user(user).await.is_empty());
    }
}
