//! Realtime fan-out: best-effort delivery of already-committed updates to
//! live sessions. Runs strictly after the mutation's transaction; a failed
//! or missed push is recovered by pull sync, never retried here.

use std::collections::HashMap;
use std::sync::Arc;

use harbor_proto::PushFrame;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::metrics;
use crate::registry::ConnectionRegistry;

const SESSION_CHANNEL_CAPACITY: usize = 256;

/// Per-session push channels. Frames written to one session's channel are
/// delivered in write order, which carries the array-order guarantee (e.g.
/// `update_message_id` strictly before its paired `new_message`).
#[derive(Clone, Default)]
pub struct Fanout {
    channels: Arc<RwLock<HashMap<Uuid, broadcast::Sender<PushFrame>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<PushFrame> {
        let mut channels = self.channels.write().await;
        channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn unsubscribe(&self, session_id: Uuid) {
        self.channels.write().await.remove(&session_id);
    }

    /// Delivers `frames` to every live session of `user_id`, in order,
    /// skipping `skip_session` (the originating session, when it can infer
    /// the result locally). Recipients without a live session silently
    /// no-op; they rely on the mailbox and catch-up sync.
    pub async fn push_to_user(
        &self,
        registry: &dyn ConnectionRegistry,
        user_id: Uuid,
        frames: &[PushFrame],
        skip_session: Option<Uuid>,
    ) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let sessions = registry.sessions_for_user(user_id).await;
        if sessions.is_empty() {
            return 0;
        }
        let channels = self.channels.read().await;
        let mut delivered = 0;
        for session_id in sessions {
            if Some(session_id) == skip_session {
                continue;
            }
            let Some(tx) = channels.get(&session_id) else {
                // Registry lag: the session dropped between lookup and push.
                debug!(%user_id, %session_id, "no live channel for session");
                continue;
            };
            let mut sent = 0;
            for frame in frames {
                if tx.send(frame.clone()).is_err() {
                    break;
                }
                sent += 1;
            }
            if sent > 0 {
                delivered += 1;
                metrics::PUSH_FRAMES_DELIVERED.inc_by(sent);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use harbor_proto::WireUpdate;

    fn frame(chat_id: Uuid, seq: i64) -> PushFrame {
        PushFrame {
            seq: Some(seq),
            date: None,
            update: WireUpdate::MarkedUnread { chat_id },
        }
    }

    #[tokio::test]
    async fn delivers_in_array_order_and_skips_origin_session() {
        let fanout = Fanout::new();
        let registry = InMemoryRegistry::new();
        let user = Uuid::new_v4();
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        registry.register(user, origin).await;
        registry.register(user, other).await;
        let mut origin_rx = fanout.subscribe(origin).await;
        let mut other_rx = fanout.subscribe(other).await;

        let chat_id = Uuid::new_v4();
        let frames = vec![frame(chat_id, 1), frame(chat_id, 2), frame(chat_id, 3)];
        let delivered = fanout
            .push_to_user(&registry, user, &frames, Some(origin))
            .await;
        assert_eq!(delivered, 1);

        for expected in 1..=3 {
            let got = other_rx.try_recv().expect("frame present");
            assert_eq!(got.seq, Some(expected));
        }
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_recipient_is_a_silent_noop() {
        let fanout = Fanout::new();
        let registry = InMemoryRegistry::new();
        let user = Uuid::new_v4();
        let delivered = fanout
            .push_to_user(&registry, user, &[frame(Uuid::new_v4(), 1)], None)
            .await;
        assert_eq!(delivered, 0);
    }
}
