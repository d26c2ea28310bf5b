//! User-bucket mailbox planning. Membership-affecting mutations must leave a
//! durable trace in each affected user's User bucket, in the same
//! transaction as the change itself; this module computes those entry sets.
//! The append is done by the store, never fire-and-forget.

use uuid::Uuid;

use crate::updates::UpdatePayload;

/// Mailbox entries for users removed from a chat: each removed user observes
/// their own `participant_deleted` even if offline at push time.
pub fn removal_entries(chat_id: Uuid, removed: &[Uuid]) -> Vec<(Uuid, UpdatePayload)> {
    removed
        .iter()
        .map(|user_id| {
            (
                *user_id,
                UpdatePayload::ParticipantDeleted {
                    chat_id,
                    user_id: *user_id,
                },
            )
        })
        .collect()
}

/// Users who lose access when a public thread goes private: the pre-change
/// group minus the explicit participants that remain.
pub fn visibility_exclusions(old_group: &[Uuid], retained: &[Uuid]) -> Vec<Uuid> {
    old_group
        .iter()
        .filter(|user_id| !retained.contains(user_id))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusions_are_old_group_minus_retained() {
        let a = Uuid::new_v4();
        let m = Uuid::new_v4();
        let n = Uuid::new_v4();
        let excluded = visibility_exclusions(&[a, m, n], &[a]);
        assert_eq!(excluded, vec![m, n]);
    }

    #[test]
    fn removal_entries_target_each_removed_user() {
        let chat_id = Uuid::new_v4();
        let b = Uuid::new_v4();
        let entries = removal_entries(chat_id, &[b]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, b);
        assert!(matches!(
            entries[0].1,
            UpdatePayload::ParticipantDeleted { user_id, .. } if user_id == b
        ));
    }
}
