//! Pull-sync classification. The store hands back a bounded slice plus the
//! bucket head; this module decides whether the client sees `EMPTY`, a
//! `SLICE` (with the `final` flag), or the `TOO_LONG` signal telling it to
//! abandon incremental sync and do a full resync.

use chrono::{DateTime, Utc};
use harbor_proto::SyncResultType;

use crate::updates::{LogSlice, SequencedUpdate};

/// Per-request batch cap, independent of the client's `total_limit`. A slow
/// client re-issues paged requests; one call never does unbounded work.
pub const SYNC_BATCH_LIMIT: i64 = 100;
pub const DEFAULT_TOTAL_LIMIT: i64 = 1000;

#[derive(Debug)]
pub struct SyncPage {
    pub entries: Vec<SequencedUpdate>,
    /// Highest seq this response covers; the client's next `start_seq`.
    pub seq: i64,
    pub date: Option<DateTime<Utc>>,
    pub is_final: bool,
    pub result_type: SyncResultType,
}

pub fn classify(slice: LogSlice, start_seq: i64, total_limit: i64) -> SyncPage {
    let backlog = slice.latest_seq.saturating_sub(start_seq);
    if backlog > total_limit {
        // Never a partial slice here: the client should resync wholesale and
        // adopt the head.
        return SyncPage {
            entries: Vec::new(),
            seq: slice.latest_seq,
            date: slice.latest_date,
            is_final: false,
            result_type: SyncResultType::TooLong,
        };
    }
    if slice.entries.is_empty() {
        return SyncPage {
            entries: Vec::new(),
            seq: slice.latest_seq,
            date: slice.latest_date,
            is_final: true,
            result_type: SyncResultType::Empty,
        };
    }
    let last = slice.entries.last().expect("non-empty slice");
    let (seq, date) = (last.seq, Some(last.date));
    let is_final = seq == slice.latest_seq;
    SyncPage {
        entries: slice.entries,
        seq,
        date,
        is_final,
        result_type: SyncResultType::Slice,
    }
}

/// Policy for `start_seq = 0` (a client that has never synced): adopt the
/// bucket head instead of replaying from genesis. Full history comes from
/// bulk-fetch reads, not this log.
pub fn first_sync_head(slice: &LogSlice) -> SyncPage {
    SyncPage {
        entries: Vec::new(),
        seq: slice.latest_seq,
        date: slice.latest_date,
        is_final: true,
        result_type: SyncResultType::Empty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::{Bucket, UpdatePayload};
    use uuid::Uuid;

    fn entries(bucket_id: Uuid, seqs: std::ops::RangeInclusive<i64>) -> Vec<SequencedUpdate> {
        seqs.map(|seq| SequencedUpdate {
            bucket: Bucket::Chat(bucket_id),
            seq,
            date: Utc::now(),
            payload: UpdatePayload::MarkedUnread { chat_id: bucket_id },
        })
        .collect()
    }

    #[test]
    fn too_long_backlog_returns_no_entries() {
        let id = Uuid::new_v4();
        let slice = LogSlice {
            entries: entries(id, 3..=7),
            latest_seq: 500,
            latest_date: Some(Utc::now()),
        };
        let page = classify(slice, 2, 100);
        assert_eq!(page.result_type, SyncResultType::TooLong);
        assert!(page.entries.is_empty());
        assert_eq!(page.seq, 500);
        assert!(!page.is_final);
    }

    #[test]
    fn partial_slice_is_not_final() {
        let id = Uuid::new_v4();
        let slice = LogSlice {
            entries: entries(id, 1..=50),
            latest_seq: 80,
            latest_date: Some(Utc::now()),
        };
        let page = classify(slice, 0, 1000);
        assert_eq!(page.result_type, SyncResultType::Slice);
        assert_eq!(page.seq, 50);
        assert!(!page.is_final);
    }

    #[test]
    fn exact_tail_is_final() {
        let id = Uuid::new_v4();
        let slice = LogSlice {
            entries: entries(id, 41..=80),
            latest_seq: 80,
            latest_date: Some(Utc::now()),
        };
        let page = classify(slice, 40, 1000);
        assert_eq!(page.result_type, SyncResultType::Slice);
        assert_eq!(page.seq, 80);
        assert!(page.is_final);
    }

    #[test]
    fn caught_up_bucket_is_empty_and_final() {
        let slice = LogSlice {
            entries: Vec::new(),
            latest_seq: 12,
            latest_date: Some(Utc::now()),
        };
        let page = classify(slice, 12, 1000);
        assert_eq!(page.result_type, SyncResultType::Empty);
        assert_eq!(page.seq, 12);
        assert!(page.is_final);
    }

    #[test]
    fn paging_covers_backlog_without_gaps_or_duplicates() {
        let id = Uuid::new_v4();
        let all = entries(id, 1..=230);
        let mut start_seq = 0;
        let mut seen = Vec::new();
        loop {
            let batch: Vec<_> = all
                .iter()
                .filter(|e| e.seq > start_seq)
                .take(SYNC_BATCH_LIMIT as usize)
                .cloned()
                .collect();
            let page = classify(
                LogSlice {
                    entries: batch,
                    latest_seq: 230,
                    latest_date: Some(Utc::now()),
                },
                start_seq,
                1000,
            );
            seen.extend(page.entries.iter().map(|e| e.seq));
            start_seq = page.seq;
            if page.is_final {
                break;
            }
        }
        let expected: Vec<i64> = (1..=230).collect();
        assert_eq!(seen, expected);
    }
}
