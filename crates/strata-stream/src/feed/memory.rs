//! In-memory append-only feed with compaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use strata_core::{ChangeEvent, ChangeKind, FeedId, SequenceToken};

use super::{ChangeFeed, FeedBatch, FeedRecord, MalformedRecord};
use crate::error::FeedError;

struct Log {
    records: VecDeque<FeedRecord>,
    next_offset: u64,
    /// Highest token removed by compaction.
    compacted_through: SequenceToken,
}

/// Append-only log used by tests, demos and embedded producers.
///
/// Tokens are plain offsets starting at 1.
pub struct MemoryFeed {
    id: FeedId,
    log: Mutex<Log>,
    unavailable: AtomicBool,
    polls: AtomicUsize,
}

impl MemoryFeed {
    pub fn new(id: FeedId) -> Self {
        Self {
            id,
            log: Mutex::new(Log {
                records: VecDeque::new(),
                next_offset: 1,
                compacted_through: SequenceToken::ZERO,
            }),
            unavailable: AtomicBool::new(false),
            polls: AtomicUsize::new(0),
        }
    }

    /// Append a change and return its token. Payloads that fail schema
    /// validation are kept as malformed records.
    pub fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        change_kind: ChangeKind,
        payload: serde_json::Value,
    ) -> SequenceToken {
        let mut log = self.log.lock();
        let token = SequenceToken::offset(log.next_offset);
        log.next_offset += 1;

        let record = match ChangeEvent::normalize(
            self.id.clone(),
            token,
            entity_type,
            entity_id,
            change_kind,
            payload.clone(),
        ) {
            Ok(event) => FeedRecord::Event(event),
            Err(e) => FeedRecord::Malformed(MalformedRecord {
                token,
                reason: e.to_string(),
                raw: serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                    "change_kind": change_kind.as_str(),
                    "payload": payload,
                }),
            }),
        };
        log.records.push_back(record);
        token
    }

    /// Drop every record up to and including `token`. Consumers positioned
    /// before it can no longer resume.
    pub fn compact_through(&self, token: SequenceToken) {
        let mut log = self.log.lock();
        while log.records.front().is_some_and(|r| r.token() <= token) {
            log.records.pop_front();
        }
        if token > log.compacted_through {
            log.compacted_through = token;
        }
    }

    /// Simulate an outage: polls fail with [`FeedError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of poll calls served, including failed ones.
    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    fn id(&self) -> &FeedId {
        &self.id
    }

    async fn poll(&self, since: Option<SequenceToken>, max: usize) -> Result<FeedBatch, FeedError> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError::unavailable(format!("feed '{}' is offline", self.id)));
        }

        let log = self.log.lock();
        let position = since.unwrap_or(SequenceToken::ZERO);
        if position < log.compacted_through {
            return Err(FeedError::TokenExpired {
                requested: position,
                earliest: log.compacted_through.successor(),
            });
        }

        let records: Vec<FeedRecord> = log
            .records
            .iter()
            .filter(|r| r.token() > position)
            .take(max)
            .cloned()
            .collect();
        let next_token = records.last().map(FeedRecord::token);
        Ok(FeedBatch { records, next_token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed() -> MemoryFeed {
        MemoryFeed::new(FeedId::new("crm").unwrap())
    }

    #[tokio::test]
    async fn test_poll_is_exclusive_and_bounded() {
        let feed = feed();
        for i in 0..5 {
            feed.append("widget", &i.to_string(), ChangeKind::Created, json!({"n": i}));
        }

        let first = feed.poll(None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.next_token, Some(SequenceToken::offset(2)));

        let rest = feed.poll(first.next_token, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest.records[0].token(), SequenceToken::offset(3));

        let empty = feed.poll(rest.next_token, 10).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.next_token, None);
    }

    #[tokio::test]
    async fn test_compaction_expires_old_positions() {
        let feed = feed();
        for i in 0..4 {
            feed.append("widget", &i.to_string(), ChangeKind::Updated, json!({}));
        }
        feed.compact_through(SequenceToken::offset(2));

        let err = feed.poll(Some(SequenceToken::offset(1)), 10).await.unwrap_err();
        assert!(matches!(
            err,
            FeedError::TokenExpired { earliest, .. } if earliest == SequenceToken::offset(3)
        ));
        assert!(feed.poll(None, 10).await.is_err());

        let ok = feed.poll(Some(SequenceToken::offset(2)), 10).await.unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[tokio::test]
    async fn test_schema_failures_become_malformed_records() {
        let feed = feed();
        feed.append("deal", "d1", ChangeKind::Created, json!({"name": "no stage"}));

        let batch = feed.poll(None, 10).await.unwrap();
        match &batch.records[0] {
            FeedRecord::Malformed(record) => {
                assert_eq!(record.token, SequenceToken::offset(1));
                assert_eq!(record.raw["entity_id"], "d1");
            }
            other => panic!("expected malformed record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outage() {
        let feed = feed();
        feed.set_unavailable(true);
        assert!(matches!(feed.poll(None, 1).await, Err(FeedError::Unavailable(_))));
        feed.set_unavailable(false);
        assert!(feed.poll(None, 1).await.is_ok());
        assert_eq!(feed.poll_count(), 2);
    }
}
