//! Process-local state token storage.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{StateBackend, StateRecord, StoreError};

/// State records held in a sharded map.
///
/// Only suitable for a single process: tokens issued here cannot be
/// consumed by another instance.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    records: DashMap<String, StateRecord>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, used or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn insert(&self, record: StateRecord, _ttl: Duration) -> Result<(), StoreError> {
        self.records.insert(record.token.clone(), record);
        Ok(())
    }

    async fn take_unused(&self, token: &str) -> Result<Option<StateRecord>, StoreError> {
        // get_mut holds the shard write lock, so the check and the set
        // cannot interleave with another consumer of the same token.
        let Some(mut entry) = self.records.get_mut(token) else {
            return Ok(None);
        };
        if entry.used {
            return Ok(None);
        }

        let before = entry.clone();
        entry.used = true;
        Ok(Some(before))
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at_ms >= now_ms);
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            trace!(removed, "Purged expired state records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(token: &str, expires_at_ms: u64) -> StateRecord {
        StateRecord {
            token: token.to_string(),
            subject: "0xabc".to_string(),
            session_id: "session-1".to_string(),
            created_at_ms: 0,
            expires_at_ms,
            used: false,
        }
    }

    #[tokio::test]
    async fn test_take_unused_only_once() {
        let backend = MemoryStateBackend::new();
        backend
            .insert(record("t1", 1_000), Duration::from_secs(1))
            .await
            .unwrap();

        let first = backend.take_unused("t1").await.unwrap();
        assert_eq!(first.map(|r| r.subject), Some("0xabc".to_string()));

        assert!(backend.take_unused("t1").await.unwrap().is_none());
        assert!(backend.take_unused("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let backend = MemoryStateBackend::new();
        backend.insert(record("old", 100), Duration::ZERO).await.unwrap();
        backend.insert(record("live", 5_000), Duration::ZERO).await.unwrap();

        let removed = backend.purge_expired(1_000).await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(backend.len(), 1);
        assert!(backend.take_unused("live").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_take_has_single_winner() {
        let backend = Arc::new(MemoryStateBackend::new());
        backend
            .insert(record("shared", u64::MAX), Duration::from_secs(60))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.take_unused("shared").await.unwrap().is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
