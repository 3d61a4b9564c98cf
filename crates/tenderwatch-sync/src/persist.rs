//! Deduplication against the store plus fixed-size batch insertion.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tenderwatch_core::Tender;
use tenderwatch_storage::{Store, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store unreachable: {0}")]
    Unavailable(#[source] StoreError),
    #[error("existing-record lookup failed: {0}")]
    Lookup(#[source] StoreError),
}

impl PersistError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub inserted: u64,
    /// Duplicates within the batch plus records already in the store.
    pub skipped: u64,
    /// Records lost to failed insert batches.
    pub failed: u64,
    pub failed_batches: usize,
}

pub struct Persister {
    store: Arc<dyn Store>,
    batch_size: usize,
    /// Held from the existing-key lookup through the last insert.
    write_lock: Mutex<()>,
}

impl Persister {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Errors only when the store cannot be reached at all; a failing batch is logged and
    /// the remaining batches still run.
    pub async fn persist(&self, tenders: Vec<Tender>) -> Result<PersistOutcome, PersistError> {
        let mut outcome = PersistOutcome::default();

        let mut seen_titles = HashSet::new();
        let mut seen_urls = HashSet::new();
        let mut unique = Vec::with_capacity(tenders.len());
        for tender in tenders {
            let url_repeat = tender
                .tender_url
                .as_ref()
                .is_some_and(|u| seen_urls.contains(u));
            if url_repeat || !seen_titles.insert(tender.title.clone()) {
                outcome.skipped += 1;
                continue;
            }
            if let Some(url) = &tender.tender_url {
                seen_urls.insert(url.clone());
            }
            unique.push(tender);
        }
        if unique.is_empty() {
            return Ok(outcome);
        }

        let _guard = self.write_lock.lock().await;
        let titles: Vec<String> = unique.iter().map(|t| t.title.clone()).collect();
        let urls: Vec<String> = unique.iter().filter_map(|t| t.tender_url.clone()).collect();
        let existing = self
            .store
            .existing_keys(&titles, &urls)
            .await
            .map_err(|err| {
                if err.is_unavailable() {
                    PersistError::Unavailable(err)
                } else {
                    PersistError::Lookup(err)
                }
            })?;

        let (known, fresh): (Vec<Tender>, Vec<Tender>) = unique
            .into_iter()
            .partition(|t| existing.matches(&t.title, t.tender_url.as_deref()));
        outcome.skipped += known.len() as u64;

        if !known.is_empty() {
            let known_titles: Vec<String> = known.iter().map(|t| t.title.clone()).collect();
            let known_urls: Vec<String> = known.iter().filter_map(|t| t.tender_url.clone()).collect();
            match self
                .store
                .touch_last_seen(&known_titles, &known_urls, Utc::now())
                .await
            {
                Ok(touched) => debug!(touched, "refreshed last-seen on existing tenders"),
                Err(err) => warn!(error = %err, "could not refresh last-seen timestamps"),
            }
        }

        let mut unavailable_batches = 0usize;
        let mut last_unavailable = None;
        let total_batches = fresh.len().div_ceil(self.batch_size);
        for (index, batch) in fresh.chunks(self.batch_size).enumerate() {
            match self.store.insert_tenders(batch).await {
                Ok(written) => outcome.inserted += written,
                Err(err) => {
                    warn!(
                        batch = index + 1,
                        total_batches,
                        size = batch.len(),
                        error = %err,
                        "tender batch insert failed; continuing with remaining batches"
                    );
                    outcome.failed += batch.len() as u64;
                    outcome.failed_batches += 1;
                    if err.is_unavailable() {
                        unavailable_batches += 1;
                        last_unavailable = Some(err);
                    }
                }
            }
        }

        if total_batches > 0 && unavailable_batches == total_batches {
            if let Some(err) = last_unavailable {
                return Err(PersistError::Unavailable(err));
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tenderwatch_core::AffirmativeAction;
    use tenderwatch_storage::MemoryStore;
    use uuid::Uuid;

    use crate::test_store::HookedStore;

    fn tender(title: &str, url: Option<&str>) -> Tender {
        let now = Utc::now();
        Tender {
            id: Uuid::new_v4(),
            source_id: "mygov".into(),
            title: title.into(),
            reference: None,
            description: title.into(),
            requirements: "See tender document".into(),
            deadline: now + Duration::days(14),
            contact: "Not specified".into(),
            category: "General".into(),
            subcategory: None,
            location: "Kenya".into(),
            tender_url: url.map(str::to_string),
            fees: None,
            prerequisites: None,
            points_required: 0,
            affirmative_action: AffirmativeAction::none(),
            created_at: now,
            last_seen_at: now,
        }
    }

    #[tokio::test]
    async fn failing_batch_does_not_stop_the_others() {
        let store = Arc::new(MemoryStore::new());
        store.fail_insert_call(2).await;
        let persister = Persister::new(store.clone(), 10);
        let batch: Vec<Tender> = (0..50).map(|i| tender(&format!("Tender {i}"), None)).collect();

        let outcome = persister.persist(batch).await.unwrap();

        assert_eq!(store.insert_calls().await, 5);
        assert_eq!(outcome.inserted, 40);
        assert_eq!(outcome.failed, 10);
        assert_eq!(outcome.failed_batches, 1);
        assert_eq!(store.count_tenders().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn existing_title_or_url_is_skipped_and_touched() {
        let store = Arc::new(MemoryStore::new());
        let mut old = tender("Road Maintenance", Some("https://x.go.ke/t/1"));
        old.last_seen_at = Utc::now() - Duration::days(3);
        let old_seen = old.last_seen_at;
        store.seed_tender(old).await;

        let persister = Persister::new(store.clone(), DEFAULT_BATCH_SIZE);
        let outcome = persister
            .persist(vec![
                tender("Road Maintenance", None),
                tender("Renamed listing", Some("https://x.go.ke/t/1")),
                tender("Brand new", Some("https://x.go.ke/t/2")),
                tender("Brand new", Some("https://x.go.ke/t/3")),
            ])
            .await
            .unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped, 3);
        let stored = store.tenders().await;
        assert_eq!(stored.len(), 2);
        assert!(stored[0].last_seen_at > old_seen);
    }

    #[tokio::test]
    async fn overlapping_persists_insert_a_tender_once() {
        let store = Arc::new(HookedStore::new().slow_lookups(Duration::milliseconds(20)));
        let persister = Persister::new(store.clone(), DEFAULT_BATCH_SIZE);

        let (first, second) = tokio::join!(
            persister.persist(vec![tender("Supply of Laptops", None)]),
            persister.persist(vec![tender("Supply of Laptops", None)]),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.inserted + second.inserted, 1);
        assert_eq!(first.skipped + second.skipped, 1);
        assert_eq!(store.inner().count_tenders().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_is_a_total_failure() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true).await;
        let persister = Persister::new(store, DEFAULT_BATCH_SIZE);
        let err = persister
            .persist(vec![tender("Anything", None)])
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
