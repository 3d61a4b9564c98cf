use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tenderwatch_core::{
    DistributionRecord, JobStatus, RunOutcome, RunStatus, ScrapeJob, ScrapeRunLog, Tender,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{ExistingKeys, NewRunLog, Store, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    tenders: Vec<Tender>,
    run_logs: Vec<ScrapeRunLog>,
    jobs: Vec<ScrapeJob>,
    distributions: Vec<DistributionRecord>,
    insert_calls: usize,
    failing_insert_calls: HashSet<usize>,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable("memory store switched offline".into()))
        } else {
            Ok(())
        }
    }
}

/// In-process store for dry runs and tests, with optional fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the n-th (1-based) call to `insert_tenders` fail with a query error.
    pub async fn fail_insert_call(&self, n: usize) {
        self.state.lock().await.failing_insert_calls.insert(n);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    pub async fn insert_calls(&self) -> usize {
        self.state.lock().await.insert_calls
    }

    pub async fn tenders(&self) -> Vec<Tender> {
        self.state.lock().await.tenders.clone()
    }

    pub async fn run_logs(&self) -> Vec<ScrapeRunLog> {
        self.state.lock().await.run_logs.clone()
    }

    pub async fn jobs(&self) -> Vec<ScrapeJob> {
        self.state.lock().await.jobs.clone()
    }

    pub async fn distributions(&self) -> Vec<DistributionRecord> {
        self.state.lock().await.distributions.clone()
    }

    pub async fn seed_tender(&self, tender: Tender) {
        self.state.lock().await.tenders.push(tender);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn existing_keys(
        &self,
        titles: &[String],
        urls: &[String],
    ) -> Result<ExistingKeys, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let mut keys = ExistingKeys::default();
        for tender in &state.tenders {
            let url_hit = tender
                .tender_url
                .as_ref()
                .is_some_and(|u| urls.contains(u));
            if titles.contains(&tender.title) || url_hit {
                keys.titles.insert(tender.title.clone());
                if let Some(url) = &tender.tender_url {
                    keys.urls.insert(url.clone());
                }
            }
        }
        Ok(keys)
    }

    async fn insert_tenders(&self, batch: &[Tender]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.insert_calls += 1;
        let call = state.insert_calls;
        if state.failing_insert_calls.contains(&call) {
            return Err(StoreError::Query(format!("injected failure on insert call {call}")));
        }
        let mut written = 0;
        for tender in batch {
            let clash = state.tenders.iter().any(|existing| {
                existing.title == tender.title
                    || (tender.tender_url.is_some() && existing.tender_url == tender.tender_url)
            });
            if !clash {
                state.tenders.push(tender.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    async fn touch_last_seen(
        &self,
        titles: &[String],
        urls: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut touched = 0;
        for tender in state.tenders.iter_mut() {
            let url_hit = tender
                .tender_url
                .as_ref()
                .is_some_and(|u| urls.contains(u));
            if titles.contains(&tender.title) || url_hit {
                tender.last_seen_at = seen_at;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn count_tenders(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.tenders.len() as i64)
    }

    async fn undistributed_tenders(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Tender>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let posted: HashSet<Uuid> = state
            .distributions
            .iter()
            .filter(|d| d.success)
            .map(|d| d.tender_id)
            .collect();
        let mut out: Vec<Tender> = state
            .tenders
            .iter()
            .filter(|t| t.created_at >= since && !posted.contains(&t.id))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn create_run_log(&self, new: NewRunLog) -> Result<ScrapeRunLog, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let log = ScrapeRunLog {
            id: Uuid::new_v4(),
            source_name: new.source_name,
            status: RunStatus::InProgress,
            records_found: 0,
            records_inserted: 0,
            details: new.details,
            error_message: None,
            parent_log_id: new.parent_log_id,
            created_at: Utc::now(),
            completed_at: None,
        };
        state.run_logs.push(log.clone());
        Ok(log)
    }

    async fn close_run_log(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let Some(log) = state
            .run_logs
            .iter_mut()
            .find(|l| l.id == id && l.status == RunStatus::InProgress)
        else {
            return Ok(false);
        };
        log.status = outcome.status();
        log.completed_at = Some(Utc::now());
        match outcome {
            RunOutcome::Success {
                records_found,
                records_inserted,
                details,
            } => {
                log.records_found = *records_found;
                log.records_inserted = *records_inserted;
                if details.is_some() {
                    log.details = details.clone();
                }
            }
            RunOutcome::Error { message } => log.error_message = Some(message.clone()),
        }
        Ok(true)
    }

    async fn run_log(&self, id: Uuid) -> Result<Option<ScrapeRunLog>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.run_logs.iter().find(|l| l.id == id).cloned())
    }

    async fn run_log_children(&self, parent_id: Uuid) -> Result<Vec<ScrapeRunLog>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .run_logs
            .iter()
            .filter(|l| l.parent_log_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn last_successful_run(
        &self,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .run_logs
            .iter()
            .filter(|l| l.source_name == source_name && l.status == RunStatus::Success)
            .filter_map(|l| l.completed_at)
            .max())
    }

    async fn enqueue_job(&self, source_id: &str, priority: i32) -> Result<ScrapeJob, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let job = ScrapeJob {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            status: JobStatus::Pending,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        let mut pending: Vec<ScrapeJob> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn claim_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::Pending)
        {
            Some(job) => {
                job.status = JobStatus::InProgress;
                job.started_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if let Some(job) = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status == JobStatus::InProgress)
        {
            job.status = status;
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn has_distribution_success(&self, tender_id: Uuid) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .distributions
            .iter()
            .any(|d| d.tender_id == tender_id && d.success))
    }

    async fn record_distribution(&self, record: &DistributionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.distributions.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let store = Arc::new(MemoryStore::new());
        let job_id = store.enqueue_job("mygov", 0).await.unwrap().id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_job(job_id).await.unwrap() }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert!(store.pending_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_log_closes_only_once() {
        let store = MemoryStore::new();
        let log = store.create_run_log(NewRunLog::new("mygov", None)).await.unwrap();
        let first = store
            .close_run_log(
                log.id,
                &RunOutcome::Success {
                    records_found: 4,
                    records_inserted: 2,
                    details: None,
                },
            )
            .await
            .unwrap();
        let second = store
            .close_run_log(log.id, &RunOutcome::Error { message: "late".into() })
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        let stored = store.run_log(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Success);
        assert_eq!(stored.records_inserted, 2);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn insert_skips_rows_clashing_on_natural_key() {
        let store = MemoryStore::new();
        let now = chrono::Utc::now();
        let tender = |title: &str, url: Option<&str>| Tender {
            id: Uuid::new_v4(),
            source_id: "mygov".into(),
            title: title.into(),
            reference: None,
            description: title.into(),
            requirements: "See tender document".into(),
            deadline: now,
            contact: "Not specified".into(),
            category: "General".into(),
            subcategory: None,
            location: "Kenya".into(),
            tender_url: url.map(str::to_string),
            fees: None,
            prerequisites: None,
            points_required: 0,
            affirmative_action: tenderwatch_core::AffirmativeAction::none(),
            created_at: now,
            last_seen_at: now,
        };

        let first = store
            .insert_tenders(&[tender("Road Works", Some("https://x.go.ke/1")), tender("Catering", None)])
            .await
            .unwrap();
        let second = store
            .insert_tenders(&[
                tender("Road Works", None),
                tender("Renamed", Some("https://x.go.ke/1")),
                tender("Fencing", None),
            ])
            .await
            .unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert_eq!(store.count_tenders().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true).await;
        let err = store.count_tenders().await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
