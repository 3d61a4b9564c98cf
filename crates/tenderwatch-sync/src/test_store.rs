//! Store wrapper for tests that need to widen race windows.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tenderwatch_core::{DistributionRecord, JobStatus, RunOutcome, ScrapeJob, ScrapeRunLog, Tender};
use tenderwatch_storage::{ExistingKeys, MemoryStore, NewRunLog, Store, StoreError};
use uuid::Uuid;

/// Delegates to a [`MemoryStore`]. Optionally sleeps after each existing-key lookup, and
/// optionally lets a competing worker claim every job `pending_jobs` hands out.
#[derive(Debug, Default)]
pub(crate) struct HookedStore {
    inner: MemoryStore,
    lookup_delay: Option<StdDuration>,
    competing_claims: bool,
}

impl HookedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slow_lookups(mut self, delay: Duration) -> Self {
        self.lookup_delay = delay.to_std().ok();
        self
    }

    pub(crate) fn competing_claims(mut self) -> Self {
        self.competing_claims = true;
        self
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Store for HookedStore {
    async fn existing_keys(
        &self,
        titles: &[String],
        urls: &[String],
    ) -> Result<ExistingKeys, StoreError> {
        let keys = self.inner.existing_keys(titles, urls).await?;
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(keys)
    }

    async fn insert_tenders(&self, batch: &[Tender]) -> Result<u64, StoreError> {
        self.inner.insert_tenders(batch).await
    }

    async fn touch_last_seen(
        &self,
        titles: &[String],
        urls: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner.touch_last_seen(titles, urls, seen_at).await
    }

    async fn count_tenders(&self) -> Result<i64, StoreError> {
        self.inner.count_tenders().await
    }

    async fn undistributed_tenders(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Tender>, StoreError> {
        self.inner.undistributed_tenders(since, limit).await
    }

    async fn create_run_log(&self, new: NewRunLog) -> Result<ScrapeRunLog, StoreError> {
        self.inner.create_run_log(new).await
    }

    async fn close_run_log(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool, StoreError> {
        self.inner.close_run_log(id, outcome).await
    }

    async fn run_log(&self, id: Uuid) -> Result<Option<ScrapeRunLog>, StoreError> {
        self.inner.run_log(id).await
    }

    async fn run_log_children(&self, parent_id: Uuid) -> Result<Vec<ScrapeRunLog>, StoreError> {
        self.inner.run_log_children(parent_id).await
    }

    async fn last_successful_run(
        &self,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.last_successful_run(source_name).await
    }

    async fn enqueue_job(&self, source_id: &str, priority: i32) -> Result<ScrapeJob, StoreError> {
        self.inner.enqueue_job(source_id, priority).await
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
        let jobs = self.inner.pending_jobs(limit).await?;
        if self.competing_claims {
            for job in &jobs {
                self.inner.claim_job(job.id).await?;
            }
        }
        Ok(jobs)
    }

    async fn claim_job(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.claim_job(id).await
    }

    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        self.inner.finish_job(id, status).await
    }

    async fn has_distribution_success(&self, tender_id: Uuid) -> Result<bool, StoreError> {
        self.inner.has_distribution_success(tender_id).await
    }

    async fn record_distribution(&self, record: &DistributionRecord) -> Result<(), StoreError> {
        self.inner.record_distribution(record).await
    }
}
