use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tenderwatch_core::{
    DistributionRecord, JobStatus, RunOutcome, ScrapeJob, ScrapeRunLog, Tender,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all (connection, pool, TLS).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("invalid stored value: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => Self::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => Self::Decode(err.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Natural keys already present in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingKeys {
    pub titles: HashSet<String>,
    pub urls: HashSet<String>,
}

impl ExistingKeys {
    pub fn matches(&self, title: &str, url: Option<&str>) -> bool {
        self.titles.contains(title) || url.is_some_and(|u| self.urls.contains(u))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRunLog {
    pub source_name: String,
    pub parent_log_id: Option<Uuid>,
    pub details: Option<String>,
}

impl NewRunLog {
    pub fn new(source_name: impl Into<String>, parent_log_id: Option<Uuid>) -> Self {
        Self {
            source_name: source_name.into(),
            parent_log_id,
            details: None,
        }
    }
}

/// Durable store shared by every pipeline stage.
#[async_trait]
pub trait Store: Send + Sync {
    /// One batched lookup for all candidate titles and URLs.
    async fn existing_keys(
        &self,
        titles: &[String],
        urls: &[String],
    ) -> Result<ExistingKeys, StoreError>;

    /// Inserts one batch atomically; returns the number of rows written.
    async fn insert_tenders(&self, batch: &[Tender]) -> Result<u64, StoreError>;

    async fn touch_last_seen(
        &self,
        titles: &[String],
        urls: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn count_tenders(&self) -> Result<i64, StoreError>;

    /// Tenders created since `since` that have no successful distribution on any channel.
    async fn undistributed_tenders(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Tender>, StoreError>;

    async fn create_run_log(&self, new: NewRunLog) -> Result<ScrapeRunLog, StoreError>;

    /// Applies the terminal status; returns `false` if the log was already closed.
    async fn close_run_log(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool, StoreError>;

    async fn run_log(&self, id: Uuid) -> Result<Option<ScrapeRunLog>, StoreError>;

    async fn run_log_children(&self, parent_id: Uuid) -> Result<Vec<ScrapeRunLog>, StoreError>;

    async fn last_successful_run(
        &self,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn enqueue_job(&self, source_id: &str, priority: i32) -> Result<ScrapeJob, StoreError>;

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError>;

    /// Compare-and-set `pending -> in_progress`; only the caller that flips it gets `true`.
    async fn claim_job(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    async fn has_distribution_success(&self, tender_id: Uuid) -> Result<bool, StoreError>;

    async fn record_distribution(&self, record: &DistributionRecord) -> Result<(), StoreError>;
}
