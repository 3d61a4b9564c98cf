use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tenderwatch_core::{
    AffirmativeAction, AffirmativeActionType, DistributionRecord, JobStatus, RunOutcome,
    RunStatus, ScrapeJob, ScrapeRunLog, Tender,
};
use uuid::Uuid;

use crate::store::{ExistingKeys, NewRunLog, Store, StoreError};

const TENDER_COLUMNS: &str = "id, source_id, title, reference, description, requirements, deadline, \
     contact, category, subcategory, location, tender_url, fees, prerequisites, points_required, \
     affirmative_type, affirmative_percentage, affirmative_details, created_at, last_seen_at";

const RUN_LOG_COLUMNS: &str = "id, source_name, status, records_found, records_inserted, details, \
     error_message, parent_log_id, created_at, completed_at";

const JOB_COLUMNS: &str = "id, source_id, status, priority, created_at, started_at, completed_at";

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying migrations")
    }
}

fn tender_from_row(row: &PgRow) -> Result<Tender, StoreError> {
    let kind: String = row.try_get("affirmative_type")?;
    Ok(Tender {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        reference: row.try_get("reference")?,
        description: row.try_get("description")?,
        requirements: row.try_get("requirements")?,
        deadline: row.try_get("deadline")?,
        contact: row.try_get("contact")?,
        category: row.try_get("category")?,
        subcategory: row.try_get("subcategory")?,
        location: row.try_get("location")?,
        tender_url: row.try_get("tender_url")?,
        fees: row.try_get("fees")?,
        prerequisites: row.try_get("prerequisites")?,
        points_required: row.try_get("points_required")?,
        affirmative_action: AffirmativeAction {
            kind: AffirmativeActionType::parse(&kind),
            percentage: row.try_get("affirmative_percentage")?,
            details: row.try_get("affirmative_details")?,
        },
        created_at: row.try_get("created_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn run_log_from_row(row: &PgRow) -> Result<ScrapeRunLog, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ScrapeRunLog {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown run status {status}")))?,
        records_found: row.try_get("records_found")?,
        records_inserted: row.try_get("records_inserted")?,
        details: row.try_get("details")?,
        error_message: row.try_get("error_message")?,
        parent_log_id: row.try_get("parent_log_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScrapeJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ScrapeJob {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown job status {status}")))?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn existing_keys(
        &self,
        titles: &[String],
        urls: &[String],
    ) -> Result<ExistingKeys, StoreError> {
        if titles.is_empty() && urls.is_empty() {
            return Ok(ExistingKeys::default());
        }
        let rows = sqlx::query(
            r#"
            SELECT title, tender_url
              FROM tenders
             WHERE title = ANY($1)
                OR tender_url = ANY($2)
            "#,
        )
        .bind(titles)
        .bind(urls)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = ExistingKeys::default();
        for row in rows {
            keys.titles.insert(row.try_get("title")?);
            if let Some(url) = row.try_get::<Option<String>, _>("tender_url")? {
                keys.urls.insert(url);
            }
        }
        Ok(keys)
    }

    async fn insert_tenders(&self, batch: &[Tender]) -> Result<u64, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO tenders ({TENDER_COLUMNS}) "));
        qb.push_values(batch, |mut b, t| {
            b.push_bind(t.id)
                .push_bind(&t.source_id)
                .push_bind(&t.title)
                .push_bind(&t.reference)
                .push_bind(&t.description)
                .push_bind(&t.requirements)
                .push_bind(t.deadline)
                .push_bind(&t.contact)
                .push_bind(&t.category)
                .push_bind(&t.subcategory)
                .push_bind(&t.location)
                .push_bind(&t.tender_url)
                .push_bind(&t.fees)
                .push_bind(&t.prerequisites)
                .push_bind(t.points_required)
                .push_bind(t.affirmative_action.kind.as_str())
                .push_bind(t.affirmative_action.percentage)
                .push_bind(&t.affirmative_action.details)
                .push_bind(t.created_at)
                .push_bind(t.last_seen_at);
        });
        qb.push(" ON CONFLICT DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn touch_last_seen(
        &self,
        titles: &[String],
        urls: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if titles.is_empty() && urls.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE tenders
               SET last_seen_at = $3
             WHERE title = ANY($1)
                OR tender_url = ANY($2)
            "#,
        )
        .bind(titles)
        .bind(urls)
        .bind(seen_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_tenders(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM tenders")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn undistributed_tenders(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Tender>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TENDER_COLUMNS}
              FROM tenders t
             WHERE t.created_at >= $1
               AND NOT EXISTS (
                   SELECT 1 FROM social_media_posts p
                    WHERE p.tender_id = t.id AND p.success
               )
             ORDER BY t.created_at ASC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tender_from_row).collect()
    }

    async fn create_run_log(&self, new: NewRunLog) -> Result<ScrapeRunLog, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO scraping_logs (id, source_name, status, details, parent_log_id, created_at)
            VALUES ($1, $2, 'in_progress', $3, $4, NOW())
            RETURNING {RUN_LOG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.source_name)
            .bind(&new.details)
            .bind(new.parent_log_id)
            .fetch_one(&self.pool)
            .await?;
        run_log_from_row(&row)
    }

    async fn close_run_log(&self, id: Uuid, outcome: &RunOutcome) -> Result<bool, StoreError> {
        let (found, inserted, details, error) = match outcome {
            RunOutcome::Success {
                records_found,
                records_inserted,
                details,
            } => (*records_found, *records_inserted, details.clone(), None),
            RunOutcome::Error { message } => (0, 0, None, Some(message.clone())),
        };
        let result = sqlx::query(
            r#"
            UPDATE scraping_logs
               SET status = $2,
                   records_found = $3,
                   records_inserted = $4,
                   details = COALESCE($5, details),
                   error_message = $6,
                   completed_at = NOW()
             WHERE id = $1
               AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(outcome.status().as_str())
        .bind(found)
        .bind(inserted)
        .bind(details)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn run_log(&self, id: Uuid) -> Result<Option<ScrapeRunLog>, StoreError> {
        let sql = format!("SELECT {RUN_LOG_COLUMNS} FROM scraping_logs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_log_from_row).transpose()
    }

    async fn run_log_children(&self, parent_id: Uuid) -> Result<Vec<ScrapeRunLog>, StoreError> {
        let sql = format!(
            "SELECT {RUN_LOG_COLUMNS} FROM scraping_logs WHERE parent_log_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_log_from_row).collect()
    }

    async fn last_successful_run(
        &self,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(completed_at) AS last_success
              FROM scraping_logs
             WHERE source_name = $1
               AND status = 'success'
            "#,
        )
        .bind(source_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_success")?)
    }

    async fn enqueue_job(&self, source_id: &str, priority: i32) -> Result<ScrapeJob, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO scraping_jobs (id, source_id, status, priority, created_at)
            VALUES ($1, $2, 'pending', $3, NOW())
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(source_id)
            .bind(priority)
            .fetch_one(&self.pool)
            .await?;
        job_from_row(&row)
    }

    async fn pending_jobs(&self, limit: i64) -> Result<Vec<ScrapeJob>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM scraping_jobs
             WHERE status = 'pending'
             ORDER BY priority DESC, created_at ASC
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scraping_jobs
               SET status = 'in_progress',
                   started_at = NOW()
             WHERE id = $1
               AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_job(&self, id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE scraping_jobs
               SET status = $2,
                   completed_at = NOW()
             WHERE id = $1
               AND status = 'in_progress'
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_distribution_success(&self, tender_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM social_media_posts
                 WHERE tender_id = $1 AND success
            ) AS posted
            "#,
        )
        .bind(tender_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("posted")?)
    }

    async fn record_distribution(&self, record: &DistributionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO social_media_posts (id, tender_id, channel, success, error, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(record.tender_id)
        .bind(record.channel.as_str())
        .bind(record.success)
        .bind(&record.error)
        .bind(record.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
