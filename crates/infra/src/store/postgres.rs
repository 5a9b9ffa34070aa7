//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! Batches are claimed with a single statement:
//!
//! ```sql
//! UPDATE send_jobs SET status = 'sending', ...
//! WHERE id IN (SELECT id ... ORDER BY created_at LIMIT $n FOR UPDATE SKIP LOCKED)
//! RETURNING ...
//! ```
//!
//! Rows locked by a concurrent claim are skipped rather than waited on, so two
//! overlapping invocations always walk away with disjoint batches.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `InvalidTransition` |
//! | Database (other) | Any other | `Storage` |
//! | RowNotFound | N/A | `NotFound` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use courier_campaigns::{
    Campaign, CampaignStatus, NewPost, NewSendJob, PostStatus, RecurringPost, SendJob,
    SendJobStatus, SendOutcome, SuppressionEntry, SuppressionReason, UnsubscribeToken,
};
use courier_core::{CampaignId, EmailAddress, PostId, SendJobId};

use super::{CampaignStore, PostStore, SendJobStore, StoreError, SuppressionList};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id UUID PRIMARY KEY,
    subject TEXT NOT NULL,
    html TEXT NOT NULL,
    text TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    scheduled_at TIMESTAMPTZ,
    scheduler_handle TEXT,
    continuation_handle TEXT,
    sent_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT campaigns_scheduler_handle_only_while_scheduled
        CHECK (scheduler_handle IS NULL OR status = 'scheduled')
);

CREATE INDEX IF NOT EXISTS idx_campaigns_sending
    ON campaigns(updated_at)
    WHERE status = 'sending';

CREATE TABLE IF NOT EXISTS send_jobs (
    id UUID PRIMARY KEY,
    campaign_id UUID NOT NULL REFERENCES campaigns(id),
    address TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    retry_at TIMESTAMPTZ,
    unsubscribe_token TEXT UNIQUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (campaign_id, address)
);

ALTER TABLE send_jobs ADD COLUMN IF NOT EXISTS retry_at TIMESTAMPTZ;

CREATE INDEX IF NOT EXISTS idx_send_jobs_queued
    ON send_jobs(campaign_id, created_at)
    WHERE status = 'queued';

CREATE INDEX IF NOT EXISTS idx_send_jobs_sending
    ON send_jobs(updated_at)
    WHERE status = 'sending';

CREATE TABLE IF NOT EXISTS suppressions (
    address TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS recurring_posts (
    id UUID PRIMARY KEY,
    provider TEXT NOT NULL,
    body TEXT NOT NULL,
    media TEXT[] NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'queued',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    scheduled_at TIMESTAMPTZ NOT NULL,
    result TEXT,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_recurring_posts_due
    ON recurring_posts(scheduled_at)
    WHERE status = 'queued';
"#;

const CAMPAIGN_COLUMNS: &str = "id, subject, html, text, status, scheduled_at, scheduler_handle, \
     continuation_handle, sent_at, created_at, updated_at";

const SEND_JOB_COLUMNS: &str = "id, campaign_id, address, status, attempt_count, last_error, \
     retry_at, unsubscribe_token, created_at, updated_at";

const POST_COLUMNS: &str = "id, provider, body, media, status, attempt_count, scheduled_at, \
     result, error, created_at, updated_at";

/// Postgres job store. Cheap to clone; all clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn lock_campaign(
        tx: &mut Transaction<'_, Postgres>,
        id: CampaignId,
    ) -> Result<Campaign, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_campaign", e))?
        .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))?;
        campaign_from_row(&row)
    }

    async fn write_campaign(
        tx: &mut Transaction<'_, Postgres>,
        campaign: &Campaign,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2,
                scheduled_at = $3,
                scheduler_handle = $4,
                continuation_handle = $5,
                sent_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(campaign.status.as_str())
        .bind(campaign.scheduled_at)
        .bind(&campaign.scheduler_handle)
        .bind(&campaign.continuation_handle)
        .bind(campaign.sent_at)
        .bind(campaign.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_campaign", e))?;
        Ok(())
    }

    /// Load a campaign under a row lock, apply `change`, write it back.
    async fn transition_campaign<T, F>(
        &self,
        operation: &str,
        id: CampaignId,
        change: F,
    ) -> Result<(Campaign, T), StoreError>
    where
        F: FnOnce(&mut Campaign) -> Result<T, StoreError> + Send,
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let mut campaign = Self::lock_campaign(&mut tx, id).await?;
        let out = match change(&mut campaign) {
            Ok(out) => out,
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        };
        Self::write_campaign(&mut tx, &campaign).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((campaign, out))
    }
}

#[async_trait]
impl CampaignStore for PostgresStore {
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id), err)]
    async fn create_campaign(&self, campaign: Campaign) -> Result<CampaignId, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, subject, html, text, status, scheduled_at, scheduler_handle,
                continuation_handle, sent_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(&campaign.subject)
        .bind(&campaign.html)
        .bind(&campaign.text)
        .bind(campaign.status.as_str())
        .bind(campaign.scheduled_at)
        .bind(&campaign.scheduler_handle)
        .bind(&campaign.continuation_handle)
        .bind(campaign.sent_at)
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_campaign", e))?;
        Ok(campaign.id)
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_campaign", e))?;

        row.as_ref().map(campaign_from_row).transpose()
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn schedule_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        scheduler_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, StoreError> {
        let handle = scheduler_handle.to_string();
        let (campaign, ()) = self
            .transition_campaign("schedule_campaign", id, move |c| {
                Ok(c.schedule(at, handle, now)?)
            })
            .await?;
        Ok(campaign)
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn start_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let (_, cleared) = self
            .transition_campaign("start_campaign", id, move |c| Ok(c.start(now)?))
            .await?;
        Ok(cleared)
    }

    #[instrument(skip(self), err)]
    async fn promote_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'sending', scheduler_handle = NULL, updated_at = $1
            WHERE status = 'scheduled' AND scheduled_at <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote_due_campaigns", e))?;

        let mut promoted = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id").map(CampaignId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("promote_due_campaigns", e))?;
        promoted.sort();
        Ok(promoted)
    }

    #[instrument(skip(self), err)]
    async fn next_sending_campaign(
        &self,
        exclude: &[CampaignId],
    ) -> Result<Option<Campaign>, StoreError> {
        let exclude: Vec<Uuid> = exclude.iter().map(|id| *id.as_uuid()).collect();
        let row = sqlx::query(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM campaigns
            WHERE status = 'sending' AND NOT (id = ANY($1))
            ORDER BY updated_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(&exclude)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("next_sending_campaign", e))?;

        row.as_ref().map(campaign_from_row).transpose()
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn finalize_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = 'sent', sent_at = $2, continuation_handle = NULL, updated_at = $2
            WHERE id = $1
              AND status = 'sending'
              AND NOT EXISTS (
                  SELECT 1 FROM send_jobs
                  WHERE campaign_id = $1 AND status IN ('queued', 'sending')
              )
            "#,
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize_campaign", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn set_continuation_handle(
        &self,
        id: CampaignId,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let handle = handle.to_string();
        self.transition_campaign("set_continuation_handle", id, move |c| {
            Ok(c.record_continuation(handle, now)?)
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(campaign_id = %id), err)]
    async fn cancel_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let (_, handles) = self
            .transition_campaign("cancel_campaign", id, move |c| Ok(c.cancel(now)?))
            .await?;
        Ok(handles)
    }
}

#[async_trait]
impl SendJobStore for PostgresStore {
    #[instrument(skip(self, jobs), fields(job_count = jobs.len()), err)]
    async fn insert_send_jobs(
        &self,
        jobs: Vec<NewSendJob>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(jobs.len());
        let mut campaign_ids = Vec::with_capacity(jobs.len());
        let mut addresses = Vec::with_capacity(jobs.len());
        let mut statuses = Vec::with_capacity(jobs.len());
        let mut tokens = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(*SendJobId::new().as_uuid());
            campaign_ids.push(*job.campaign_id.as_uuid());
            addresses.push(job.address.as_str().to_string());
            statuses.push(job.status.as_str().to_string());
            tokens.push(job.unsubscribe_token.as_str().to_string());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO send_jobs (
                id, campaign_id, address, status, unsubscribe_token, created_at, updated_at
            )
            SELECT id, campaign_id, address, status, token, $6, $6
            FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[])
                AS t(id, campaign_id, address, status, token)
            ON CONFLICT (campaign_id, address) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&campaign_ids)
        .bind(&addresses)
        .bind(&statuses)
        .bind(&tokens)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_send_jobs", e))?;

        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    async fn claim_send_jobs(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SendJob>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE send_jobs
            SET status = 'sending',
                attempt_count = attempt_count + 1,
                retry_at = NULL,
                unsubscribe_token = COALESCE(
                    unsubscribe_token,
                    replace(gen_random_uuid()::text, '-', '')
                ),
                updated_at = $3
            WHERE id IN (
                SELECT id FROM send_jobs
                WHERE campaign_id = $1
                  AND status = 'queued'
                  AND (retry_at IS NULL OR retry_at <= $3)
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {SEND_JOB_COLUMNS}
            "#
        ))
        .bind(campaign_id.as_uuid())
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_send_jobs", e))?;

        let mut claimed = rows
            .iter()
            .map(send_job_from_row)
            .collect::<Result<Vec<SendJob>, StoreError>>()?;
        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        debug!(claimed = claimed.len(), "claimed send jobs");
        Ok(claimed)
    }

    #[instrument(skip(self, outcome), fields(job_id = %id), err)]
    async fn record_send_outcome(
        &self,
        id: SendJobId,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE send_jobs
            SET status = $2,
                last_error = COALESCE($3, last_error),
                retry_at = $5,
                updated_at = $4
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(id.as_uuid())
        .bind(outcome.status().as_str())
        .bind(outcome.error())
        .bind(now)
        .bind(outcome.retry_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_send_outcome", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    async fn count_send_jobs(
        &self,
        campaign_id: CampaignId,
        status: SendJobStatus,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM send_jobs WHERE campaign_id = $1 AND status = $2",
        )
        .bind(campaign_id.as_uuid())
        .bind(status.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_send_jobs", e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| map_sqlx_error("count_send_jobs", e))?;
        Ok(n.max(0) as u64)
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    async fn list_send_jobs(&self, campaign_id: CampaignId) -> Result<Vec<SendJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SEND_JOB_COLUMNS} FROM send_jobs WHERE campaign_id = $1 ORDER BY created_at, id"
        ))
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_send_jobs", e))?;

        rows.iter().map(send_job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale_send_jobs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE send_jobs
            SET status = 'queued', last_error = NULL, updated_at = $2
            WHERE status = 'sending' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_send_jobs", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(job_count = ids.len()), err)]
    async fn release_send_jobs(
        &self,
        ids: &[SendJobId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE send_jobs
            SET status = 'queued', last_error = NULL, updated_at = $2
            WHERE id = ANY($1) AND status = 'sending'
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_send_jobs", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SuppressionList for PostgresStore {
    #[instrument(skip(self), err)]
    async fn is_suppressed(&self, address: &EmailAddress) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS hit FROM suppressions WHERE address = $1")
            .bind(address.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_suppressed", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, entry), fields(address = %entry.address), err)]
    async fn suppress(&self, entry: SuppressionEntry) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO suppressions (address, reason, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(entry.address.as_str())
        .bind(entry.reason.as_str())
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("suppress", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, token), err)]
    async fn unsubscribe_by_token(
        &self,
        token: &UnsubscribeToken,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailAddress>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            UPDATE send_jobs
            SET status = CASE WHEN status IN ('queued', 'sending') THEN 'unsubscribed' ELSE status END,
                updated_at = CASE WHEN status IN ('queued', 'sending') THEN $2 ELSE updated_at END
            WHERE unsubscribe_token = $1
            RETURNING address
            "#,
        )
        .bind(token.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("unsubscribe_by_token", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };
        let raw: String = row
            .try_get("address")
            .map_err(|e| map_sqlx_error("unsubscribe_by_token", e))?;
        let address = EmailAddress::parse(&raw)?;

        sqlx::query(
            r#"
            INSERT INTO suppressions (address, reason, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(address.as_str())
        .bind(SuppressionReason::Unsubscribed.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("unsubscribe_by_token", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(address))
    }
}

#[async_trait]
impl PostStore for PostgresStore {
    #[instrument(skip(self, post), fields(provider = %post.provider), err)]
    async fn enqueue_post(
        &self,
        post: NewPost,
        now: DateTime<Utc>,
    ) -> Result<RecurringPost, StoreError> {
        let post = post.into_post(now)?;
        sqlx::query(
            r#"
            INSERT INTO recurring_posts (
                id, provider, body, media, status, attempt_count, scheduled_at,
                result, error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(post.id.as_uuid())
        .bind(&post.provider)
        .bind(&post.body)
        .bind(&post.media)
        .bind(post.status.as_str())
        .bind(post.attempt_count as i32)
        .bind(post.scheduled_at)
        .bind(&post.result)
        .bind(&post.error)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_post", e))?;
        Ok(post)
    }

    #[instrument(skip(self), fields(post_id = %id), err)]
    async fn get_post(&self, id: PostId) -> Result<Option<RecurringPost>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM recurring_posts WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_post", e))?;

        row.as_ref().map(post_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_due_posts(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringPost>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE recurring_posts
            SET status = 'sending', attempt_count = attempt_count + 1, updated_at = $2
            WHERE id IN (
                SELECT id FROM recurring_posts
                WHERE status = 'queued' AND scheduled_at <= $2
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {POST_COLUMNS}
            "#
        ))
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due_posts", e))?;

        let mut claimed = rows
            .iter()
            .map(post_from_row)
            .collect::<Result<Vec<RecurringPost>, StoreError>>()?;
        claimed.sort_by(|a, b| (a.scheduled_at, a.created_at).cmp(&(b.scheduled_at, b.created_at)));
        Ok(claimed)
    }

    #[instrument(skip(self, post), fields(post_id = %post.id, status = %post.status), err)]
    async fn record_post_outcome(&self, post: &RecurringPost) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_posts
            SET status = $2, scheduled_at = $3, result = $4, error = $5, updated_at = $6
            WHERE id = $1 AND status = 'sending'
            "#,
        )
        .bind(post.id.as_uuid())
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(&post.result)
        .bind(&post.error)
        .bind(post.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_post_outcome", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale_posts(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recurring_posts
            SET status = 'queued', error = NULL, updated_at = $2
            WHERE status = 'sending' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale_posts", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, ids), fields(post_count = ids.len()), err)]
    async fn release_posts(&self, ids: &[PostId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            r#"
            UPDATE recurring_posts
            SET status = 'queued', error = NULL, updated_at = $2
            WHERE id = ANY($1) AND status = 'sending'
            "#,
        )
        .bind(&ids)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_posts", e))?;
        Ok(result.rows_affected())
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::InvalidTransition(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode<'r, T>(row: &'r sqlx::postgres::PgRow) -> Result<T, StoreError>
where
    T: FromRow<'r, sqlx::postgres::PgRow>,
{
    T::from_row(row).map_err(|e| StoreError::Storage(format!("failed to decode row: {}", e)))
}

fn campaign_from_row(row: &sqlx::postgres::PgRow) -> Result<Campaign, StoreError> {
    decode::<CampaignRow>(row)?.try_into()
}

fn send_job_from_row(row: &sqlx::postgres::PgRow) -> Result<SendJob, StoreError> {
    decode::<SendJobRow>(row)?.try_into()
}

fn post_from_row(row: &sqlx::postgres::PgRow) -> Result<RecurringPost, StoreError> {
    decode::<PostRow>(row)?.try_into()
}

fn parse_status<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = courier_core::DomainError>,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Storage(format!("corrupt status column: {}", e)))
}

// SQLx row types

#[derive(Debug)]
struct CampaignRow {
    id: Uuid,
    subject: String,
    html: String,
    text: String,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    scheduler_handle: Option<String>,
    continuation_handle: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for CampaignRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(CampaignRow {
            id: row.try_get("id")?,
            subject: row.try_get("subject")?,
            html: row.try_get("html")?,
            text: row.try_get("text")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            scheduler_handle: row.try_get("scheduler_handle")?,
            continuation_handle: row.try_get("continuation_handle")?,
            sent_at: row.try_get("sent_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<CampaignRow> for Campaign {
    type Error = StoreError;

    fn try_from(row: CampaignRow) -> Result<Self, Self::Error> {
        Ok(Campaign {
            id: CampaignId::from_uuid(row.id),
            subject: row.subject,
            html: row.html,
            text: row.text,
            status: parse_status::<CampaignStatus>(&row.status)?,
            scheduled_at: row.scheduled_at,
            scheduler_handle: row.scheduler_handle,
            continuation_handle: row.continuation_handle,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct SendJobRow {
    id: Uuid,
    campaign_id: Uuid,
    address: String,
    status: String,
    attempt_count: i32,
    last_error: Option<String>,
    retry_at: Option<DateTime<Utc>>,
    unsubscribe_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SendJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SendJobRow {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            address: row.try_get("address")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            last_error: row.try_get("last_error")?,
            retry_at: row.try_get("retry_at")?,
            unsubscribe_token: row.try_get("unsubscribe_token")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<SendJobRow> for SendJob {
    type Error = StoreError;

    fn try_from(row: SendJobRow) -> Result<Self, Self::Error> {
        Ok(SendJob {
            id: SendJobId::from_uuid(row.id),
            campaign_id: CampaignId::from_uuid(row.campaign_id),
            address: EmailAddress::parse(&row.address)?,
            status: parse_status::<SendJobStatus>(&row.status)?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error: row.last_error,
            retry_at: row.retry_at,
            unsubscribe_token: row
                .unsubscribe_token
                .map(UnsubscribeToken::from_string)
                .transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct PostRow {
    id: Uuid,
    provider: String,
    body: String,
    media: Vec<String>,
    status: String,
    attempt_count: i32,
    scheduled_at: DateTime<Utc>,
    result: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PostRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(PostRow {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            body: row.try_get("body")?,
            media: row.try_get("media")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            scheduled_at: row.try_get("scheduled_at")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<PostRow> for RecurringPost {
    type Error = StoreError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(RecurringPost {
            id: PostId::from_uuid(row.id),
            provider: row.provider,
            body: row.body,
            media: row.media,
            status: parse_status::<PostStatus>(&row.status)?,
            attempt_count: row.attempt_count.max(0) as u32,
            scheduled_at: row.scheduled_at,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
