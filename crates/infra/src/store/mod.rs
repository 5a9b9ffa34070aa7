//! Job Store: campaigns, send jobs, the suppression list and social posts.
//!
//! Every concurrency guarantee of the dispatcher lives here. The claim
//! operations hand out disjoint batches to concurrent callers; everything
//! else is a single-row update.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_campaigns::{
    Campaign, NewPost, NewSendJob, RecurringPost, SendJob, SendJobStatus, SendOutcome,
    SuppressionEntry, UnsubscribeToken,
};
use courier_core::{CampaignId, DomainError, EmailAddress, PostId, SendJobId};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => StoreError::NotFound("entity".to_string()),
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::InvalidTransition(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create_campaign(&self, campaign: Campaign) -> Result<CampaignId, StoreError>;

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// `draft → scheduled`, remembering the timer that will start it.
    async fn schedule_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        scheduler_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, StoreError>;

    /// `draft | scheduled → sending`. Returns the cleared scheduler handle.
    async fn start_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    /// Move every scheduled campaign whose start time has passed to `sending`.
    async fn promote_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError>;

    /// Oldest-updated `sending` campaign that is not in `exclude`.
    async fn next_sending_campaign(
        &self,
        exclude: &[CampaignId],
    ) -> Result<Option<Campaign>, StoreError>;

    /// `sending → sent`, only when no job is queued or in flight.
    ///
    /// Returns whether the campaign was finalized.
    async fn finalize_campaign(&self, id: CampaignId, now: DateTime<Utc>)
    -> Result<bool, StoreError>;

    async fn set_continuation_handle(
        &self,
        id: CampaignId,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark the campaign failed. Returns the timer handles to delete.
    async fn cancel_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait SendJobStore: Send + Sync {
    /// Bulk insert. Rows whose `(campaign_id, address)` already exists are
    /// ignored; returns the number actually inserted.
    async fn insert_send_jobs(
        &self,
        jobs: Vec<NewSendJob>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Atomically move up to `limit` queued jobs of `campaign_id` (oldest
    /// first) to `sending`. Concurrent callers receive disjoint sets.
    async fn claim_send_jobs(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SendJob>, StoreError>;

    /// Record the outcome of a claimed job. Returns `false` when the job was
    /// no longer in flight (reclaimed or unsubscribed meanwhile).
    async fn record_send_outcome(
        &self,
        id: SendJobId,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn count_send_jobs(
        &self,
        campaign_id: CampaignId,
        status: SendJobStatus,
    ) -> Result<u64, StoreError>;

    async fn list_send_jobs(&self, campaign_id: CampaignId) -> Result<Vec<SendJob>, StoreError>;

    /// `sending → queued` for every job last touched before `cutoff`.
    async fn reclaim_stale_send_jobs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// `sending → queued` for specific jobs this invocation claimed but
    /// did not process.
    async fn release_send_jobs(
        &self,
        ids: &[SendJobId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait SuppressionList: Send + Sync {
    async fn is_suppressed(&self, address: &EmailAddress) -> Result<bool, StoreError>;

    /// Idempotent. Returns whether the address was newly added.
    async fn suppress(&self, entry: SuppressionEntry) -> Result<bool, StoreError>;

    /// Suppress the address behind `token` and mark its job unsubscribed.
    /// Returns `None` for an unknown token.
    async fn unsubscribe_by_token(
        &self,
        token: &UnsubscribeToken,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailAddress>, StoreError>;
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn enqueue_post(&self, post: NewPost, now: DateTime<Utc>)
    -> Result<RecurringPost, StoreError>;

    async fn get_post(&self, id: PostId) -> Result<Option<RecurringPost>, StoreError>;

    /// Claim up to `limit` due posts, incrementing their attempt counts.
    async fn claim_due_posts(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringPost>, StoreError>;

    /// Persist the state of a post after its attempt. Returns `false` when
    /// the post was no longer in flight.
    async fn record_post_outcome(&self, post: &RecurringPost) -> Result<bool, StoreError>;

    async fn reclaim_stale_posts(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn release_posts(&self, ids: &[PostId], now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// The full store surface the dispatchers run against.
pub trait JobStore: CampaignStore + SendJobStore + SuppressionList + PostStore {}

impl<T> JobStore for T where T: CampaignStore + SendJobStore + SuppressionList + PostStore {}
