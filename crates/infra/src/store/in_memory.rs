//! In-memory job store for tests/dev.
//!
//! A single lock guards all tables, so a claim is trivially atomic and
//! concurrent claims are disjoint.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_campaigns::{
    Campaign, CampaignStatus, NewPost, NewSendJob, PostStatus, RecurringPost, SendJob,
    SendJobStatus, SendOutcome, SuppressionEntry, SuppressionReason, UnsubscribeToken,
};
use courier_core::{CampaignId, EmailAddress, PostId, SendJobId};

use super::{CampaignStore, PostStore, SendJobStore, StoreError, SuppressionList};

#[derive(Debug, Default)]
struct Tables {
    campaigns: HashMap<CampaignId, Campaign>,
    /// Insertion order doubles as the creation-order tiebreak.
    send_jobs: Vec<SendJob>,
    job_index: HashMap<SendJobId, usize>,
    recipients: HashSet<(CampaignId, EmailAddress)>,
    suppressions: HashMap<EmailAddress, SuppressionEntry>,
    posts: Vec<RecurringPost>,
}

impl Tables {
    fn job_mut(&mut self, id: SendJobId) -> Option<&mut SendJob> {
        let idx = *self.job_index.get(&id)?;
        self.send_jobs.get_mut(idx)
    }

    fn campaign_mut(&mut self, id: CampaignId) -> Result<&mut Campaign, StoreError> {
        self.campaigns
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {id}")))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    /// Force a job's `updated_at`, e.g. to simulate a crashed invocation.
    pub fn backdate_send_job(&self, id: SendJobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .job_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("send job {id}")))?;
        job.updated_at = at;
        Ok(())
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn create_campaign(&self, campaign: Campaign) -> Result<CampaignId, StoreError> {
        let mut tables = self.write()?;
        if tables.campaigns.contains_key(&campaign.id) {
            return Err(StoreError::Conflict(format!("campaign {} exists", campaign.id)));
        }
        let id = campaign.id;
        tables.campaigns.insert(id, campaign);
        Ok(id)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        Ok(self.read()?.campaigns.get(&id).cloned())
    }

    async fn schedule_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
        scheduler_handle: &str,
        now: DateTime<Utc>,
    ) -> Result<Campaign, StoreError> {
        let mut tables = self.write()?;
        let campaign = tables.campaign_mut(id)?;
        campaign.schedule(at, scheduler_handle, now)?;
        Ok(campaign.clone())
    }

    async fn start_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let mut tables = self.write()?;
        Ok(tables.campaign_mut(id)?.start(now)?)
    }

    async fn promote_due_campaigns(&self, now: DateTime<Utc>) -> Result<Vec<CampaignId>, StoreError> {
        let mut tables = self.write()?;
        let mut promoted: Vec<CampaignId> = tables
            .campaigns
            .values_mut()
            .filter_map(|c| c.promote_if_due(now).then_some(c.id))
            .collect();
        promoted.sort();
        Ok(promoted)
    }

    async fn next_sending_campaign(
        &self,
        exclude: &[CampaignId],
    ) -> Result<Option<Campaign>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Sending && !exclude.contains(&c.id))
            .min_by_key(|c| (c.updated_at, c.id))
            .cloned())
    }

    async fn finalize_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let unresolved = tables.send_jobs.iter().any(|j| {
            j.campaign_id == id
                && matches!(j.status, SendJobStatus::Queued | SendJobStatus::Sending)
        });
        let campaign = tables.campaign_mut(id)?;
        if unresolved || campaign.status != CampaignStatus::Sending {
            return Ok(false);
        }
        campaign.mark_sent(now)?;
        Ok(true)
    }

    async fn set_continuation_handle(
        &self,
        id: CampaignId,
        handle: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.campaign_mut(id)?.record_continuation(handle, now)?;
        Ok(())
    }

    async fn cancel_campaign(
        &self,
        id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut tables = self.write()?;
        Ok(tables.campaign_mut(id)?.cancel(now)?)
    }
}

#[async_trait]
impl SendJobStore for InMemoryStore {
    async fn insert_send_jobs(
        &self,
        jobs: Vec<NewSendJob>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.write()?;
        let mut inserted = 0;
        for new_job in jobs {
            let key = (new_job.campaign_id, new_job.address.clone());
            if !tables.recipients.insert(key) {
                continue;
            }
            let job = new_job.into_job(now);
            let idx = tables.send_jobs.len();
            tables.job_index.insert(job.id, idx);
            tables.send_jobs.push(job);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_send_jobs(
        &self,
        campaign_id: CampaignId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<SendJob>, StoreError> {
        let mut tables = self.write()?;
        let mut candidates: Vec<usize> = tables
            .send_jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.campaign_id == campaign_id && j.is_due(now))
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|&idx| tables.send_jobs[idx].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for idx in candidates {
            let job = &mut tables.send_jobs[idx];
            job.claim(now)?;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn record_send_outcome(
        &self,
        id: SendJobId,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let job = tables
            .job_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("send job {id}")))?;
        if job.status != SendJobStatus::Sending {
            return Ok(false);
        }
        job.record(outcome, now)?;
        Ok(true)
    }

    async fn count_send_jobs(
        &self,
        campaign_id: CampaignId,
        status: SendJobStatus,
    ) -> Result<u64, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .send_jobs
            .iter()
            .filter(|j| j.campaign_id == campaign_id && j.status == status)
            .count() as u64)
    }

    async fn list_send_jobs(&self, campaign_id: CampaignId) -> Result<Vec<SendJob>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .send_jobs
            .iter()
            .filter(|j| j.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn reclaim_stale_send_jobs(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut reclaimed = 0;
        for job in tables.send_jobs.iter_mut().filter(|j| j.is_stale(cutoff)) {
            if job.reclaim(now) {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn release_send_jobs(
        &self,
        ids: &[SendJobId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut released = 0;
        for id in ids {
            if let Some(job) = tables.job_mut(*id) {
                if job.reclaim(now) {
                    released += 1;
                }
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl SuppressionList for InMemoryStore {
    async fn is_suppressed(&self, address: &EmailAddress) -> Result<bool, StoreError> {
        Ok(self.read()?.suppressions.contains_key(address))
    }

    async fn suppress(&self, entry: SuppressionEntry) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        if tables.suppressions.contains_key(&entry.address) {
            return Ok(false);
        }
        tables.suppressions.insert(entry.address.clone(), entry);
        Ok(true)
    }

    async fn unsubscribe_by_token(
        &self,
        token: &UnsubscribeToken,
        now: DateTime<Utc>,
    ) -> Result<Option<EmailAddress>, StoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables
            .send_jobs
            .iter_mut()
            .find(|j| j.unsubscribe_token.as_ref() == Some(token))
        else {
            return Ok(None);
        };
        job.unsubscribe(now);
        let address = job.address.clone();
        tables
            .suppressions
            .entry(address.clone())
            .or_insert_with(|| {
                SuppressionEntry::new(address.clone(), SuppressionReason::Unsubscribed, now)
            });
        Ok(Some(address))
    }
}

#[async_trait]
impl PostStore for InMemoryStore {
    async fn enqueue_post(
        &self,
        post: NewPost,
        now: DateTime<Utc>,
    ) -> Result<RecurringPost, StoreError> {
        let post = post.into_post(now)?;
        self.write()?.posts.push(post.clone());
        Ok(post)
    }

    async fn get_post(&self, id: PostId) -> Result<Option<RecurringPost>, StoreError> {
        Ok(self.read()?.posts.iter().find(|p| p.id == id).cloned())
    }

    async fn claim_due_posts(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringPost>, StoreError> {
        let mut tables = self.write()?;
        let mut due: Vec<&mut RecurringPost> =
            tables.posts.iter_mut().filter(|p| p.is_due(now)).collect();
        due.sort_by_key(|p| (p.scheduled_at, p.created_at));

        let mut claimed = Vec::new();
        for post in due.into_iter().take(limit) {
            post.claim(now)?;
            claimed.push(post.clone());
        }
        Ok(claimed)
    }

    async fn record_post_outcome(&self, post: &RecurringPost) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .posts
            .iter_mut()
            .find(|p| p.id == post.id)
            .ok_or_else(|| StoreError::NotFound(format!("post {}", post.id)))?;
        if stored.status != PostStatus::Sending {
            return Ok(false);
        }
        *stored = post.clone();
        Ok(true)
    }

    async fn reclaim_stale_posts(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut reclaimed = 0;
        for post in tables.posts.iter_mut().filter(|p| p.is_stale(cutoff)) {
            if post.reclaim(now) {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn release_posts(&self, ids: &[PostId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let mut released = 0;
        for post in tables.posts.iter_mut().filter(|p| ids.contains(&p.id)) {
            if post.reclaim(now) {
                released += 1;
            }
        }
        Ok(released)
    }
}
