//! Claim coordinator: hands one invocation a batch of queued jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use courier_campaigns::{SendJob, SendJobStatus};
use courier_core::CampaignId;

use crate::store::{JobStore, StoreError};

/// What one claim attempt produced.
#[derive(Debug)]
pub enum ClaimResult {
    /// Jobs now held in `sending` by this invocation, oldest first.
    Batch(Vec<SendJob>),
    /// Nothing queued and nothing in flight; the campaign was finalized.
    Completed,
    /// Nothing queued, but other invocations still hold jobs in flight.
    Idle { in_flight: u64 },
    /// Nothing claimable yet: the remaining queued jobs wait out a retry
    /// delay. A later trigger picks them up.
    Deferred { waiting: u64 },
}

#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
    batch_size: usize,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn claim(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let batch = self
            .store
            .claim_send_jobs(campaign_id, self.batch_size, now)
            .await?;
        if !batch.is_empty() {
            debug!(campaign_id = %campaign_id, claimed = batch.len(), "claimed batch");
            return Ok(ClaimResult::Batch(batch));
        }

        let in_flight = self
            .store
            .count_send_jobs(campaign_id, SendJobStatus::Sending)
            .await?;
        if in_flight > 0 {
            debug!(campaign_id = %campaign_id, in_flight, "nothing queued, jobs still in flight");
            return Ok(ClaimResult::Idle { in_flight });
        }

        let waiting = self
            .store
            .count_send_jobs(campaign_id, SendJobStatus::Queued)
            .await?;
        if waiting > 0 {
            debug!(campaign_id = %campaign_id, waiting, "queued jobs are waiting out a retry delay");
            return Ok(ClaimResult::Deferred { waiting });
        }

        if self.store.finalize_campaign(campaign_id, now).await? {
            info!(campaign_id = %campaign_id, "campaign finalized as sent");
            Ok(ClaimResult::Completed)
        } else {
            // Lost a race: a job was released or another invocation finalized first.
            Ok(ClaimResult::Idle { in_flight: 0 })
        }
    }
}
