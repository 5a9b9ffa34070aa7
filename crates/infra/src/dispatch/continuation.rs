//! Continuation scheduler: hands a campaign to a future invocation when this
//! one runs out of wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use thiserror::Error;
use tracing::{info, warn};

use courier_core::CampaignId;

use crate::config::DispatchIdentity;
use crate::store::{JobStore, StoreError};
use crate::timers::{OneShotTimer, TimerError, TimerHandle, TimerRegistry, TriggerPayload};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContinuationError {
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct ContinuationScheduler {
    timers: Arc<dyn TimerRegistry>,
    store: Arc<dyn JobStore>,
    identity: DispatchIdentity,
    delay: Duration,
}

impl ContinuationScheduler {
    pub fn new(
        timers: Arc<dyn TimerRegistry>,
        store: Arc<dyn JobStore>,
        identity: DispatchIdentity,
        delay: Duration,
    ) -> Self {
        Self {
            timers,
            store,
            identity,
            delay,
        }
    }

    /// Fire time for a continuation requested at `now`, whole seconds.
    pub fn fire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay).unwrap_or(chrono::Duration::zero());
        now.checked_add_signed(delay).unwrap_or(now).trunc_subsecs(0)
    }

    /// Register a one-shot timer pinned to `campaign_id` and remember its
    /// handle on the campaign.
    ///
    /// Failure here must reach the caller: nothing else resumes the campaign.
    pub async fn schedule(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<TimerHandle, ContinuationError> {
        let timer = OneShotTimer {
            target: self.identity.target.clone(),
            role: self.identity.role.clone(),
            fire_at: self.fire_time(now),
            payload: TriggerPayload::pinned(campaign_id),
            auto_delete: true,
        };
        let fire_at = timer.fire_at;
        let handle = self.timers.create_one_shot(timer).await?;

        if let Err(err) = self
            .store
            .set_continuation_handle(campaign_id, &handle.0, now)
            .await
        {
            warn!(campaign_id = %campaign_id, handle = %handle, error = %err, "continuation handle not recorded");
            return Err(err.into());
        }

        info!(campaign_id = %campaign_id, handle = %handle, fire_at = %fire_at, "continuation scheduled");
        Ok(handle)
    }

    /// Cancel a campaign and delete its pending timers.
    pub async fn cancel(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimerHandle>, ContinuationError> {
        cancel_campaign(self.store.as_ref(), self.timers.as_ref(), campaign_id, now).await
    }
}

/// Mark a campaign failed and delete the timers it still references.
///
/// Needs no invocation identity. Timers that already fired (auto-deleted)
/// are not an error.
pub async fn cancel_campaign(
    store: &dyn JobStore,
    timers: &dyn TimerRegistry,
    campaign_id: CampaignId,
    now: DateTime<Utc>,
) -> Result<Vec<TimerHandle>, ContinuationError> {
    let handles = store.cancel_campaign(campaign_id, now).await?;
    let mut deleted = Vec::with_capacity(handles.len());
    for handle in handles.into_iter().map(TimerHandle) {
        match timers.delete(&handle).await {
            Ok(()) => deleted.push(handle),
            Err(TimerError::NotFound(_)) => {
                info!(campaign_id = %campaign_id, handle = %handle, "timer already gone");
            }
            Err(err) => return Err(err.into()),
        }
    }
    info!(campaign_id = %campaign_id, deleted = deleted.len(), "campaign cancelled");
    Ok(deleted)
}
