//! Stale-lock reclaimer.
//!
//! `status = sending` is a lease whose expiry is the stale threshold. Rows
//! past it belong to an invocation that died, so they go back to `queued`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use courier_core::{PostId, SendJobId};

use crate::store::{JobStore, StoreError};

#[derive(Clone)]
pub struct StaleLockReclaimer {
    store: Arc<dyn JobStore>,
    threshold: Duration,
}

impl StaleLockReclaimer {
    pub fn new(store: Arc<dyn JobStore>, threshold: Duration) -> Self {
        Self { store, threshold }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::zero())
    }

    pub async fn reclaim_send_jobs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let reclaimed = self
            .store
            .reclaim_stale_send_jobs(self.cutoff(now), now)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, threshold_secs = self.threshold.as_secs(), "reclaimed stale send jobs");
        }
        Ok(reclaimed)
    }

    pub async fn reclaim_posts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let reclaimed = self.store.reclaim_stale_posts(self.cutoff(now), now).await?;
        if reclaimed > 0 {
            warn!(reclaimed, threshold_secs = self.threshold.as_secs(), "reclaimed stale posts");
        }
        Ok(reclaimed)
    }

    /// Hand back jobs this invocation claimed but will not process, so they
    /// do not sit out the full stale threshold.
    pub async fn release_unprocessed(
        &self,
        ids: &[SendJobId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let released = self.store.release_send_jobs(ids, now).await?;
        info!(released, "released unprocessed send jobs");
        Ok(released)
    }

    pub async fn release_unprocessed_posts(
        &self,
        ids: &[PostId],
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let released = self.store.release_posts(ids, now).await?;
        info!(released, "released unprocessed posts");
        Ok(released)
    }
}
