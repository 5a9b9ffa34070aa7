//! Per-invocation dispatch orchestration.
//!
//! An invocation is stateless: everything it needs to resume is in the job
//! store, and everything it leaves behind is either a finished row, a
//! queued row, or a continuation timer.

pub mod campaigns;
pub mod claim;
pub mod clock;
pub mod continuation;
pub mod posts;
pub mod reclaim;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::CampaignId;

use crate::config::ConfigError;
use crate::store::StoreError;

pub use campaigns::CampaignDispatcher;
pub use claim::{ClaimCoordinator, ClaimResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use continuation::{ContinuationError, ContinuationScheduler};
pub use posts::{PostDispatcher, PostOutcome, PostReport};
pub use reclaim::StaleLockReclaimer;

/// How a campaign invocation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InvocationOutcome {
    NoActiveCampaign,
    CampaignCompleted { campaign_id: CampaignId },
    ContinuationScheduled { campaign_id: CampaignId, handle: String },
    BudgetExhausted,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::NoActiveCampaign => "no_active_campaign",
            InvocationOutcome::CampaignCompleted { .. } => "campaign_completed",
            InvocationOutcome::ContinuationScheduled { .. } => "continuation_scheduled",
            InvocationOutcome::BudgetExhausted => "budget_exhausted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationReport {
    #[serde(flatten)]
    pub outcome: InvocationOutcome,
    pub sent: u64,
    pub failed: u64,
    pub unsubscribed: u64,
    /// Failed sends handed back to the queue by the requeue policy.
    pub requeued: u64,
    /// Stale jobs reset at the start of the invocation.
    pub reclaimed: u64,
    /// Campaigns finalized as sent during this invocation.
    pub completed: Vec<CampaignId>,
    pub elapsed_ms: u64,
}

/// Invocation-level failures. Item-level failures never surface here; they
/// end up on the job row instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("continuation scheduling failed: {0}")]
    Continuation(#[from] ContinuationError),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Config(_) => "config",
            DispatchError::Store(_) => "store",
            DispatchError::Continuation(_) => "continuation",
        }
    }
}

/// Wall-clock budget of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: DateTime<Utc>,
    cutoff: DateTime<Utc>,
}

impl Budget {
    pub fn new(started: DateTime<Utc>, total: Duration, safety_margin: Duration) -> Self {
        let usable = total.saturating_sub(safety_margin);
        let cutoff = chrono::Duration::from_std(usable)
            .ok()
            .and_then(|d| started.checked_add_signed(d))
            .unwrap_or(started);
        Self { started, cutoff }
    }

    /// True once `now` is inside the trailing safety margin.
    pub fn nearly_spent(&self, now: DateTime<Utc>) -> bool {
        now >= self.cutoff
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.started).num_milliseconds()).unwrap_or(0)
    }
}
