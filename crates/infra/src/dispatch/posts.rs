//! Social post dispatch: due posts are claimed in batches and published,
//! with failures going through the exponential requeue policy.
//!
//! There is no continuation here. A requeued post carries its own
//! `scheduled_at`, so the next trigger picks it up once it is due.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use courier_campaigns::{Disposition, RecurringPost, RequeuePolicy};

use super::clock::Clock;
use super::reclaim::StaleLockReclaimer;
use super::{Budget, DispatchError};
use crate::config::DispatchConfig;
use crate::providers::{ProviderError, SocialProviders};
use crate::store::{JobStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOutcome {
    /// No due post was left to claim.
    Drained,
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReport {
    pub outcome: PostOutcome,
    pub published: u64,
    pub requeued: u64,
    pub failed: u64,
    pub reclaimed: u64,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct PostDispatcher {
    store: Arc<dyn JobStore>,
    providers: SocialProviders,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl PostDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        providers: SocialProviders,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            providers,
            clock,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<PostReport, DispatchError> {
        self.config.validate()?;
        let policy = self.config.retry_policy();
        let reclaimer = StaleLockReclaimer::new(self.store.clone(), self.config.stale_lock_threshold);

        let started = self.clock.now();
        let budget = Budget::new(started, self.config.time_budget, self.config.safety_margin);
        let mut report = PostReport {
            outcome: PostOutcome::Drained,
            published: 0,
            requeued: 0,
            failed: 0,
            reclaimed: reclaimer.reclaim_posts(started).await?,
            elapsed_ms: 0,
        };

        report.outcome = 'invocation: loop {
            let now = self.clock.now();
            if budget.nearly_spent(now) {
                break PostOutcome::BudgetExhausted;
            }
            let batch = self
                .store
                .claim_due_posts(self.config.batch_size.max(1), now)
                .await?;
            if batch.is_empty() {
                break PostOutcome::Drained;
            }

            let mut pending: VecDeque<RecurringPost> = batch.into();
            while let Some(post) = pending.pop_front() {
                let now = self.clock.now();
                if budget.nearly_spent(now) {
                    let unprocessed: Vec<_> = std::iter::once(post.id)
                        .chain(pending.iter().map(|p| p.id))
                        .collect();
                    reclaimer.release_unprocessed_posts(&unprocessed, now).await?;
                    break 'invocation PostOutcome::BudgetExhausted;
                }
                self.publish(post, &policy, &mut report).await?;
            }
        };

        report.elapsed_ms = budget.elapsed_ms(self.clock.now());
        info!(
            outcome = ?report.outcome,
            published = report.published,
            requeued = report.requeued,
            failed = report.failed,
            reclaimed = report.reclaimed,
            elapsed_ms = report.elapsed_ms,
            "post dispatch finished"
        );
        Ok(report)
    }

    async fn publish(
        &self,
        mut post: RecurringPost,
        policy: &RequeuePolicy,
        report: &mut PostReport,
    ) -> Result<(), StoreError> {
        let attempt = match self.providers.get(&post.provider) {
            Some(provider) => provider.publish(&post).await,
            None => Err(ProviderError::Rejected(format!(
                "no provider registered for {}",
                post.provider
            ))),
        };

        let now = self.clock.now();
        match attempt {
            Ok(reference) => {
                post.mark_published(reference, now)?;
                if self.store.record_post_outcome(&post).await? {
                    report.published += 1;
                }
            }
            Err(err) => {
                let disposition = post.apply_failure(err.to_string(), policy, now)?;
                if !self.store.record_post_outcome(&post).await? {
                    warn!(post_id = %post.id, "post no longer in flight, outcome dropped");
                    return Ok(());
                }
                match disposition {
                    Disposition::Retry { at, .. } => {
                        warn!(post_id = %post.id, attempt = post.attempt_count, retry_at = %at, error = %err, "publish failed, requeued");
                        report.requeued += 1;
                    }
                    Disposition::Fail => {
                        warn!(post_id = %post.id, attempt = post.attempt_count, error = %err, "publish failed permanently");
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }
}
