//! Campaign dispatch loop.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use courier_campaigns::{
    Campaign, CampaignStatus, Disposition, MessageTemplate, RequeuePolicy, SendJob, SendOutcome,
    TemplateVariables,
};
use courier_core::CampaignId;

use super::claim::{ClaimCoordinator, ClaimResult};
use super::clock::Clock;
use super::continuation::{self, ContinuationScheduler};
use super::reclaim::StaleLockReclaimer;
use super::{Budget, DispatchError, InvocationOutcome, InvocationReport};
use crate::config::DispatchConfig;
use crate::providers::{EmailProvider, OutboundEmail};
use crate::store::{JobStore, StoreError};
use crate::timers::{TimerRegistry, TriggerPayload};

/// Runs one time-boxed invocation over the sending campaigns.
#[derive(Clone)]
pub struct CampaignDispatcher {
    store: Arc<dyn JobStore>,
    email: Arc<dyn EmailProvider>,
    timers: Arc<dyn TimerRegistry>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    email_policy: RequeuePolicy,
}

/// Per-invocation collaborators, built once the configuration checks out.
struct Invocation {
    reclaimer: StaleLockReclaimer,
    claims: ClaimCoordinator,
    continuations: ContinuationScheduler,
    budget: Budget,
    report: InvocationReport,
}

impl CampaignDispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        email: Arc<dyn EmailProvider>,
        timers: Arc<dyn TimerRegistry>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            email,
            timers,
            clock,
            email_policy: config.email_policy(),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Cancel a campaign and delete its pending timers.
    pub async fn cancel(&self, campaign_id: CampaignId) -> Result<usize, DispatchError> {
        let deleted = continuation::cancel_campaign(
            self.store.as_ref(),
            self.timers.as_ref(),
            campaign_id,
            self.clock.now(),
        )
        .await?;
        Ok(deleted.len())
    }

    #[instrument(skip(self), fields(pinned = ?trigger.campaign_id))]
    pub async fn run(&self, trigger: TriggerPayload) -> Result<InvocationReport, DispatchError> {
        self.config.validate()?;
        let identity = self.config.require_identity()?.clone();

        let started = self.clock.now();
        let mut inv = Invocation {
            reclaimer: StaleLockReclaimer::new(self.store.clone(), self.config.stale_lock_threshold),
            claims: ClaimCoordinator::new(self.store.clone(), self.config.batch_size),
            continuations: ContinuationScheduler::new(
                self.timers.clone(),
                self.store.clone(),
                identity,
                self.config.continuation_delay,
            ),
            budget: Budget::new(started, self.config.time_budget, self.config.safety_margin),
            report: InvocationReport {
                outcome: InvocationOutcome::NoActiveCampaign,
                sent: 0,
                failed: 0,
                unsubscribed: 0,
                requeued: 0,
                reclaimed: 0,
                completed: Vec::new(),
                elapsed_ms: 0,
            },
        };

        inv.report.reclaimed = inv.reclaimer.reclaim_send_jobs(started).await?;
        let outcome = self.drive(&mut inv, trigger.campaign_id).await?;

        let mut report = inv.report;
        report.outcome = outcome;
        report.elapsed_ms = inv.budget.elapsed_ms(self.clock.now());
        info!(
            outcome = report.outcome.as_str(),
            sent = report.sent,
            failed = report.failed,
            unsubscribed = report.unsubscribed,
            requeued = report.requeued,
            reclaimed = report.reclaimed,
            completed = report.completed.len(),
            elapsed_ms = report.elapsed_ms,
            "dispatch invocation finished"
        );
        Ok(report)
    }

    async fn drive(
        &self,
        inv: &mut Invocation,
        pinned: Option<CampaignId>,
    ) -> Result<InvocationOutcome, DispatchError> {
        // Campaigns this invocation is done with: finalized, or drained of
        // queued work while other invocations still hold jobs.
        let mut skip: Vec<CampaignId> = Vec::new();
        let mut current: Option<CampaignId> = None;

        loop {
            let now = self.clock.now();
            if inv.budget.nearly_spent(now) {
                return self.stop(inv, current, now).await;
            }

            let promoted = self.store.promote_due_campaigns(now).await?;
            if !promoted.is_empty() {
                info!(promoted = promoted.len(), "scheduled campaigns promoted to sending");
            }

            let Some(campaign) = self.select(pinned, &skip).await? else {
                return Ok(match inv.report.completed.last() {
                    Some(&campaign_id) => InvocationOutcome::CampaignCompleted { campaign_id },
                    None => InvocationOutcome::NoActiveCampaign,
                });
            };
            current = Some(campaign.id);

            match inv.claims.claim(campaign.id, now).await? {
                ClaimResult::Completed => {
                    inv.report.completed.push(campaign.id);
                    skip.push(campaign.id);
                    current = None;
                }
                ClaimResult::Idle { in_flight } => {
                    debug!(campaign_id = %campaign.id, in_flight, "campaign has no queued jobs left");
                    skip.push(campaign.id);
                    current = None;
                }
                ClaimResult::Deferred { waiting } => {
                    debug!(campaign_id = %campaign.id, waiting, "campaign only has retries that are not due");
                    skip.push(campaign.id);
                    current = None;
                }
                ClaimResult::Batch(batch) => {
                    if let Some(outcome) = self.process_batch(inv, &campaign, batch).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn select(
        &self,
        pinned: Option<CampaignId>,
        skip: &[CampaignId],
    ) -> Result<Option<Campaign>, StoreError> {
        match pinned {
            Some(id) if skip.contains(&id) => Ok(None),
            Some(id) => {
                let campaign = self.store.get_campaign(id).await?;
                match campaign {
                    Some(c) if c.status == CampaignStatus::Sending => Ok(Some(c)),
                    Some(c) => {
                        info!(campaign_id = %id, status = %c.status, "pinned campaign is not sending");
                        Ok(None)
                    }
                    None => {
                        warn!(campaign_id = %id, "pinned campaign does not exist");
                        Ok(None)
                    }
                }
            }
            None => self.store.next_sending_campaign(skip).await,
        }
    }

    /// Send every job of one claimed batch. Returns an outcome when the
    /// budget ran out mid-batch.
    async fn process_batch(
        &self,
        inv: &mut Invocation,
        campaign: &Campaign,
        batch: Vec<SendJob>,
    ) -> Result<Option<InvocationOutcome>, DispatchError> {
        let template = campaign.template();
        let mut pending: VecDeque<SendJob> = batch.into();

        while let Some(job) = pending.front() {
            let now = self.clock.now();
            if inv.budget.nearly_spent(now) {
                let unprocessed: Vec<_> = pending.iter().map(|j| j.id).collect();
                inv.reclaimer.release_unprocessed(&unprocessed, now).await?;
                return self.stop(inv, Some(campaign.id), now).await.map(Some);
            }
            self.deliver(inv, campaign.id, &template, job).await?;
            pending.pop_front();
        }
        Ok(None)
    }

    async fn deliver(
        &self,
        inv: &mut Invocation,
        campaign_id: CampaignId,
        template: &MessageTemplate,
        job: &SendJob,
    ) -> Result<(), StoreError> {
        if self.store.is_suppressed(&job.address).await? {
            debug!(job_id = %job.id, "address suppressed, skipping send");
            if self.record(job, SendOutcome::Unsubscribed).await? {
                inv.report.unsubscribed += 1;
            }
            return Ok(());
        }

        let Some(token) = job.unsubscribe_token.as_ref() else {
            if self
                .record(job, SendOutcome::Failed("job has no unsubscribe token".into()))
                .await?
            {
                inv.report.failed += 1;
            }
            return Ok(());
        };

        let vars = TemplateVariables::for_recipient(
            campaign_id,
            &job.address,
            token,
            &self.config.unsubscribe_base_url,
        );
        let message = match template.render(&vars) {
            Ok(message) => message,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "render failed");
                if self.record(job, SendOutcome::Failed(err.to_string())).await? {
                    inv.report.failed += 1;
                }
                return Ok(());
            }
        };

        match self.email.send(&OutboundEmail::new(job.address.clone(), message)).await {
            Ok(()) => {
                if self.record(job, SendOutcome::Sent).await? {
                    inv.report.sent += 1;
                }
            }
            Err(err) => {
                let now = self.clock.now();
                match self.email_policy.on_failure(job.attempt_count, now) {
                    Disposition::Fail => {
                        warn!(job_id = %job.id, attempt = job.attempt_count, error = %err, "send failed");
                        if self.record(job, SendOutcome::Failed(err.to_string())).await? {
                            inv.report.failed += 1;
                        }
                    }
                    Disposition::Retry { at, delay } => {
                        warn!(
                            job_id = %job.id,
                            attempt = job.attempt_count,
                            delay_secs = delay.as_secs(),
                            retry_at = %at,
                            error = %err,
                            "send failed, requeued"
                        );
                        let outcome = SendOutcome::Deferred {
                            error: err.to_string(),
                            retry_at: at,
                        };
                        if self.record(job, outcome).await? {
                            inv.report.requeued += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn record(&self, job: &SendJob, outcome: SendOutcome) -> Result<bool, StoreError> {
        let recorded = self
            .store
            .record_send_outcome(job.id, &outcome, self.clock.now())
            .await?;
        if !recorded {
            warn!(job_id = %job.id, status = %outcome.status(), "job no longer in flight, outcome dropped");
        }
        Ok(recorded)
    }

    /// Budget is nearly spent: hand the current campaign to a continuation,
    /// or stop if there is none.
    async fn stop(
        &self,
        inv: &Invocation,
        current: Option<CampaignId>,
        now: DateTime<Utc>,
    ) -> Result<InvocationOutcome, DispatchError> {
        match current {
            Some(campaign_id) => {
                let handle = inv.continuations.schedule(campaign_id, now).await?;
                Ok(InvocationOutcome::ContinuationScheduled {
                    campaign_id,
                    handle: handle.0,
                })
            }
            None => Ok(InvocationOutcome::BudgetExhausted),
        }
    }
}
