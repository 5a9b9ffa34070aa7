use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{CampaignId, DomainError, DomainResult};

use crate::template::MessageTemplate;

/// Campaign lifecycle.
///
/// `draft → scheduled → sending → sent`, with `draft → sending` for immediate
/// sends and `failed` reachable from any non-terminal state via cancellation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Sent | CampaignStatus::Failed)
    }
}

impl core::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CampaignStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(DomainError::validation(format!("unknown campaign status: {other}"))),
        }
    }
}

/// A bulk email campaign.
///
/// `scheduler_handle` refers to the timer that will start a scheduled
/// campaign and is only ever set while `status == Scheduled`.
/// `continuation_handle` refers to the most recent self-continuation timer
/// registered while the campaign was sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub scheduler_handle: Option<String>,
    pub continuation_handle: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a new draft campaign.
    pub fn draft(
        subject: impl Into<String>,
        html: impl Into<String>,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let subject = subject.into();
        let html = html.into();
        let text = text.into();

        if subject.trim().is_empty() {
            return Err(DomainError::validation("subject cannot be empty"));
        }
        if html.trim().is_empty() && text.trim().is_empty() {
            return Err(DomainError::validation("campaign needs an html or text body"));
        }

        Ok(Self {
            id: CampaignId::new(),
            subject,
            html,
            text,
            status: CampaignStatus::Draft,
            scheduled_at: None,
            scheduler_handle: None,
            continuation_handle: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn template(&self) -> MessageTemplate {
        MessageTemplate {
            subject: self.subject.clone(),
            html: self.html.clone(),
            text: self.text.clone(),
        }
    }

    /// Schedule a draft for a future start. `handle` identifies the timer
    /// that will trigger the dispatcher at `at`.
    pub fn schedule(
        &mut self,
        at: DateTime<Utc>,
        handle: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != CampaignStatus::Draft {
            return Err(DomainError::invariant(format!(
                "only draft campaigns can be scheduled (status is {})",
                self.status
            )));
        }
        self.status = CampaignStatus::Scheduled;
        self.scheduled_at = Some(at);
        self.scheduler_handle = Some(handle.into());
        self.updated_at = now;
        Ok(())
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Scheduled && self.scheduled_at.is_some_and(|at| at <= now)
    }

    /// Move a draft or scheduled campaign into `sending`.
    ///
    /// Returns the scheduler handle that was cleared, if any.
    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<Option<String>> {
        match self.status {
            CampaignStatus::Draft | CampaignStatus::Scheduled => {
                self.status = CampaignStatus::Sending;
                self.updated_at = now;
                Ok(self.scheduler_handle.take())
            }
            other => Err(DomainError::invariant(format!(
                "cannot start a campaign in status {other}"
            ))),
        }
    }

    /// Promote a scheduled campaign whose start time has passed.
    ///
    /// Returns `false` (and changes nothing) when the campaign is not due.
    pub fn promote_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.status = CampaignStatus::Sending;
        self.scheduler_handle = None;
        self.updated_at = now;
        true
    }

    /// Record the handle of a freshly registered continuation timer.
    pub fn record_continuation(
        &mut self,
        handle: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != CampaignStatus::Sending {
            return Err(DomainError::invariant(format!(
                "continuations belong to sending campaigns (status is {})",
                self.status
            )));
        }
        self.continuation_handle = Some(handle.into());
        self.updated_at = now;
        Ok(())
    }

    /// Finalize a campaign whose jobs are all resolved.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != CampaignStatus::Sending {
            return Err(DomainError::invariant(format!(
                "only sending campaigns can be finalized (status is {})",
                self.status
            )));
        }
        self.status = CampaignStatus::Sent;
        self.sent_at = Some(now);
        self.continuation_handle = None;
        self.updated_at = now;
        Ok(())
    }

    /// Cancel a campaign that has not finished.
    ///
    /// Returns every timer handle that was attached so the caller can delete
    /// the pending timers. Queued send jobs are left untouched.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<Vec<String>> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "campaign already finished (status is {})",
                self.status
            )));
        }
        self.status = CampaignStatus::Failed;
        self.updated_at = now;
        Ok(self
            .scheduler_handle
            .take()
            .into_iter()
            .chain(self.continuation_handle.take())
            .collect())
    }
}
