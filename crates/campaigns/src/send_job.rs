//! Per-recipient send tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_core::{CampaignId, DomainError, DomainResult, EmailAddress, SendJobId};

/// Send job status.
///
/// Transitions only move forward (`queued → sending → sent | failed |
/// unsubscribed`, plus `queued → unsubscribed`). The exceptions are
/// `sending → queued` by the stale-lock reclaimer, and a deferred retry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendJobStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Unsubscribed,
}

impl SendJobStatus {
    pub const ALL: [SendJobStatus; 5] = [
        SendJobStatus::Queued,
        SendJobStatus::Sending,
        SendJobStatus::Sent,
        SendJobStatus::Failed,
        SendJobStatus::Unsubscribed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SendJobStatus::Queued => "queued",
            SendJobStatus::Sending => "sending",
            SendJobStatus::Sent => "sent",
            SendJobStatus::Failed => "failed",
            SendJobStatus::Unsubscribed => "unsubscribed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SendJobStatus::Sent | SendJobStatus::Failed | SendJobStatus::Unsubscribed
        )
    }
}

impl core::fmt::Display for SendJobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for SendJobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SendJobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown send job status: {s}")))
    }
}

/// Opaque token embedded in the unsubscribe link of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnsubscribeToken(String);

impl UnsubscribeToken {
    /// A fresh random token (128 bits, hex).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(token: impl Into<String>) -> DomainResult<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(DomainError::validation("unsubscribe token cannot be empty"));
        }
        Ok(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for UnsubscribeToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of one delivery attempt, as recorded on the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Provider or render failure; the message is stored verbatim.
    Failed(String),
    /// Address was found on the suppression list at send time.
    Unsubscribed,
    /// Failed, but the requeue policy allows another attempt no earlier
    /// than `retry_at`.
    Deferred {
        error: String,
        retry_at: DateTime<Utc>,
    },
}

impl SendOutcome {
    pub fn status(&self) -> SendJobStatus {
        match self {
            SendOutcome::Sent => SendJobStatus::Sent,
            SendOutcome::Failed(_) => SendJobStatus::Failed,
            SendOutcome::Unsubscribed => SendJobStatus::Unsubscribed,
            SendOutcome::Deferred { .. } => SendJobStatus::Queued,
        }
    }

    /// Message stored in `last_error`, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            SendOutcome::Failed(message) => Some(message),
            SendOutcome::Deferred { error, .. } => Some(error),
            SendOutcome::Sent | SendOutcome::Unsubscribed => None,
        }
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            SendOutcome::Deferred { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }
}

/// A row waiting to be inserted by the audience resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSendJob {
    pub campaign_id: CampaignId,
    pub address: EmailAddress,
    pub unsubscribe_token: UnsubscribeToken,
    /// `Queued`, or `Unsubscribed` when the address was already suppressed.
    pub status: SendJobStatus,
}

impl NewSendJob {
    pub fn queued(campaign_id: CampaignId, address: EmailAddress) -> Self {
        Self {
            campaign_id,
            address,
            unsubscribe_token: UnsubscribeToken::generate(),
            status: SendJobStatus::Queued,
        }
    }

    pub fn suppressed(campaign_id: CampaignId, address: EmailAddress) -> Self {
        Self {
            status: SendJobStatus::Unsubscribed,
            ..Self::queued(campaign_id, address)
        }
    }

    pub fn into_job(self, now: DateTime<Utc>) -> SendJob {
        SendJob {
            id: SendJobId::new(),
            campaign_id: self.campaign_id,
            address: self.address,
            status: self.status,
            attempt_count: 0,
            last_error: None,
            retry_at: None,
            unsubscribe_token: Some(self.unsubscribe_token),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One recipient of one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJob {
    pub id: SendJobId,
    pub campaign_id: CampaignId,
    pub address: EmailAddress,
    pub status: SendJobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Not claimable before this instant. Set by a deferred retry.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    pub unsubscribe_token: Option<UnsubscribeToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendJob {
    /// `queued → sending`. Bumps the attempt counter and makes sure the job
    /// carries a usable unsubscribe token.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != SendJobStatus::Queued {
            return Err(DomainError::invariant(format!(
                "job {} cannot be claimed from {}",
                self.id, self.status
            )));
        }
        self.status = SendJobStatus::Sending;
        self.attempt_count += 1;
        self.retry_at = None;
        if self.unsubscribe_token.is_none() {
            self.unsubscribe_token = Some(UnsubscribeToken::generate());
        }
        self.updated_at = now;
        Ok(())
    }

    /// Apply the outcome of a delivery attempt to a claimed job.
    pub fn record(&mut self, outcome: &SendOutcome, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != SendJobStatus::Sending {
            return Err(DomainError::invariant(format!(
                "job {} has no attempt in flight (status is {})",
                self.id, self.status
            )));
        }
        self.status = outcome.status();
        if let Some(message) = outcome.error() {
            self.last_error = Some(message.to_string());
        }
        self.retry_at = outcome.retry_at();
        self.updated_at = now;
        Ok(())
    }

    /// Opt-out via unsubscribe link. Finished jobs keep their status.
    ///
    /// Returns whether the status changed.
    pub fn unsubscribe(&mut self, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = SendJobStatus::Unsubscribed;
        self.updated_at = now;
        true
    }

    /// Queued and past any retry delay.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SendJobStatus::Queued && self.retry_at.is_none_or(|at| at <= now)
    }

    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == SendJobStatus::Sending && self.updated_at < cutoff
    }

    /// `sending → queued`. Only the stale-lock reclaimer calls this.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SendJobStatus::Sending {
            return false;
        }
        self.status = SendJobStatus::Queued;
        self.last_error = None;
        self.updated_at = now;
        true
    }
}
