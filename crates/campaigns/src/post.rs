//! Scheduled social posts.
//!
//! Same lifecycle as a send job, except that a failed attempt may cycle back
//! to `queued` with a later `scheduled_at` under the [`RequeuePolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{DomainError, DomainResult, PostId};

use crate::requeue::{Disposition, RequeuePolicy};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Queued => "queued",
            PostStatus::Sending => "sending",
            PostStatus::Sent => "sent",
            PostStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PostStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PostStatus::Queued),
            "sending" => Ok(PostStatus::Sending),
            "sent" => Ok(PostStatus::Sent),
            "failed" => Ok(PostStatus::Failed),
            other => Err(DomainError::validation(format!("unknown post status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    pub provider: String,
    pub body: String,
    #[serde(default)]
    pub media: Vec<String>,
    pub scheduled_at: DateTime<Utc>,
}

impl NewPost {
    pub fn into_post(self, now: DateTime<Utc>) -> DomainResult<RecurringPost> {
        if self.provider.trim().is_empty() {
            return Err(DomainError::validation("post provider cannot be empty"));
        }
        if self.body.trim().is_empty() && self.media.is_empty() {
            return Err(DomainError::validation("post needs a body or media"));
        }
        Ok(RecurringPost {
            id: PostId::new(),
            provider: self.provider,
            body: self.body,
            media: self.media,
            status: PostStatus::Queued,
            attempt_count: 0,
            scheduled_at: self.scheduled_at,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringPost {
    pub id: PostId,
    /// Channel key, e.g. `"linkedin"`.
    pub provider: String,
    pub body: String,
    pub media: Vec<String>,
    pub status: PostStatus,
    pub attempt_count: u32,
    pub scheduled_at: DateTime<Utc>,
    /// Provider reference of the published post.
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringPost {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == PostStatus::Queued && self.scheduled_at <= now
    }

    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == PostStatus::Sending && self.updated_at < cutoff
    }

    /// `queued → sending`; the attempt is counted here, not on failure.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_due(now) {
            return Err(DomainError::invariant(format!(
                "post {} is not due (status {}, scheduled {})",
                self.id, self.status, self.scheduled_at
            )));
        }
        self.status = PostStatus::Sending;
        self.attempt_count += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_published(&mut self, result: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_in_flight()?;
        self.status = PostStatus::Sent;
        self.result = Some(result.into());
        self.error = None;
        self.updated_at = now;
        Ok(())
    }

    /// Apply `policy` to a failed attempt and return what was decided.
    pub fn apply_failure(
        &mut self,
        error: impl Into<String>,
        policy: &RequeuePolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<Disposition> {
        self.ensure_in_flight()?;
        let disposition = policy.on_failure(self.attempt_count, now);
        match disposition {
            Disposition::Retry { at, .. } => {
                self.status = PostStatus::Queued;
                self.scheduled_at = at;
            }
            Disposition::Fail => self.status = PostStatus::Failed,
        }
        self.error = Some(error.into());
        self.updated_at = now;
        Ok(disposition)
    }

    /// `sending → queued` after a crashed attempt.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != PostStatus::Sending {
            return false;
        }
        self.status = PostStatus::Queued;
        self.error = None;
        self.updated_at = now;
        true
    }

    fn ensure_in_flight(&self) -> DomainResult<()> {
        if self.status != PostStatus::Sending {
            return Err(DomainError::invariant(format!(
                "post {} has no attempt in flight (status is {})",
                self.id, self.status
            )));
        }
        Ok(())
    }
}
