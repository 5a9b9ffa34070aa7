//! Audience resolver: turns an audience specification into send jobs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use courier_campaigns::NewSendJob;
use courier_core::{CampaignId, EmailAddress};

use crate::store::{JobStore, StoreError};

/// One source of recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudienceSource {
    /// Addresses given inline.
    Addresses { addresses: Vec<String> },
    /// A named static segment.
    Segment { name: String },
    /// Subscribers carrying any of `tags`.
    Tagged { tags: Vec<String> },
    /// A list maintained by another system (CRM export, etc.).
    External { list: String },
}

/// The union of one or more sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceSpec {
    pub sources: Vec<AudienceSource>,
}

impl AudienceSpec {
    pub fn new(sources: Vec<AudienceSource>) -> Self {
        Self { sources }
    }

    pub fn addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(vec![AudienceSource::Addresses {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("unknown segment: {0}")]
    UnknownSegment(String),
    #[error("unknown external list: {0}")]
    UnknownList(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudienceError {
    #[error("campaign not found: {0}")]
    CampaignNotFound(CampaignId),
    #[error("audience resolved to zero recipients")]
    Empty,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where segment, tag and external-list members come from.
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn segment_members(&self, name: &str) -> Result<Vec<String>, DirectoryError>;

    /// Subscribers carrying at least one of `tags`.
    async fn tagged_subscribers(&self, tags: &[String]) -> Result<Vec<String>, DirectoryError>;

    async fn external_list(&self, list: &str) -> Result<Vec<String>, DirectoryError>;
}

/// Counters for one resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedAudience {
    /// Distinct valid addresses across all sources.
    pub recipients: usize,
    /// Rows actually inserted (re-runs insert zero).
    pub inserted: usize,
    /// Recipients already on the suppression list.
    pub suppressed: usize,
    /// Raw entries that failed address validation.
    pub invalid: usize,
}

pub struct AudienceResolver {
    store: Arc<dyn JobStore>,
    directory: Arc<dyn SubscriberDirectory>,
}

impl AudienceResolver {
    pub fn new(store: Arc<dyn JobStore>, directory: Arc<dyn SubscriberDirectory>) -> Self {
        Self { store, directory }
    }

    /// Resolve `spec` and insert one job per distinct recipient.
    ///
    /// Safe to re-run: existing `(campaign, address)` rows are left alone.
    /// Suppressed addresses are inserted as `unsubscribed`, not dropped.
    pub async fn resolve(
        &self,
        campaign_id: CampaignId,
        spec: &AudienceSpec,
        now: DateTime<Utc>,
    ) -> Result<ResolvedAudience, AudienceError> {
        if self.store.get_campaign(campaign_id).await?.is_none() {
            return Err(AudienceError::CampaignNotFound(campaign_id));
        }

        let mut raw = Vec::new();
        for source in &spec.sources {
            let members = match source {
                AudienceSource::Addresses { addresses } => addresses.clone(),
                AudienceSource::Segment { name } => self.directory.segment_members(name).await?,
                AudienceSource::Tagged { tags } => self.directory.tagged_subscribers(tags).await?,
                AudienceSource::External { list } => self.directory.external_list(list).await?,
            };
            debug!(?source, members = members.len(), "audience source loaded");
            raw.extend(members);
        }

        let mut report = ResolvedAudience::default();
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();
        for entry in raw {
            match EmailAddress::parse(&entry) {
                Ok(address) => {
                    if seen.insert(address.clone()) {
                        recipients.push(address);
                    }
                }
                Err(err) => {
                    report.invalid += 1;
                    debug!(entry = %entry, error = %err, "skipping invalid address");
                }
            }
        }

        if recipients.is_empty() {
            warn!(campaign_id = %campaign_id, invalid = report.invalid, "audience resolved to zero recipients");
            return Err(AudienceError::Empty);
        }
        report.recipients = recipients.len();

        let mut jobs = Vec::with_capacity(recipients.len());
        for address in recipients {
            if self.store.is_suppressed(&address).await? {
                report.suppressed += 1;
                jobs.push(NewSendJob::suppressed(campaign_id, address));
            } else {
                jobs.push(NewSendJob::queued(campaign_id, address));
            }
        }

        report.inserted = self.store.insert_send_jobs(jobs, now).await?;
        info!(
            campaign_id = %campaign_id,
            recipients = report.recipients,
            inserted = report.inserted,
            suppressed = report.suppressed,
            invalid = report.invalid,
            "audience resolved"
        );
        Ok(report)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySubscriberDirectory {
    segments: RwLock<HashMap<String, Vec<String>>>,
    subscribers: RwLock<Vec<(String, HashSet<String>)>>,
    lists: RwLock<HashMap<String, Vec<String>>>,
}

impl InMemorySubscriberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment<I, S>(&self, name: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut segments) = self.segments.write() {
            segments.insert(name.to_string(), members.into_iter().map(Into::into).collect());
        }
    }

    pub fn add_subscriber<I, S>(&self, address: &str, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push((address.to_string(), tags.into_iter().map(Into::into).collect()));
        }
    }

    pub fn add_external_list<I, S>(&self, name: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut lists) = self.lists.write() {
            lists.insert(name.to_string(), members.into_iter().map(Into::into).collect());
        }
    }
}

fn poisoned() -> DirectoryError {
    DirectoryError::Unavailable("lock poisoned".to_string())
}

#[async_trait]
impl SubscriberDirectory for InMemorySubscriberDirectory {
    async fn segment_members(&self, name: &str) -> Result<Vec<String>, DirectoryError> {
        self.segments
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownSegment(name.to_string()))
    }

    async fn tagged_subscribers(&self, tags: &[String]) -> Result<Vec<String>, DirectoryError> {
        let subscribers = self.subscribers.read().map_err(|_| poisoned())?;
        Ok(subscribers
            .iter()
            .filter(|(_, own)| tags.iter().any(|t| own.contains(t)))
            .map(|(address, _)| address.clone())
            .collect())
    }

    async fn external_list(&self, list: &str) -> Result<Vec<String>, DirectoryError> {
        self.lists
            .read()
            .map_err(|_| poisoned())?
            .get(list)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownList(list.to_string()))
    }
}
