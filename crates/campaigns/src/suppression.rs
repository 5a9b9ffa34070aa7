use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{DomainError, EmailAddress};

/// Why an address was put on the global suppression list.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Unsubscribed,
    Bounced,
    Complained,
    Manual,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::Unsubscribed => "unsubscribed",
            SuppressionReason::Bounced => "bounced",
            SuppressionReason::Complained => "complained",
            SuppressionReason::Manual => "manual",
        }
    }
}

impl core::str::FromStr for SuppressionReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubscribed" => Ok(SuppressionReason::Unsubscribed),
            "bounced" => Ok(SuppressionReason::Bounced),
            "complained" => Ok(SuppressionReason::Complained),
            "manual" => Ok(SuppressionReason::Manual),
            other => Err(DomainError::validation(format!(
                "unknown suppression reason: {other}"
            ))),
        }
    }
}

/// Global opt-out. Not tied to any campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub address: EmailAddress,
    pub reason: SuppressionReason,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn new(address: EmailAddress, reason: SuppressionReason, now: DateTime<Utc>) -> Self {
        Self {
            address,
            reason,
            created_at: now,
        }
    }
}
