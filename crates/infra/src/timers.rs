//! One-shot timer registry (the external scheduler that re-invokes the
//! dispatcher).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::CampaignId;

/// Body delivered to the dispatcher when a trigger or timer fires.
///
/// An absent `campaign_id` drains any sending campaign; a present one pins
/// the invocation to that campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<CampaignId>,
}

impl TriggerPayload {
    pub fn drain() -> Self {
        Self { campaign_id: None }
    }

    pub fn pinned(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id: Some(campaign_id),
        }
    }
}

/// Opaque reference to a registered timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerHandle(pub String);

impl core::fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A timer that fires once and then removes itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneShotTimer {
    /// What to invoke.
    pub target: String,
    /// Role the invocation runs as; only allowed to trigger the dispatcher.
    pub role: String,
    /// Absolute UTC fire time, whole seconds.
    pub fire_at: DateTime<Utc>,
    pub payload: TriggerPayload,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("timer registration failed: {0}")]
    Registration(String),
    #[error("timer not found: {0}")]
    NotFound(String),
    #[error("timer service transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait TimerRegistry: Send + Sync {
    async fn create_one_shot(&self, timer: OneShotTimer) -> Result<TimerHandle, TimerError>;

    async fn delete(&self, handle: &TimerHandle) -> Result<(), TimerError>;
}

/// In-memory registry for tests/dev. Records timers instead of firing them.
#[derive(Debug, Default)]
pub struct InMemoryTimerRegistry {
    timers: Mutex<Vec<(TimerHandle, OneShotTimer)>>,
    fail_next: Mutex<Option<String>>,
}

impl InMemoryTimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `create_one_shot` fail with `reason`.
    pub fn fail_next(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.fail_next.lock() {
            *slot = Some(reason.into());
        }
    }

    /// Timers still registered, oldest first.
    pub fn pending(&self) -> Vec<(TimerHandle, OneShotTimer)> {
        self.timers.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TimerRegistry for InMemoryTimerRegistry {
    async fn create_one_shot(&self, timer: OneShotTimer) -> Result<TimerHandle, TimerError> {
        let failure = self
            .fail_next
            .lock()
            .map_err(|_| TimerError::Registration("lock poisoned".to_string()))?
            .take();
        if let Some(reason) = failure {
            return Err(TimerError::Registration(reason));
        }

        let mut timers = self
            .timers
            .lock()
            .map_err(|_| TimerError::Registration("lock poisoned".to_string()))?;
        let handle = TimerHandle(format!("timer-{}", uuid::Uuid::new_v4().simple()));
        timers.push((handle.clone(), timer));
        Ok(handle)
    }

    async fn delete(&self, handle: &TimerHandle) -> Result<(), TimerError> {
        let mut timers = self
            .timers
            .lock()
            .map_err(|_| TimerError::Registration("lock poisoned".to_string()))?;
        let before = timers.len();
        timers.retain(|(h, _)| h != handle);
        if timers.len() == before {
            return Err(TimerError::NotFound(handle.to_string()));
        }
        Ok(())
    }
}

/// Registry backed by an HTTP scheduler service.
///
/// `POST {base}/timers` with the [`OneShotTimer`] as JSON returns
/// `{"handle": "..."}`; `DELETE {base}/timers/{handle}` removes one.
#[derive(Debug, Clone)]
pub struct HttpTimerRegistry {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTimer {
    handle: String,
}

impl HttpTimerRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TimerRegistry for HttpTimerRegistry {
    async fn create_one_shot(&self, timer: OneShotTimer) -> Result<TimerHandle, TimerError> {
        let resp = self
            .client
            .post(format!("{}/timers", self.base_url))
            .json(&timer)
            .send()
            .await
            .map_err(|e| TimerError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TimerError::Registration(format!("{status}: {body}")));
        }

        let created: CreatedTimer = resp
            .json()
            .await
            .map_err(|e| TimerError::Registration(format!("malformed response: {e}")))?;
        Ok(TimerHandle(created.handle))
    }

    async fn delete(&self, handle: &TimerHandle) -> Result<(), TimerError> {
        let resp = self
            .client
            .delete(format!("{}/timers/{}", self.base_url, handle))
            .send()
            .await
            .map_err(|e| TimerError::Transport(e.to_string()))?;

        match resp.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(TimerError::NotFound(handle.to_string())),
            status => Err(TimerError::Transport(format!(
                "unexpected status {status} deleting timer {handle}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> OneShotTimer {
        OneShotTimer {
            target: "dispatch".into(),
            role: "invoker".into(),
            fire_at: Utc::now(),
            payload: TriggerPayload::pinned(CampaignId::new()),
            auto_delete: true,
        }
    }

    #[tokio::test]
    async fn records_and_deletes_timers() {
        let registry = InMemoryTimerRegistry::new();
        let handle = registry.create_one_shot(timer()).await.unwrap();
        assert_eq!(registry.pending().len(), 1);
        registry.delete(&handle).await.unwrap();
        assert!(registry.pending().is_empty());
        assert!(matches!(
            registry.delete(&handle).await,
            Err(TimerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let registry = InMemoryTimerRegistry::new();
        registry.fail_next("scheduler down");
        assert!(registry.create_one_shot(timer()).await.is_err());
        assert!(registry.create_one_shot(timer()).await.is_ok());
    }

    #[test]
    fn trigger_payload_omits_absent_campaign() {
        let json = serde_json::to_string(&TriggerPayload::drain()).unwrap();
        assert_eq!(json, "{}");
        let parsed: TriggerPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, TriggerPayload::drain());
    }
}
