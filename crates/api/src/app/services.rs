//! Service wiring: store, providers, timer registry, dispatchers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use courier_infra::config::{DispatchConfig, DispatchIdentity};
use courier_infra::dispatch::{CampaignDispatcher, Clock, PostDispatcher, SystemClock};
use courier_infra::providers::{
    EmailProvider, HttpEmailProvider, OutboundEmail, ProviderError, SocialProviders,
};
use courier_infra::store::{InMemoryStore, JobStore, PostgresStore};
use courier_infra::timers::{
    HttpTimerRegistry, OneShotTimer, TimerError, TimerHandle, TimerRegistry, TriggerPayload,
};

pub struct AppServices {
    pub store: Arc<dyn JobStore>,
    pub campaigns: CampaignDispatcher,
    pub posts: PostDispatcher,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn new(
        store: Arc<dyn JobStore>,
        email: Arc<dyn EmailProvider>,
        social: SocialProviders,
        timers: Arc<dyn TimerRegistry>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        let campaigns = CampaignDispatcher::new(
            store.clone(),
            email,
            timers,
            clock.clone(),
            config.clone(),
        );
        let posts = PostDispatcher::new(store.clone(), social, clock.clone(), config);
        Self {
            store,
            campaigns,
            posts,
            clock,
        }
    }
}

/// Build services from the environment.
pub async fn build_services() -> anyhow::Result<Arc<AppServices>> {
    build_services_with(|key| std::env::var(key).ok()).await
}

/// Build services from an arbitrary settings lookup.
///
/// - `DATABASE_URL` selects Postgres; without it an in-memory store is used.
/// - `COURIER_SCHEDULER_URL` selects the HTTP timer service; without it
///   continuations fire in-process.
/// - `COURIER_EMAIL_API_URL`/`_KEY`/`COURIER_EMAIL_FROM` configure the email
///   provider; without them sends are only logged.
/// - `COURIER_SOCIAL_PROVIDERS` lists the social channels to publish to.
pub async fn build_services_with<F>(lookup: F) -> anyhow::Result<Arc<AppServices>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config =
        DispatchConfig::from_lookup(&lookup).context("invalid dispatch configuration")?;
    config.warn_if_stale_threshold_too_short();

    let store: Arc<dyn JobStore> = match lookup("DATABASE_URL") {
        Some(url) => {
            let pool = PgPool::connect(&url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresStore::new(pool);
            store.migrate().await.context("failed to apply schema")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory job store");
            InMemoryStore::arc()
        }
    };

    let email: Arc<dyn EmailProvider> = match (
        lookup("COURIER_EMAIL_API_URL"),
        lookup("COURIER_EMAIL_API_KEY"),
    ) {
        (Some(url), Some(key)) => {
            let from = lookup("COURIER_EMAIL_FROM")
                .context("COURIER_EMAIL_FROM must be set with COURIER_EMAIL_API_URL")?;
            Arc::new(HttpEmailProvider::new(url, key, from))
        }
        _ => {
            tracing::warn!("email provider not configured; sends are logged only");
            Arc::new(LogEmailProvider)
        }
    };

    let social = SocialProviders::from_lookup(&lookup).context("invalid social provider settings")?;
    if social.is_empty() {
        tracing::warn!("no social providers configured; due posts will fail");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match lookup("COURIER_SCHEDULER_URL") {
        Some(url) => {
            let timers = Arc::new(HttpTimerRegistry::new(url));
            Ok(Arc::new(AppServices::new(
                store,
                email,
                social,
                timers,
                clock,
                config,
            )))
        }
        None => {
            tracing::warn!("COURIER_SCHEDULER_URL not set; continuations run in-process");
            if config.identity.is_none() {
                config.identity = Some(DispatchIdentity {
                    target: "courier-api/dispatch".to_string(),
                    role: "local".to_string(),
                });
            }
            let (timers, fired) = LocalTimerRegistry::new();
            let services = Arc::new(AppServices::new(
                store,
                email,
                social,
                Arc::new(timers),
                clock,
                config,
            ));
            spawn_continuation_runner(services.clone(), fired);
            Ok(services)
        }
    }
}

/// Re-run the dispatcher whenever an in-process timer fires.
fn spawn_continuation_runner(
    services: Arc<AppServices>,
    mut fired: mpsc::UnboundedReceiver<TriggerPayload>,
) {
    tokio::spawn(async move {
        while let Some(payload) = fired.recv().await {
            match services.campaigns.run(payload).await {
                Ok(report) => tracing::info!(outcome = report.outcome.as_str(), "continuation ran"),
                Err(e) => tracing::error!(error = %e, "continuation failed"),
            }
        }
    });
}

/// Email provider that only logs. For development without provider keys.
#[derive(Debug, Default)]
pub struct LogEmailProvider;

#[async_trait]
impl EmailProvider for LogEmailProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError> {
        tracing::info!(to = %email.to, subject = %email.subject, "email send (log only)");
        Ok(())
    }
}

/// Timer registry backed by tokio tasks. A fired timer pushes its payload
/// onto a channel; timers do not survive a restart.
#[derive(Debug)]
pub struct LocalTimerRegistry {
    fired: mpsc::UnboundedSender<TriggerPayload>,
    pending: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl LocalTimerRegistry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TriggerPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fired: tx,
                pending: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }
}

#[async_trait]
impl TimerRegistry for LocalTimerRegistry {
    async fn create_one_shot(&self, timer: OneShotTimer) -> Result<TimerHandle, TimerError> {
        let handle = format!("local-{}", uuid::Uuid::now_v7().simple());
        let wait = (timer.fire_at - Utc::now()).to_std().unwrap_or_default();

        let fired = self.fired.clone();
        let pending = self.pending.clone();
        let key = handle.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if timer.auto_delete {
                if let Ok(mut pending) = pending.lock() {
                    pending.remove(&key);
                }
            }
            if let Err(err) = fired.send(timer.payload) {
                tracing::warn!(
                    handle = %key,
                    campaign_id = ?err.0.campaign_id,
                    "continuation runner is gone, timer dropped"
                );
            }
        });

        self.pending
            .lock()
            .map_err(|_| TimerError::Registration("lock poisoned".to_string()))?
            .insert(handle.clone(), task.abort_handle());
        Ok(TimerHandle(handle))
    }

    async fn delete(&self, handle: &TimerHandle) -> Result<(), TimerError> {
        let task = self
            .pending
            .lock()
            .map_err(|_| TimerError::Registration("lock poisoned".to_string()))?
            .remove(&handle.0);
        match task {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(TimerError::NotFound(handle.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use courier_campaigns::{NewPost, PostStatus};
    use courier_infra::store::PostStore;
    use serde_json::{Value, json};

    async fn fake_social_api() -> String {
        let app = axum::Router::new().route(
            "/publish",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer li-token");
                if !authorized || body["body"] != "We are hiring" {
                    return (StatusCode::UNAUTHORIZED, Json(json!({"error": "denied"})));
                }
                (StatusCode::OK, Json(json!({"id": "urn:li:share:42"})))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/publish")
    }

    #[tokio::test]
    async fn configured_social_channel_publishes_due_posts() {
        let settings: HashMap<&str, String> = HashMap::from([
            ("COURIER_SOCIAL_PROVIDERS", "linkedin".to_string()),
            ("COURIER_SOCIAL_LINKEDIN_URL", fake_social_api().await),
            ("COURIER_SOCIAL_LINKEDIN_TOKEN", "li-token".to_string()),
        ]);
        let services = build_services_with(|key| settings.get(key).cloned())
            .await
            .unwrap();

        let now = Utc::now();
        let queued = services
            .store
            .enqueue_post(
                NewPost {
                    provider: "linkedin".into(),
                    body: "We are hiring".into(),
                    media: vec![],
                    scheduled_at: now - chrono::Duration::minutes(1),
                },
                now,
            )
            .await
            .unwrap();

        let report = services.posts.run().await.unwrap();
        assert_eq!((report.published, report.requeued, report.failed), (1, 0, 0));
        let stored = services.store.get_post(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Sent);
        assert_eq!(stored.result.as_deref(), Some("urn:li:share:42"));
    }

    #[tokio::test]
    async fn listed_social_channel_without_settings_fails_startup() {
        let settings: HashMap<&str, String> =
            HashMap::from([("COURIER_SOCIAL_PROVIDERS", "linkedin".to_string())]);
        assert!(
            build_services_with(|key| settings.get(key).cloned())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fired_timer_without_runner_still_clears_its_handle() {
        let (registry, fired) = LocalTimerRegistry::new();
        drop(fired);
        registry
            .create_one_shot(OneShotTimer {
                target: "t".into(),
                role: "r".into(),
                fire_at: Utc::now(),
                payload: TriggerPayload::drain(),
                auto_delete: true,
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(registry.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_timer_fires_payload() {
        let (registry, mut fired) = LocalTimerRegistry::new();
        let campaign_id = courier_core::CampaignId::new();
        registry
            .create_one_shot(OneShotTimer {
                target: "t".into(),
                role: "r".into(),
                fire_at: Utc::now(),
                payload: TriggerPayload::pinned(campaign_id),
                auto_delete: true,
            })
            .await
            .unwrap();

        let payload = fired.recv().await.unwrap();
        assert_eq!(payload, TriggerPayload::pinned(campaign_id));
    }

    #[tokio::test]
    async fn deleted_local_timer_never_fires() {
        let (registry, mut fired) = LocalTimerRegistry::new();
        let handle = registry
            .create_one_shot(OneShotTimer {
                target: "t".into(),
                role: "r".into(),
                fire_at: Utc::now() + chrono::Duration::seconds(30),
                payload: TriggerPayload::drain(),
                auto_delete: true,
            })
            .await
            .unwrap();
        registry.delete(&handle).await.unwrap();
        drop(registry);
        assert!(fired.recv().await.is_none());
    }
}
