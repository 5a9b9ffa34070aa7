//! End-to-end dispatch tests.
//!
//! Tests: Audience → JobStore → CampaignDispatcher → provider / timers
//!
//! Verifies:
//! - Budget exhaustion hands the campaign to a continuation
//! - Empty claims finalize campaigns
//! - Email and social retries wait out their backoff
//! - Suppressed and malformed items never block their batch

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    use courier_campaigns::{
        Campaign, CampaignStatus, NewPost, NewSendJob, PostStatus, RecurringPost, SendJobStatus,
        SuppressionEntry, SuppressionReason,
    };
    use courier_core::{CampaignId, EmailAddress, SendJobId};

    use crate::audience::{AudienceResolver, AudienceSpec, InMemorySubscriberDirectory};
    use crate::config::{ConfigError, DispatchConfig, DispatchIdentity};
    use crate::dispatch::{
        CampaignDispatcher, Clock, DispatchError, InvocationOutcome, ManualClock, PostDispatcher,
        PostOutcome,
    };
    use crate::providers::{
        EmailProvider, OutboundEmail, ProviderError, SocialProvider, SocialProviders,
    };
    use crate::store::{
        CampaignStore, InMemoryStore, PostStore, SendJobStore, SuppressionList,
    };
    use crate::timers::{InMemoryTimerRegistry, TriggerPayload};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            identity: Some(DispatchIdentity {
                target: "courier-dispatch".into(),
                role: "dispatch-invoker".into(),
            }),
            unsubscribe_base_url: "https://mail.example.com/u".into(),
            ..DispatchConfig::default()
        }
    }

    /// Email provider that records every call and advances the clock by a
    /// fixed amount per send.
    struct RecordingEmail {
        clock: Arc<ManualClock>,
        per_send: Duration,
        reject: HashSet<String>,
        calls: Mutex<Vec<OutboundEmail>>,
        attempted_at: Mutex<Vec<DateTime<Utc>>>,
    }

    impl RecordingEmail {
        fn new(clock: Arc<ManualClock>, per_send: Duration) -> Self {
            Self {
                clock,
                per_send,
                reject: HashSet::new(),
                calls: Mutex::new(Vec::new()),
                attempted_at: Mutex::new(Vec::new()),
            }
        }

        fn rejecting(mut self, address: &str) -> Self {
            self.reject.insert(address.to_string());
            self
        }

        fn recipients(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.to.to_string())
                .collect()
        }
    }

    #[async_trait]
    impl EmailProvider for RecordingEmail {
        async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError> {
            self.attempted_at.lock().unwrap().push(self.clock.now());
            self.clock.advance(self.per_send);
            self.calls.lock().unwrap().push(email.clone());
            if self.reject.contains(email.to.as_str()) {
                return Err(ProviderError::Rejected("mailbox unavailable".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        timers: Arc<InMemoryTimerRegistry>,
        clock: Arc<ManualClock>,
        email: Arc<RecordingEmail>,
        dispatcher: CampaignDispatcher,
    }

    fn harness_with(email: RecordingEmail, clock: Arc<ManualClock>, config: DispatchConfig) -> Harness {
        let store = InMemoryStore::arc();
        let timers = InMemoryTimerRegistry::arc();
        let email = Arc::new(email);
        let dispatcher = CampaignDispatcher::new(
            store.clone(),
            email.clone(),
            timers.clone(),
            clock.clone(),
            config,
        );
        Harness {
            store,
            timers,
            clock,
            email,
            dispatcher,
        }
    }

    fn harness(per_send: Duration) -> Harness {
        let clock = Arc::new(ManualClock::new(start()));
        harness_with(RecordingEmail::new(clock.clone(), per_send), clock, config())
    }

    async fn sending_campaign(h: &Harness, html: &str, addresses: &[String]) -> CampaignId {
        let now = h.clock.now();
        let campaign = Campaign::draft("Spring news", html, "", now).unwrap();
        let id = h.store.create_campaign(campaign).await.unwrap();
        let directory = Arc::new(InMemorySubscriberDirectory::new());
        AudienceResolver::new(h.store.clone(), directory)
            .resolve(id, &AudienceSpec::addresses(addresses.iter().cloned()), now)
            .await
            .unwrap();
        h.store.start_campaign(id, now).await.unwrap();
        id
    }

    fn recipients(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("reader{i:03}@example.com")).collect()
    }

    async fn count(h: &Harness, id: CampaignId, status: SendJobStatus) -> u64 {
        h.store.count_send_jobs(id, status).await.unwrap()
    }

    #[tokio::test]
    async fn budget_exhausted_after_first_batch_schedules_continuation() {
        // 50 sends at 11s each cross the 540s usable budget.
        let h = harness(Duration::from_secs(11));
        let id = sending_campaign(&h, "<p>Hi {{ email }}</p>", &recipients(120)).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();

        let InvocationOutcome::ContinuationScheduled { campaign_id, handle } = &report.outcome else {
            panic!("expected a continuation, got {:?}", report.outcome);
        };
        assert_eq!(*campaign_id, id);
        assert!(report.sent <= 50);
        assert_eq!(report.sent, 50);
        assert!(count(&h, id, SendJobStatus::Queued).await >= 70);
        assert_eq!(count(&h, id, SendJobStatus::Sending).await, 0);

        let pending = h.timers.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(&pending[0].0 .0, handle);
        assert_eq!(pending[0].1.payload, TriggerPayload::pinned(id));

        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sending);
        assert_eq!(campaign.continuation_handle.as_deref(), Some(handle.as_str()));
    }

    #[tokio::test]
    async fn continuations_resume_until_campaign_completes() {
        let h = harness(Duration::from_secs(11));
        let id = sending_campaign(&h, "<p>Hi {{ email }}</p>", &recipients(120)).await;

        let first = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert!(matches!(first.outcome, InvocationOutcome::ContinuationScheduled { .. }));

        h.clock.advance(Duration::from_secs(60));
        let second = h.dispatcher.run(TriggerPayload::pinned(id)).await.unwrap();
        assert!(matches!(second.outcome, InvocationOutcome::ContinuationScheduled { .. }));
        assert_eq!(second.sent, 50);

        h.clock.advance(Duration::from_secs(60));
        let third = h.dispatcher.run(TriggerPayload::pinned(id)).await.unwrap();
        assert_eq!(third.outcome, InvocationOutcome::CampaignCompleted { campaign_id: id });
        assert_eq!(third.sent, 20);
        assert_eq!(third.completed, vec![id]);

        assert_eq!(count(&h, id, SendJobStatus::Sent).await, 120);
        let mut delivered = h.email.recipients();
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 120);

        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert!(campaign.continuation_handle.is_none());
    }

    #[tokio::test]
    async fn mid_batch_exit_releases_unprocessed_jobs() {
        // 27 sends at 20s reach 540s with 23 jobs of the batch untouched.
        let h = harness(Duration::from_secs(20));
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(120)).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert!(matches!(report.outcome, InvocationOutcome::ContinuationScheduled { .. }));
        assert_eq!(report.sent, 27);
        assert_eq!(count(&h, id, SendJobStatus::Sending).await, 0);
        assert_eq!(count(&h, id, SendJobStatus::Queued).await, 93);

        let released: Vec<_> = h
            .store
            .list_send_jobs(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.status == SendJobStatus::Queued && j.attempt_count == 1)
            .collect();
        assert_eq!(released.len(), 23);
    }

    #[tokio::test]
    async fn empty_claim_finalizes_campaign() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(3)).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.outcome, InvocationOutcome::CampaignCompleted { campaign_id: id });
        assert_eq!(report.sent, 3);

        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sent);
        assert!(h.timers.pending().is_empty());

        let again = h.dispatcher.run(TriggerPayload::pinned(id)).await.unwrap();
        assert_eq!(again.outcome, InvocationOutcome::NoActiveCampaign);
        assert_eq!(h.email.recipients().len(), 3);
    }

    #[tokio::test]
    async fn drain_moves_on_to_the_next_campaign() {
        let h = harness(Duration::ZERO);
        let first = sending_campaign(&h, "<p>A</p>", &recipients(2)).await;
        h.clock.advance(Duration::from_secs(1));
        let second = sending_campaign(&h, "<p>B</p>", &recipients(4)).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.sent, 6);
        assert_eq!(report.completed, vec![first, second]);
        assert_eq!(
            report.outcome,
            InvocationOutcome::CampaignCompleted { campaign_id: second }
        );
    }

    #[tokio::test]
    async fn due_scheduled_campaign_is_promoted_and_sent() {
        let h = harness(Duration::ZERO);
        let now = h.clock.now();
        let id = h
            .store
            .create_campaign(Campaign::draft("Later", "<p>x</p>", "", now).unwrap())
            .await
            .unwrap();
        let jobs = recipients(2)
            .iter()
            .map(|a| NewSendJob::queued(id, EmailAddress::parse(a).unwrap()))
            .collect();
        h.store.insert_send_jobs(jobs, now).await.unwrap();
        h.store
            .schedule_campaign(id, now + chrono::Duration::minutes(5), "start-timer", now)
            .await
            .unwrap();

        let early = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(early.outcome, InvocationOutcome::NoActiveCampaign);

        h.clock.advance(Duration::from_secs(5 * 60));
        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.outcome, InvocationOutcome::CampaignCompleted { campaign_id: id });
        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert!(campaign.scheduler_handle.is_none());
    }

    #[tokio::test]
    async fn suppressed_address_gets_no_provider_call() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(3)).await;
        let blocked = EmailAddress::parse("reader001@example.com").unwrap();
        h.store
            .suppress(SuppressionEntry::new(
                blocked.clone(),
                SuppressionReason::Complained,
                h.clock.now(),
            ))
            .await
            .unwrap();

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.unsubscribed, 1);
        assert!(!h.email.recipients().contains(&blocked.to_string()));

        let job = h
            .store
            .list_send_jobs(id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.address == blocked)
            .unwrap();
        assert_eq!(job.status, SendJobStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn unresolved_placeholder_fails_only_that_item() {
        let h = harness(Duration::ZERO);
        let addresses = vec![
            "ann@example.com".to_string(),
            "{{promo}}@example.com".to_string(),
            "bob@example.com".to_string(),
        ];
        let id = sending_campaign(&h, "<p>Hello {{ email }}</p>", &addresses).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcome, InvocationOutcome::CampaignCompleted { campaign_id: id });

        let mut delivered = h.email.recipients();
        delivered.sort();
        assert_eq!(delivered, vec!["ann@example.com", "bob@example.com"]);

        let broken = h
            .store
            .list_send_jobs(id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.address.as_str() == "{{promo}}@example.com")
            .unwrap();
        assert_eq!(broken.status, SendJobStatus::Failed);
        assert!(broken
            .last_error
            .unwrap()
            .contains("unresolved template placeholder"));
    }

    #[tokio::test]
    async fn rendered_email_carries_unsubscribe_link() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(
            &h,
            "<a href=\"{{ unsubscribe_url }}\">unsubscribe</a>",
            &recipients(1),
        )
        .await;
        h.dispatcher.run(TriggerPayload::drain()).await.unwrap();

        let job = h.store.list_send_jobs(id).await.unwrap().remove(0);
        let token = job.unsubscribe_token.unwrap();
        let sent = h.email.calls.lock().unwrap()[0].clone();
        assert_eq!(
            sent.html,
            format!("<a href=\"https://mail.example.com/u/{token}\">unsubscribe</a>")
        );
    }

    #[tokio::test]
    async fn provider_error_is_stored_verbatim() {
        let clock = Arc::new(ManualClock::new(start()));
        let email = RecordingEmail::new(clock.clone(), Duration::ZERO).rejecting("reader000@example.com");
        let h = harness_with(email, clock, config());
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(2)).await;

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 1));

        let failed = h
            .store
            .list_send_jobs(id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.status == SendJobStatus::Failed)
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("mailbox unavailable"));
        assert_eq!(failed.attempt_count, 1);
    }

    #[tokio::test]
    async fn email_retries_wait_for_their_backoff() {
        let clock = Arc::new(ManualClock::new(start()));
        let email = RecordingEmail::new(clock.clone(), Duration::ZERO).rejecting("reader000@example.com");
        let h = harness_with(
            email,
            clock.clone(),
            DispatchConfig {
                email_max_attempts: 3,
                ..config()
            },
        );
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(1)).await;

        let first = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!((first.requeued, first.failed), (1, 0));
        assert_eq!(first.outcome, InvocationOutcome::NoActiveCampaign);
        let job = h.store.list_send_jobs(id).await.unwrap().remove(0);
        assert_eq!(job.status, SendJobStatus::Queued);
        assert_eq!(job.retry_at, Some(start() + chrono::Duration::minutes(2)));
        assert_eq!(job.last_error.as_deref(), Some("mailbox unavailable"));

        // Not due yet: nothing is sent and the campaign stays open.
        let early = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!((early.requeued, early.failed), (0, 0));
        assert_eq!(h.email.recipients().len(), 1);
        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sending);

        clock.advance(Duration::from_secs(2 * 60));
        let second = h.dispatcher.run(TriggerPayload::pinned(id)).await.unwrap();
        assert_eq!(second.requeued, 1);

        clock.advance(Duration::from_secs(4 * 60));
        let last = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(last.failed, 1);
        assert_eq!(last.outcome, InvocationOutcome::CampaignCompleted { campaign_id: id });

        let job = h.store.list_send_jobs(id).await.unwrap().remove(0);
        assert_eq!(job.status, SendJobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert_eq!(
            *h.email.attempted_at.lock().unwrap(),
            vec![
                start(),
                start() + chrono::Duration::minutes(2),
                start() + chrono::Duration::minutes(6),
            ]
        );
    }

    #[tokio::test]
    async fn stale_sending_job_is_reclaimed_and_sent() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(2)).await;

        // A crashed invocation left both jobs in flight 31 minutes ago.
        let crashed_at = h.clock.now();
        let orphaned = h.store.claim_send_jobs(id, 10, crashed_at).await.unwrap();
        h.clock.advance(Duration::from_secs(31 * 60));

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.sent, 2);

        let jobs = h.store.list_send_jobs(id).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == SendJobStatus::Sent));
        assert!(jobs.iter().all(|j| j.attempt_count == 2));
        assert_eq!(orphaned.len(), 2);
    }

    #[tokio::test]
    async fn fresh_in_flight_jobs_are_left_alone() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(2)).await;
        h.store.claim_send_jobs(id, 1, h.clock.now()).await.unwrap();
        h.clock.advance(Duration::from_secs(60));

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.sent, 1);
        // Another invocation still holds one job, so the campaign stays open.
        assert_eq!(report.outcome, InvocationOutcome::NoActiveCampaign);
        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Sending);
    }

    #[tokio::test]
    async fn pinned_campaign_that_is_not_sending_touches_nothing_else() {
        let h = harness(Duration::ZERO);
        let other = sending_campaign(&h, "<p>Hi</p>", &recipients(2)).await;
        let now = h.clock.now();
        let draft = h
            .store
            .create_campaign(Campaign::draft("Draft", "<p>x</p>", "", now).unwrap())
            .await
            .unwrap();

        let report = h.dispatcher.run(TriggerPayload::pinned(draft)).await.unwrap();
        assert_eq!(report.outcome, InvocationOutcome::NoActiveCampaign);
        assert_eq!(count(&h, other, SendJobStatus::Queued).await, 2);
        assert!(h.email.recipients().is_empty());
    }

    #[tokio::test]
    async fn missing_identity_aborts_before_any_mutation() {
        let clock = Arc::new(ManualClock::new(start()));
        let config = DispatchConfig {
            identity: None,
            ..config()
        };
        let h = harness_with(RecordingEmail::new(clock.clone(), Duration::ZERO), clock, config);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(1)).await;
        h.store.claim_send_jobs(id, 1, h.clock.now()).await.unwrap();
        h.clock.advance(Duration::from_secs(60 * 60));

        let err = h.dispatcher.run(TriggerPayload::drain()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Config(ConfigError::Missing(_))));
        assert_eq!(err.kind(), "config");
        assert_eq!(count(&h, id, SendJobStatus::Sending).await, 1);
        assert!(h.email.recipients().is_empty());
    }

    #[tokio::test]
    async fn continuation_failure_propagates_and_releases_batch() {
        let h = harness(Duration::from_secs(20));
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(60)).await;
        h.timers.fail_next("scheduler unavailable");

        let err = h.dispatcher.run(TriggerPayload::drain()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Continuation(_)));
        assert_eq!(count(&h, id, SendJobStatus::Sending).await, 0);
        assert_eq!(count(&h, id, SendJobStatus::Sent).await, 27);
        assert_eq!(count(&h, id, SendJobStatus::Queued).await, 33);
    }

    #[tokio::test]
    async fn cancel_deletes_pending_continuation() {
        let h = harness(Duration::from_secs(11));
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(60)).await;
        h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(h.timers.pending().len(), 1);

        assert_eq!(h.dispatcher.cancel(id).await.unwrap(), 1);
        assert!(h.timers.pending().is_empty());
        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Failed);
        assert_eq!(count(&h, id, SendJobStatus::Queued).await, 10);

        let after = h.dispatcher.run(TriggerPayload::pinned(id)).await.unwrap();
        assert_eq!(after.outcome, InvocationOutcome::NoActiveCampaign);
    }

    #[tokio::test]
    async fn cancel_works_without_dispatch_identity() {
        let clock = Arc::new(ManualClock::new(start()));
        let h = harness_with(
            RecordingEmail::new(clock.clone(), Duration::ZERO),
            clock,
            DispatchConfig {
                identity: None,
                ..config()
            },
        );
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(3)).await;

        assert_eq!(h.dispatcher.cancel(id).await.unwrap(), 0);
        let campaign = h.store.get_campaign(id).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Failed);
    }

    #[tokio::test]
    async fn unsubscribe_link_blocks_later_sends() {
        let h = harness(Duration::ZERO);
        let id = sending_campaign(&h, "<p>Hi</p>", &recipients(1)).await;
        let job = h.store.list_send_jobs(id).await.unwrap().remove(0);
        let token = job.unsubscribe_token.unwrap();

        let address = h
            .store
            .unsubscribe_by_token(&token, h.clock.now())
            .await
            .unwrap();
        assert_eq!(address, Some(job.address.clone()));

        let report = h.dispatcher.run(TriggerPayload::drain()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert!(h.email.recipients().is_empty());
        assert!(h.store.is_suppressed(&job.address).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = InMemoryStore::arc();
        let now = start();
        let id = store
            .create_campaign(Campaign::draft("s", "<p>b</p>", "", now).unwrap())
            .await
            .unwrap();
        let jobs = recipients(200)
            .iter()
            .map(|a| NewSendJob::queued(id, EmailAddress::parse(a).unwrap()))
            .collect();
        store.insert_send_jobs(jobs, now).await.unwrap();
        store.start_campaign(id, now).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_send_jobs(id, 7, now).await.unwrap();
                    if batch.is_empty() {
                        break mine;
                    }
                    mine.extend(batch.into_iter().map(|j| j.id));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut seen: HashSet<SendJobId> = HashSet::new();
        for task in tasks {
            for job_id in task.await.unwrap() {
                assert!(seen.insert(job_id), "job {job_id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 200);
    }

    /// Social provider that always fails and counts its calls.
    #[derive(Default)]
    struct FailingSocial {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl SocialProvider for FailingSocial {
        async fn publish(&self, _post: &RecurringPost) -> Result<String, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            Err(ProviderError::Transport("rate limited".into()))
        }
    }

    struct EchoSocial;

    #[async_trait]
    impl SocialProvider for EchoSocial {
        async fn publish(&self, post: &RecurringPost) -> Result<String, ProviderError> {
            Ok(format!("urn:post:{}", post.id))
        }
    }

    #[tokio::test]
    async fn social_post_fails_after_five_attempts() {
        let store = InMemoryStore::arc();
        let clock = Arc::new(ManualClock::new(start()));
        let provider = Arc::new(FailingSocial::default());
        let dispatcher = PostDispatcher::new(
            store.clone(),
            SocialProviders::new().with("linkedin", provider.clone()),
            clock.clone(),
            config(),
        );
        let post = store
            .enqueue_post(
                NewPost {
                    provider: "linkedin".into(),
                    body: "We are hiring".into(),
                    media: vec![],
                    scheduled_at: start(),
                },
                start(),
            )
            .await
            .unwrap();

        for attempt in 1..=4u32 {
            let report = dispatcher.run().await.unwrap();
            assert_eq!(report.requeued, 1, "attempt {attempt}");
            let stored = store.get_post(post.id).await.unwrap().unwrap();
            assert_eq!(stored.status, PostStatus::Queued);
            assert_eq!(stored.attempt_count, attempt);
            // Not due again until its backoff passes.
            assert_eq!(dispatcher.run().await.unwrap().requeued, 0);
            clock.advance(Duration::from_secs(2 * 60 * 60));
        }

        let last = dispatcher.run().await.unwrap();
        assert_eq!(last.failed, 1);
        let stored = store.get_post(post.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Failed);
        assert_eq!(stored.attempt_count, 5);
        assert_eq!(stored.error.as_deref(), Some("rate limited"));

        clock.advance(Duration::from_secs(2 * 60 * 60));
        let after = dispatcher.run().await.unwrap();
        assert_eq!(after.outcome, PostOutcome::Drained);
        assert_eq!((after.requeued, after.failed, after.published), (0, 0, 0));
        assert_eq!(*provider.calls.lock().unwrap(), 5);
    }

    #[tokio::test]
    async fn posts_publish_and_unknown_providers_fail() {
        let store = InMemoryStore::arc();
        let clock = Arc::new(ManualClock::new(start()));
        let dispatcher = PostDispatcher::new(
            store.clone(),
            SocialProviders::new().with("mastodon", Arc::new(EchoSocial)),
            clock.clone(),
            DispatchConfig {
                max_attempts: 1,
                ..config()
            },
        );
        let new_post = |provider: &str| NewPost {
            provider: provider.into(),
            body: "Release notes".into(),
            media: vec!["img/release.png".into()],
            scheduled_at: start(),
        };
        let ok = store.enqueue_post(new_post("mastodon"), start()).await.unwrap();
        let unknown = store.enqueue_post(new_post("myspace"), start()).await.unwrap();

        let report = dispatcher.run().await.unwrap();
        assert_eq!((report.published, report.failed), (1, 1));

        let ok = store.get_post(ok.id).await.unwrap().unwrap();
        assert_eq!(ok.status, PostStatus::Sent);
        assert_eq!(ok.result, Some(format!("urn:post:{}", ok.id)));
        let unknown = store.get_post(unknown.id).await.unwrap().unwrap();
        assert_eq!(unknown.status, PostStatus::Failed);
        assert!(unknown.error.unwrap().contains("myspace"));
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn interleaved_claims_never_overlap(
            jobs in 1usize..120,
            batch_sizes in prop::collection::vec(1usize..40, 1..6),
        ) {
            let claimed: HashMap<SendJobId, usize> = runtime().block_on(async {
                let store = InMemoryStore::arc();
                let now = start();
                let id = store
                    .create_campaign(Campaign::draft("s", "<p>b</p>", "", now).unwrap())
                    .await
                    .unwrap();
                let rows = recipients(jobs)
                    .iter()
                    .map(|a| NewSendJob::queued(id, EmailAddress::parse(a).unwrap()))
                    .collect();
                store.insert_send_jobs(rows, now).await.unwrap();

                let mut owners = HashMap::new();
                let mut exhausted = false;
                while !exhausted {
                    exhausted = true;
                    for (claimant, &size) in batch_sizes.iter().enumerate() {
                        let batch = store.claim_send_jobs(id, size, now).await.unwrap();
                        prop_assert!(batch.len() <= size);
                        if !batch.is_empty() {
                            exhausted = false;
                        }
                        for job in batch {
                            prop_assert!(owners.insert(job.id, claimant).is_none());
                            prop_assert_eq!(job.attempt_count, 1);
                        }
                    }
                }
                Ok(owners)
            })?;
            prop_assert_eq!(claimed.len(), jobs);
        }
    }
}
