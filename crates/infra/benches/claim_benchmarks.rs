use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use async_trait::async_trait;
use chrono::Utc;
use courier_campaigns::{Campaign, NewSendJob};
use courier_core::{CampaignId, EmailAddress};
use courier_infra::config::{DispatchConfig, DispatchIdentity};
use courier_infra::dispatch::{CampaignDispatcher, SystemClock};
use courier_infra::providers::{EmailProvider, OutboundEmail, ProviderError};
use courier_infra::store::{CampaignStore, InMemoryStore, SendJobStore};
use courier_infra::timers::{InMemoryTimerRegistry, TriggerPayload};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct NoopEmail;

#[async_trait]
impl EmailProvider for NoopEmail {
    async fn send(&self, _email: &OutboundEmail) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

/// A sending campaign with `recipients` queued jobs.
fn seeded_store(rt: &Runtime, recipients: usize) -> (Arc<InMemoryStore>, CampaignId) {
    rt.block_on(async {
        let store = InMemoryStore::arc();
        let now = Utc::now();
        let campaign = Campaign::draft("Bench", "<p>{{ email }}</p>", "", now).unwrap();
        let id = store.create_campaign(campaign).await.unwrap();
        let jobs = (0..recipients)
            .map(|i| NewSendJob::queued(id, EmailAddress::parse(&format!("r{i}@example.com")).unwrap()))
            .collect();
        store.insert_send_jobs(jobs, now).await.unwrap();
        store.start_campaign(id, now).await.unwrap();
        (store, id)
    })
}

fn bench_claim_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_batch");

    for batch_size in [10usize, 50, 200].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            batch_size,
            |b, &size| {
                b.iter_batched(
                    || seeded_store(&rt, 1_000),
                    |(store, id)| {
                        rt.block_on(async {
                            black_box(store.claim_send_jobs(id, size, Utc::now()).await.unwrap())
                        })
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_full_invocation(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("dispatch_invocation");
    group.throughput(Throughput::Elements(500));

    let config = DispatchConfig {
        identity: Some(DispatchIdentity {
            target: "bench".into(),
            role: "bench".into(),
        }),
        ..DispatchConfig::default()
    };

    group.bench_function("drain_500_recipients", |b| {
        b.iter_batched(
            || {
                let (store, _) = seeded_store(&rt, 500);
                CampaignDispatcher::new(
                    store,
                    Arc::new(NoopEmail),
                    InMemoryTimerRegistry::arc(),
                    Arc::new(SystemClock),
                    config.clone(),
                )
            },
            |dispatcher| rt.block_on(async { black_box(dispatcher.run(TriggerPayload::drain()).await.unwrap()) }),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_claim_batch, bench_full_invocation);
criterion_main!(benches);
