//! Infrastructure layer: job store, dispatch loops, config, external
//! collaborators (email/social providers, timer service, subscriber
//! directory).

pub mod audience;
pub mod config;
pub mod dispatch;
pub mod providers;
pub mod store;
pub mod timers;

mod integration_tests;

pub use audience::{AudienceResolver, AudienceSource, AudienceSpec, ResolvedAudience};
pub use config::{ConfigError, DispatchConfig, DispatchIdentity};
pub use dispatch::{
    CampaignDispatcher, DispatchError, InvocationOutcome, InvocationReport, PostDispatcher,
    PostReport,
};
pub use store::{InMemoryStore, JobStore, PostgresStore, StoreError};
pub use timers::{TimerHandle, TimerRegistry, TriggerPayload};
