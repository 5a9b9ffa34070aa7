//! Campaign dispatch domain.
//!
//! Deterministic state machines and rendering rules for bulk sends (no IO,
//! no storage, no clock). Callers pass `now` explicitly so every transition
//! is reproducible in tests.

pub mod campaign;
pub mod post;
pub mod requeue;
pub mod send_job;
pub mod suppression;
pub mod template;

pub use campaign::{Campaign, CampaignStatus};
pub use post::{NewPost, PostStatus, RecurringPost};
pub use requeue::{Disposition, RequeuePolicy};
pub use send_job::{NewSendJob, SendJob, SendJobStatus, SendOutcome, UnsubscribeToken};
pub use suppression::{SuppressionEntry, SuppressionReason};
pub use template::{MessageTemplate, RenderedMessage, TemplateError, TemplateVariables};
