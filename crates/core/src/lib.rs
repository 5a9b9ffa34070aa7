//! `courier-core` — shared building blocks for the dispatch subsystem.
//!
//! This crate contains **pure** primitives (no IO, no storage, no runtime).

pub mod address;
pub mod error;
pub mod id;
pub mod value_object;

pub use address::EmailAddress;
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, PostId, SendJobId};
pub use value_object::ValueObject;
