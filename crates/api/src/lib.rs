//! HTTP API: dispatch triggers, unsubscribe links, health.

pub mod app;
