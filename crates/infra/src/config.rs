//! Environment configuration for the dispatcher.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use courier_campaigns::RequeuePolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Identity used when registering continuation timers: what the timer
/// invokes and the least-privilege role it runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchIdentity {
    pub target: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub time_budget: Duration,
    pub safety_margin: Duration,
    pub continuation_delay: Duration,
    pub stale_lock_threshold: Duration,
    pub max_attempts: u32,
    pub backoff_cap: Duration,
    /// Attempts per email send. `1` makes every failure terminal.
    pub email_max_attempts: u32,
    pub unsubscribe_base_url: String,
    pub identity: Option<DispatchIdentity>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            time_budget: Duration::from_secs(600),
            safety_margin: Duration::from_secs(60),
            continuation_delay: Duration::from_secs(60),
            stale_lock_threshold: Duration::from_secs(30 * 60),
            max_attempts: 5,
            backoff_cap: Duration::from_secs(60 * 60),
            email_max_attempts: 1,
            unsubscribe_base_url: "http://localhost:8080/unsubscribe".to_string(),
            identity: None,
        }
    }
}

impl DispatchConfig {
    /// Load from `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let identity = match (get("COURIER_DISPATCH_TARGET"), get("COURIER_DISPATCH_ROLE")) {
            (Some(target), Some(role)) => Some(DispatchIdentity { target, role }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("COURIER_DISPATCH_ROLE")),
            (None, Some(_)) => return Err(ConfigError::Missing("COURIER_DISPATCH_TARGET")),
        };

        let config = Self {
            batch_size: parse_or(&get, "COURIER_BATCH_SIZE", defaults.batch_size)?,
            time_budget: secs_or(&get, "COURIER_TIME_BUDGET_SECS", defaults.time_budget)?,
            safety_margin: secs_or(&get, "COURIER_SAFETY_MARGIN_SECS", defaults.safety_margin)?,
            continuation_delay: secs_or(
                &get,
                "COURIER_CONTINUATION_DELAY_SECS",
                defaults.continuation_delay,
            )?,
            stale_lock_threshold: Duration::from_secs(
                60 * parse_or(
                    &get,
                    "COURIER_STALE_LOCK_MINUTES",
                    defaults.stale_lock_threshold.as_secs() / 60,
                )?,
            ),
            max_attempts: parse_or(&get, "COURIER_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_cap: Duration::from_secs(
                60 * parse_or(
                    &get,
                    "COURIER_BACKOFF_CAP_MINUTES",
                    defaults.backoff_cap.as_secs() / 60,
                )?,
            ),
            email_max_attempts: parse_or(
                &get,
                "COURIER_EMAIL_MAX_ATTEMPTS",
                defaults.email_max_attempts,
            )?,
            unsubscribe_base_url: get("COURIER_UNSUBSCRIBE_BASE_URL")
                .unwrap_or(defaults.unsubscribe_base_url),
            identity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(invalid("COURIER_BATCH_SIZE", "0", "must be greater than zero"));
        }
        if self.safety_margin >= self.time_budget {
            return Err(invalid(
                "COURIER_SAFETY_MARGIN_SECS",
                self.safety_margin.as_secs().to_string(),
                "must be smaller than the time budget",
            ));
        }
        if self.max_attempts == 0 {
            return Err(invalid("COURIER_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.email_max_attempts == 0 {
            return Err(invalid("COURIER_EMAIL_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        Ok(())
    }

    /// Continuation identity; required before an invocation touches state.
    pub fn require_identity(&self) -> Result<&DispatchIdentity, ConfigError> {
        self.identity
            .as_ref()
            .ok_or(ConfigError::Missing("COURIER_DISPATCH_TARGET"))
    }

    /// Policy for channels with automatic retry (social posts).
    pub fn retry_policy(&self) -> RequeuePolicy {
        RequeuePolicy::exponential(self.max_attempts, self.backoff_cap)
    }

    /// Email sends fail fast unless `email_max_attempts` allows retries,
    /// which then back off like social posts do.
    pub fn email_policy(&self) -> RequeuePolicy {
        if self.email_max_attempts <= 1 {
            RequeuePolicy::fail_fast()
        } else {
            RequeuePolicy::exponential(self.email_max_attempts, self.backoff_cap)
        }
    }

    /// The stale-lock threshold and the time budget are independent. A
    /// threshold at or below the budget lets a healthy but slow invocation
    /// lose its rows to a reclaim, so say so loudly.
    pub fn warn_if_stale_threshold_too_short(&self) -> bool {
        let too_short = self.stale_lock_threshold <= self.time_budget;
        if too_short {
            warn!(
                stale_lock_secs = self.stale_lock_threshold.as_secs(),
                time_budget_secs = self.time_budget.as_secs(),
                "stale-lock threshold does not exceed the invocation budget; in-flight sends may be reclaimed and delivered twice"
            );
        }
        too_short
    }
}

fn invalid(key: &'static str, value: impl Into<String>, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.into(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, raw.clone(), &e.to_string())),
    }
}

fn secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
