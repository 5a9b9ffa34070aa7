//! Delivery provider boundary: email and social channels.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use courier_campaigns::{RecurringPost, RenderedMessage};
use courier_core::EmailAddress;

use crate::config::ConfigError;

/// Provider failure. `Display` is the provider's message verbatim, which is
/// what ends up in `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Transport(String),
}

/// One outbound email, as handed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub to: EmailAddress,
    pub subject: String,
    pub html: String,
    pub text: String,
}

impl OutboundEmail {
    pub fn new(to: EmailAddress, message: RenderedMessage) -> Self {
        Self {
            to,
            subject: message.subject,
            html: message.html,
            text: message.text,
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError>;
}

#[async_trait]
pub trait SocialProvider: Send + Sync {
    /// Publish a post and return the provider's reference to it.
    async fn publish(&self, post: &RecurringPost) -> Result<String, ProviderError>;
}

/// Social providers keyed by the `provider` column of a post.
#[derive(Clone, Default)]
pub struct SocialProviders {
    by_name: HashMap<String, Arc<dyn SocialProvider>>,
}

impl SocialProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, provider: Arc<dyn SocialProvider>) -> Self {
        self.by_name.insert(name.into(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn SocialProvider>> {
        self.by_name.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Load HTTP providers from `COURIER_*` settings.
    ///
    /// `COURIER_SOCIAL_PROVIDERS` is a comma-separated list of channel keys.
    /// Each key `name` needs `COURIER_SOCIAL_<NAME>_URL` and
    /// `COURIER_SOCIAL_<NAME>_TOKEN`, with `-` in the key read as `_`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let Some(names) = get("COURIER_SOCIAL_PROVIDERS") else {
            return Ok(Self::new());
        };

        let mut providers = Self::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let prefix = format!("COURIER_SOCIAL_{}", name.to_uppercase().replace('-', "_"));
            let setting = |suffix: &str| {
                let key = format!("{prefix}_{suffix}");
                get(&key).ok_or_else(|| ConfigError::Invalid {
                    key: "COURIER_SOCIAL_PROVIDERS",
                    value: name.to_string(),
                    reason: format!("{key} is not set"),
                })
            };
            let provider = HttpSocialProvider::new(setting("URL")?, setting("TOKEN")?);
            info!(provider = name, "social provider configured");
            providers = providers.with(name, Arc::new(provider));
        }
        Ok(providers)
    }
}

impl std::fmt::Debug for SocialProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocialProviders")
            .field("providers", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// JSON-over-HTTP email API.
///
/// Sends `{from, to, subject, html, text}` with a bearer key.
#[derive(Debug, Clone)]
pub struct HttpEmailProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
    text: &'a str,
}

impl HttpEmailProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl EmailProvider for HttpEmailProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError> {
        let body = SendRequest {
            from: &self.from,
            to: email.to.as_str(),
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        Err(ProviderError::Rejected(if text.is_empty() {
            format!("provider returned {status}")
        } else {
            text
        }))
    }
}

/// JSON-over-HTTP publishing API for one social channel.
///
/// Sends `{body, media}` with a bearer token and expects `{"id": "..."}`;
/// the id is stored as the post's `result`.
#[derive(Debug, Clone)]
pub struct HttpSocialProvider {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    body: &'a str,
    media: &'a [String],
}

#[derive(Deserialize)]
struct Published {
    id: String,
}

impl HttpSocialProvider {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl SocialProvider for HttpSocialProvider {
    async fn publish(&self, post: &RecurringPost) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&PublishRequest {
                body: &post.body,
                media: &post.media,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(if text.is_empty() {
                format!("provider returned {status}")
            } else {
                text
            }));
        }

        let published: Published = resp
            .json()
            .await
            .map_err(|e| ProviderError::Rejected(format!("malformed provider response: {e}")))?;
        Ok(published.id)
    }
}
