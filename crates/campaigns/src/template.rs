//! Template renderer and token guard.
//!
//! Placeholders use `{{ name }}` syntax. Only the fixed per-recipient
//! variables are substituted; anything still shaped like a placeholder after
//! substitution fails that one render.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::{CampaignId, EmailAddress};

use crate::send_job::UnsubscribeToken;

pub const VAR_EMAIL: &str = "email";
pub const VAR_UNSUBSCRIBE_URL: &str = "unsubscribe_url";
pub const VAR_UNSUBSCRIBE_TOKEN: &str = "unsubscribe_token";
pub const VAR_CAMPAIGN_ID: &str = "campaign_id";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]*)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Anything left over that still looks like template syntax, including
/// malformed placeholders such as `{{ first name }}` or an unclosed `{{`.
fn residue_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}|\{\{").expect("residue pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unresolved template placeholder(s) in {field}: {}", .names.join(", "))]
    Unresolved {
        field: &'static str,
        names: Vec<String>,
    },
}

/// The message body as authored on the campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A message ready for the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Per-recipient substitution values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVariables {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVariables {
    /// The fixed variable set for one send job.
    pub fn for_recipient(
        campaign_id: CampaignId,
        address: &EmailAddress,
        token: &UnsubscribeToken,
        unsubscribe_base_url: &str,
    ) -> Self {
        let url = format!("{}/{}", unsubscribe_base_url.trim_end_matches('/'), token);
        let mut values = BTreeMap::new();
        values.insert(VAR_EMAIL, address.as_str().to_string());
        values.insert(VAR_UNSUBSCRIBE_URL, url);
        values.insert(VAR_UNSUBSCRIBE_TOKEN, token.as_str().to_string());
        values.insert(VAR_CAMPAIGN_ID, campaign_id.to_string());
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl MessageTemplate {
    /// Substitute `vars` into every field, then guard against leftovers.
    pub fn render(&self, vars: &TemplateVariables) -> Result<RenderedMessage, TemplateError> {
        Ok(RenderedMessage {
            subject: render_field("subject", &self.subject, vars)?,
            html: render_field("html", &self.html, vars)?,
            text: render_field("text", &self.text, vars)?,
        })
    }
}

fn render_field(
    field: &'static str,
    source: &str,
    vars: &TemplateVariables,
) -> Result<String, TemplateError> {
    let rendered = placeholder_pattern().replace_all(source, |caps: &Captures<'_>| {
        match vars.get(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        }
    });

    let names: Vec<String> = residue_pattern()
        .captures_iter(&rendered)
        .map(|caps| match caps.get(1) {
            Some(name) => name.as_str().to_string(),
            None => "{{".to_string(),
        })
        .collect();

    if names.is_empty() {
        Ok(rendered.into_owned())
    } else {
        Err(TemplateError::Unresolved { field, names })
    }
}
