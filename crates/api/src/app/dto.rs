use serde::{Deserialize, Serialize};

/// Body of `POST /dispatch`. An absent id drains every sending campaign.
#[derive(Debug, Default, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub campaign_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub address: String,
    pub unsubscribed: bool,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub campaign_id: String,
    pub timers_deleted: usize,
}
