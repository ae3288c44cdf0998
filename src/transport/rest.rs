use reqwest::{Client, header::{HeaderValue, AUTHORIZATION}};
use crate::error::Result;
use crate::protocol::models::Voice;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Short-lived credential minted for one realtime connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientSecret {
    pub value: String,
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralSessionResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub client_secret: ClientSecret,
}

#[derive(Debug, Clone, Serialize)]
struct CreateSessionRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a Voice>,
}

pub const REST_BASE_URL: &str = "https://api.openai.com/v1/realtime";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// An adapter for the Realtime REST API, used to mint ephemeral session tokens.
#[derive(Clone, Debug)]
pub struct RealtimeRestAdapter {
    client: Client,
    auth_header: HeaderValue,
    base_url: String,
}

impl RealtimeRestAdapter {
    /// Create a new adapter with the given API key.
    ///
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(api_key: &str) -> Result<Self> {
        Self::new_with_timeouts(api_key, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// Create a new adapter with custom timeouts.
    ///
    /// # Errors
    /// Returns an error if the API key results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        api_key: &str,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;

        let auth_header = HeaderValue::from_str(&format!("Bearer {api_key}"))?;

        Ok(Self {
            client,
            auth_header,
            base_url: REST_BASE_URL.to_string(),
        })
    }

    /// Point the adapter at a different REST base (e.g. a token-minting proxy).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create an ephemeral realtime session and return its client secret.
    ///
    /// # Errors
    /// Returns an error if the HTTP request fails or the server rejects it.
    pub async fn create_session_token(
        &self,
        model: &str,
        voice: Option<&Voice>,
    ) -> Result<EphemeralSessionResponse> {
        let res = self.client
            .post(format!("{}/sessions", self.base_url))
            .header(AUTHORIZATION, &self.auth_header)
            .header("OpenAI-Beta", "realtime=v1")
            .json(&CreateSessionRequest { model, voice })
            .send()
            .await?
            .error_for_status()?;

        Ok(res.json().await?)
    }
}
