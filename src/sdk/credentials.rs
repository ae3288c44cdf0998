use crate::Result;
use crate::protocol::models::Voice;
use crate::transport::rest::RealtimeRestAdapter;
use async_trait::async_trait;

/// Supplies the bearer token for each connection attempt.
///
/// Called on `start()` and again before every reconnection, so ephemeral
/// tokens never outlive the connection they were minted for.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_token(&self) -> Result<String>;
}

/// A fixed token, e.g. a long-lived API key on a trusted host.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn get_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Mints a short-lived client secret through the REST sessions endpoint.
#[derive(Clone, Debug)]
pub struct EphemeralTokenSource {
    rest: RealtimeRestAdapter,
    model: String,
    voice: Option<Voice>,
}

impl EphemeralTokenSource {
    #[must_use]
    pub fn new(rest: RealtimeRestAdapter, model: impl Into<String>) -> Self {
        Self {
            rest,
            model: model.into(),
            voice: None,
        }
    }

    #[must_use]
    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.voice = Some(voice);
        self
    }
}

#[async_trait]
impl TokenSource for EphemeralTokenSource {
    async fn get_token(&self) -> Result<String> {
        let session = self
            .rest
            .create_session_token(&self.model, self.voice.as_ref())
            .await?;
        tracing::debug!(session_id = ?session.id, "Minted ephemeral session token");
        Ok(session.client_secret.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_is_returned_verbatim() {
        let source = StaticToken::new("sk-test");
        assert_eq!(source.get_token().await.unwrap(), "sk-test");
        assert_eq!(format!("{source:?}"), "StaticToken(..)");
    }
}
