use crate::error::Result;
use reqwest::header::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub const WS_BASE_URL: &str = "wss://api.openai.com/v1/realtime";

#[derive(Debug)]
pub struct WsStream(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl WsStream {
    pub(crate) const fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self(stream)
    }
}

impl futures::Stream for WsStream {
    type Item = std::result::Result<
        tokio_tungstenite::tungstenite::Message,
        tokio_tungstenite::tungstenite::Error,
    >;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.0).poll_next(cx)
    }
}

impl futures::Sink<tokio_tungstenite::tungstenite::Message> for WsStream {
    type Error = tokio_tungstenite::tungstenite::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: tokio_tungstenite::tungstenite::Message,
    ) -> std::result::Result<(), Self::Error> {
        std::pin::Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Build the realtime endpoint URL for `model` under `base_url`.
///
/// # Errors
/// Returns an error if `base_url` is not a valid URL.
#[allow(clippy::result_large_err)]
pub fn endpoint(base_url: &str, model: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    url.query_pairs_mut().append_pair("model", model);
    Ok(url)
}

/// Establish a WebSocket connection to the Realtime API using the beta protocol.
///
/// `token` may be a long-lived API key or an ephemeral client secret.
///
/// # Errors
/// Returns an error if the URL is invalid or the handshake fails.
pub async fn connect(base_url: &str, model: &str, token: &str) -> Result<WsStream> {
    let url = endpoint(base_url, model)?;
    let auth_header = HeaderValue::from_str(&format!("Bearer {token}"))?;

    let mut req = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
        url.as_str(),
    )?;
    let h = req.headers_mut();
    h.insert(reqwest::header::AUTHORIZATION, auth_header);
    h.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
    let (ws_stream, _) = connect_async(req).await?;

    tracing::info!(model, "Connected to OpenAI Realtime");

    Ok(WsStream::new(ws_stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_model_query() {
        let url = endpoint(WS_BASE_URL, "gpt-4o-realtime-preview").unwrap();
        assert_eq!(url.as_str(), "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(endpoint("not a url", "m").is_err());
    }
}
