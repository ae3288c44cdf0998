use crate::protocol::client_events::ClientEvent;
use crate::protocol::server_events::ServerEvent;
use crate::{RealtimeClient, Result};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A live duplex connection.
///
/// `next_event` yields `Ok(None)` when the peer closes normally and an error
/// for every abnormal termination; the session reconnects only on the latter.
pub trait Transport: Send {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>>;
    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerEvent>>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Opens transports. Called once on `start()` and again for every reconnection.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Box<dyn Transport>>>;
}

/// Connects to the Realtime WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    model: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let client = RealtimeClient::connect_to(&self.base_url, &self.model, token).await?;
            Ok(Box::new(WsTransport { client }) as Box<dyn Transport>)
        })
    }
}

struct WsTransport {
    client: RealtimeClient,
}

impl Transport for WsTransport {
    fn send(&mut self, event: ClientEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.send(event).await })
    }

    fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerEvent>>> {
        Box::pin(async move { self.client.next_event().await })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.client.close().await })
    }
}
