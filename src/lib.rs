#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

//! Duplex voice session engine for the Realtime API.
//!
//! [`VoiceSession`] streams microphone audio out, plays synthesized audio back,
//! and routes model tool calls to an external agent network whose results may
//! arrive long after the turn that asked for them. At most one model response
//! is in flight at any time.

pub mod protocol;
pub mod transport;
pub mod error;
pub mod sdk;
#[cfg(feature = "device")]
pub mod device;

pub use error::{Error, ErrorKind, LastError, Result, ServerError};
pub use sdk::{
    AgentGateway, AgentNetworkArgs, AudioCapture, AudioInput, AudioOutput, AudioPlayback,
    CaptureConfig, CaptureStream, ConnectionState, Connector, EphemeralTokenSource,
    ExternalResult, GatewayAck, GatewayRequest, NullOutput, PlaybackConfig, ReconnectPolicy,
    ResponseGuard, ResultStatus, SessionHandle, SessionSettings, SessionStatus, StaticToken,
    TokenSource, ToolCallStatus, ToolCallTracker, ToolCatalog, Transport, VoiceSession,
    VoiceSessionBuilder, WsConnector,
};
pub use protocol::client_events::ClientEvent;
pub use protocol::server_events::ServerEvent;
pub use protocol::models::{
    AudioFormat, ContentPart, Eagerness, InputAudioTranscription, Item, ItemStatus, Modality,
    NoiseReduction, NoiseReductionType, Response, ResponseStatus, Role, Session, SessionConfig,
    Temperature, Tool, ToolChoice, ToolChoiceMode, TurnDetection, Voice,
};

use futures::{SinkExt, StreamExt};
use serde_json::from_str;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use transport::ws::WsStream;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_INPUT_AUDIO_CHUNK_BYTES: usize = 15 * 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Low-level WebSocket client speaking the Realtime wire protocol.
///
/// Thread safety: `RealtimeClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`.
#[must_use]
pub struct RealtimeClient {
    stream: WsStream,
}

impl RealtimeClient {
    /// Connect to the public Realtime endpoint.
    ///
    /// # Errors
    /// Returns an error if the connection fails or if the URL is invalid.
    pub async fn connect(token: &str, model: Option<&str>) -> Result<Self> {
        Self::connect_to(
            transport::ws::WS_BASE_URL,
            model.unwrap_or(protocol::models::DEFAULT_MODEL),
            token,
        )
        .await
    }

    /// Connect to a Realtime-compatible endpoint at `base_url`.
    ///
    /// # Errors
    /// Returns an error if the connection fails or if the URL is invalid.
    pub async fn connect_to(base_url: &str, model: &str, token: &str) -> Result<Self> {
        let stream = transport::ws::connect(base_url, model, token).await?;
        Ok(Self { stream })
    }

    /// Send a client event to the server.
    ///
    /// # Errors
    /// Returns an error if validation or serialization fails or if the WebSocket send fails.
    pub async fn send(&mut self, event: ClientEvent) -> Result<()> {
        validate_client_event(&event)?;
        let json = serde_json::to_string(&event)?;
        tracing::trace!("Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receive the next server event.
    ///
    /// Returns `Ok(None)` on a normal close. A close frame with any other code,
    /// or the stream ending without a close frame, is an error.
    ///
    /// # Errors
    /// Returns an error if deserialization fails, the WebSocket fails, or the
    /// connection closed abnormally.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received event: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(from_str::<ServerEvent>(&text)?));
                }
                Message::Close(frame) => return close_outcome(frame),
                Message::Ping(payload) => {
                    tracing::debug!("Received Ping, sending Pong");
                    self.stream.send(Message::Pong(payload)).await?;
                }
                _ => (),
            }
        }
        Err(Error::ConnectionClosed)
    }

    /// Close the connection with a normal close code.
    ///
    /// # Errors
    /// Returns an error if the close frame cannot be sent.
    pub async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "session stopped".into(),
        };
        self.stream.send(Message::Close(Some(frame))).await?;
        tracing::info!("WebSocket connection closed by client");
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
fn close_outcome(frame: Option<CloseFrame>) -> Result<Option<ServerEvent>> {
    match frame {
        Some(frame) if frame.code != CloseCode::Normal => {
            let code = u16::from(frame.code);
            tracing::warn!(code, reason = %frame.reason, "WebSocket closed abnormally");
            Err(Error::AbnormalClose {
                code,
                reason: frame.reason.to_string(),
            })
        }
        _ => {
            tracing::info!("WebSocket connection closed by server");
            Ok(None)
        }
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[allow(clippy::result_large_err)]
fn validate_client_event(event: &ClientEvent) -> Result<()> {
    match event {
        ClientEvent::InputAudioBufferAppend { audio, .. } => {
            let size = estimate_base64_decoded_len(audio)?;
            if size > MAX_INPUT_AUDIO_CHUNK_BYTES {
                return Err(Error::InvalidClientEvent(format!(
                    "input_audio_buffer.append exceeds 15MB ({size} bytes)",
                )));
            }
        }
        ClientEvent::SessionUpdate { session, .. } => {
            if let Some(format) = session.input_audio_format {
                format.validate()?;
            }
            if let Some(format) = session.output_audio_format {
                format.validate()?;
            }
        }
        ClientEvent::ConversationItemCreate { item, .. } => {
            if let Item::FunctionCallOutput { call_id, .. } = item.as_ref() {
                if call_id.is_empty() {
                    return Err(Error::InvalidClientEvent(
                        "function_call_output requires a call_id".to_string(),
                    ));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidClientEvent(
            "input_audio_buffer.append invalid base64 length".to_string(),
        ));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(Error::InvalidClientEvent(
                "input_audio_buffer.append invalid base64 padding".to_string(),
            ));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(Error::InvalidClientEvent(
                "input_audio_buffer.append invalid base64 character".to_string(),
            ));
        }
    }

    if padding > 2 {
        return Err(Error::InvalidClientEvent(
            "input_audio_buffer.append invalid base64 padding length".to_string(),
        ));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = safe_truncate(&s, 5);
        assert!(out.starts_with("éé"));
        assert!(out.contains(TRACE_TRUNCATE_SUFFIX));
    }

    #[test]
    fn base64_length_estimate() {
        assert_eq!(estimate_base64_decoded_len("AAAA").unwrap(), 3);
        assert_eq!(estimate_base64_decoded_len("AAA=").unwrap(), 2);
        assert!(estimate_base64_decoded_len("AAA").is_err());
        assert!(estimate_base64_decoded_len("A=AA").is_err());
        assert!(estimate_base64_decoded_len("AA!A").is_err());
    }

    #[test]
    fn rejects_non_pcm_session_format() {
        let event = ClientEvent::session_update(SessionConfig {
            output_audio_format: Some(AudioFormat::G711Alaw),
            ..SessionConfig::default()
        });
        assert!(matches!(validate_client_event(&event), Err(Error::InvalidClientEvent(_))));
    }

    #[test]
    fn rejects_tool_output_without_call_id() {
        let event = ClientEvent::item_create(Item::function_call_output("", "{}"), None);
        assert!(validate_client_event(&event).is_err());
    }

    #[test]
    fn normal_close_is_not_an_error() {
        assert!(matches!(close_outcome(None), Ok(None)));
        let normal = CloseFrame { code: CloseCode::Normal, reason: "bye".into() };
        assert!(matches!(close_outcome(Some(normal)), Ok(None)));
        let away = CloseFrame { code: CloseCode::Abnormal, reason: "".into() };
        assert!(matches!(close_outcome(Some(away)), Err(Error::AbnormalClose { code: 1006, .. })));
    }
}
