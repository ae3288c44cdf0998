use crate::protocol::models::{
    AudioFormat, DEFAULT_MODEL, InputAudioTranscription, Metadata, Modality, NoiseReduction,
    NoiseReductionType, SessionConfig, Temperature, Tool, ToolChoice, TurnDetection, Voice,
};
use crate::transport::ws::WS_BASE_URL;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::capture::{AudioInput, CaptureConfig};
use super::credentials::TokenSource;
use super::gateway::AgentGateway;
use super::guard::DEFAULT_RETRY_INTERVAL;
use super::playback::{AudioOutput, NullOutput, PlaybackConfig};
use super::reconnect::ReconnectPolicy;
use super::session::{SessionParts, VoiceSession};
use super::tools::ToolCatalog;
use super::transport::{Connector, WsConnector};

pub const DEFAULT_INSTRUCTIONS: &str = "You are a voice assistant connected to an agent network. \
When the user asks for something that needs live data or an action, call send_to_agent_network \
with a clear request, tell the user it is in progress, and keep talking. When a result arrives, \
summarize it briefly.";

/// Serializable session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub model: String,
    pub base_url: String,
    pub instructions: Option<String>,
    pub voice: Voice,
    pub modalities: Vec<Modality>,
    pub temperature: Option<Temperature>,
    pub turn_detection: TurnDetection,
    pub transcription_model: Option<String>,
    pub noise_reduction: Option<NoiseReductionType>,
    /// Ask the model to speak first after the initial connection.
    pub auto_greet: bool,
    pub retry_interval_ms: u64,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub reconnect: ReconnectPolicy,
    /// Attached to every gateway request.
    pub metadata: Metadata,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: WS_BASE_URL.to_string(),
            instructions: Some(DEFAULT_INSTRUCTIONS.to_string()),
            voice: Voice::default(),
            modalities: vec![Modality::Audio, Modality::Text],
            temperature: None,
            turn_detection: TurnDetection::server_vad_default(),
            transcription_model: Some("whisper-1".to_string()),
            noise_reduction: None,
            auto_greet: false,
            retry_interval_ms: u64::try_from(DEFAULT_RETRY_INTERVAL.as_millis()).unwrap_or(100),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            reconnect: ReconnectPolicy::default(),
            metadata: Metadata::new(),
        }
    }
}

impl SessionSettings {
    /// The `session.update` payload sent once per connection.
    #[must_use]
    pub fn to_session_config(&self, tools: Vec<Tool>) -> SessionConfig {
        let has_tools = !tools.is_empty();
        SessionConfig {
            modalities: Some(self.modalities.clone()),
            instructions: self.instructions.clone(),
            voice: Some(self.voice.clone()),
            input_audio_format: Some(AudioFormat::Pcm16),
            output_audio_format: Some(AudioFormat::Pcm16),
            input_audio_transcription: self
                .transcription_model
                .as_deref()
                .map(InputAudioTranscription::new),
            input_audio_noise_reduction: self.noise_reduction.map(|kind| NoiseReduction { kind }),
            turn_detection: Some(self.turn_detection.clone()),
            tools: has_tools.then_some(tools),
            tool_choice: has_tools.then(ToolChoice::default),
            temperature: self.temperature,
        }
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

pub struct VoiceSessionBuilder {
    settings: SessionSettings,
    tools: ToolCatalog,
    token_source: Option<Arc<dyn TokenSource>>,
    connector: Option<Arc<dyn Connector>>,
    gateway: Option<Arc<dyn AgentGateway>>,
    input: Option<Box<dyn AudioInput>>,
    output: Option<Box<dyn AudioOutput>>,
}

impl VoiceSessionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: SessionSettings::default(),
            tools: ToolCatalog::agent_network(),
            token_source: None,
            connector: None,
            gateway: None,
            input: None,
            output: None,
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.settings.model = model.into();
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<Voice>) -> Self {
        self.settings.voice = voice.into();
        self
    }

    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.settings.instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temperature: Temperature) -> Self {
        self.settings.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn turn_detection(mut self, turn_detection: TurnDetection) -> Self {
        self.settings.turn_detection = turn_detection;
        self
    }

    #[must_use]
    pub const fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.settings.reconnect = policy;
        self
    }

    #[must_use]
    pub const fn auto_greet(mut self, enabled: bool) -> Self {
        self.settings.auto_greet = enabled;
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: ToolCatalog) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn token_source(mut self, source: impl TokenSource + 'static) -> Self {
        self.token_source = Some(Arc::new(source));
        self
    }

    /// Replace the WebSocket connector, e.g. with a proxy or a test double.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    #[must_use]
    pub fn gateway(mut self, gateway: impl AgentGateway + 'static) -> Self {
        self.gateway = Some(Arc::new(gateway));
        self
    }

    #[must_use]
    pub fn audio_input(mut self, input: impl AudioInput + 'static) -> Self {
        self.input = Some(Box::new(input));
        self
    }

    #[must_use]
    pub fn audio_output(mut self, output: impl AudioOutput + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    /// Spawn the session driver. Must be called inside a Tokio runtime. The
    /// session stays idle until [`VoiceSession::start`].
    ///
    /// # Errors
    /// Returns an error if a required component is missing or the tool schemas
    /// cannot be serialized.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<VoiceSession> {
        let token_source = self
            .token_source
            .ok_or_else(|| Error::InvalidClientEvent("token_source required".to_string()))?;
        let gateway = self
            .gateway
            .ok_or_else(|| Error::InvalidClientEvent("gateway required".to_string()))?;
        let input = self
            .input
            .ok_or_else(|| Error::InvalidClientEvent("audio_input required".to_string()))?;
        let output = self.output.unwrap_or_else(|| Box::new(NullOutput::default()));
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WsConnector::new(&self.settings.base_url, &self.settings.model))
        });
        let session_config = self.settings.to_session_config(self.tools.try_as_tools()?);

        Ok(VoiceSession::spawn(SessionParts {
            settings: self.settings,
            session_config,
            token_source,
            connector,
            gateway,
            input,
            output,
        }))
    }
}

impl Default for VoiceSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::gateway::AGENT_NETWORK_TOOL;

    #[test]
    fn session_config_carries_tools_and_formats() {
        let settings = SessionSettings::default();
        let config = settings.to_session_config(ToolCatalog::agent_network().try_as_tools().unwrap());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["input_audio_format"], "pcm16");
        assert_eq!(json["output_audio_format"], "pcm16");
        assert_eq!(json["voice"], "alloy");
        assert_eq!(json["tools"][0]["name"], AGENT_NETWORK_TOOL);
        assert_eq!(json["tool_choice"], "auto");
        assert_eq!(json["turn_detection"]["type"], "server_vad");
        assert_eq!(json["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn no_tools_omits_tool_fields() {
        let config = SessionSettings::default().to_session_config(Vec::new());
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
    }

    #[test]
    fn settings_deserialize_partially() {
        let settings: SessionSettings = serde_json::from_str(
            r#"{"voice": "verse", "reconnect": {"max_attempts": 2}, "capture": {"frame_samples": 4800}}"#,
        )
        .unwrap();
        assert_eq!(settings.voice.as_str(), "verse");
        assert_eq!(settings.reconnect.max_attempts, 2);
        assert_eq!(settings.capture.frame_samples, 4_800);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.retry_interval(), Duration::from_millis(100));
    }

    #[test]
    fn build_requires_gateway() {
        let err = VoiceSessionBuilder::new()
            .token_source(crate::sdk::StaticToken::new("t"))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("gateway"));
    }
}
