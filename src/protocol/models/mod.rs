pub mod audio;
pub mod common;
pub mod items;
pub mod response;
pub mod session;
pub mod tools;

pub use audio::{
    AudioFormat, InputAudioTranscription, NoiseReduction, NoiseReductionType, PCM16_SAMPLE_RATE,
    TurnDetection,
};
pub use common::{
    ArbitraryJson, DEFAULT_MODEL, DEFAULT_VOICE, Eagerness, ItemStatus, JsonSchema, Metadata,
    Modality, Role, Temperature, TemperatureError, Voice,
};
pub use items::{ContentPart, Item};
pub use response::{Response, ResponseStatus, ResponseStatusDetails};
pub use session::{Session, SessionConfig};
pub use tools::{FunctionTag, Tool, ToolChoice, ToolChoiceMode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_rejects_out_of_range() {
        assert!(Temperature::new(0.8).is_ok());
        assert!(Temperature::new(2.0).is_err());
        let parsed: Result<Temperature, _> = serde_json::from_str("0.1");
        assert!(parsed.is_err());
    }

    #[test]
    fn tool_choice_serializes_mode_as_string() {
        let choice = ToolChoice::default();
        assert_eq!(serde_json::to_string(&choice).unwrap(), "\"auto\"");
        let named = ToolChoice::function("send_to_agent_network");
        let value = serde_json::to_value(&named).unwrap();
        assert_eq!(value["type"], "function");
        assert_eq!(value["name"], "send_to_agent_network");
    }

    #[test]
    fn audio_format_only_accepts_pcm16() {
        assert!(AudioFormat::Pcm16.validate().is_ok());
        assert!(AudioFormat::G711Ulaw.validate().is_err());
        assert_eq!(serde_json::to_string(&AudioFormat::Pcm16).unwrap(), "\"pcm16\"");
    }
}
