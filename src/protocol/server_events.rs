use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use super::models::{ArbitraryJson, Item, Response, Session};
use crate::error::ServerError;

/// Declares the typed server events once and derives the public enum, the
/// tagged wire representation, and the conversions between them. Every
/// variant carries an `event_id`.
macro_rules! server_events {
    ($(
        $(#[$meta:meta])*
        $tag:literal => $variant:ident { $($field:ident : $ty:ty),* $(,)? }
    ),* $(,)?) => {
        #[derive(Debug, Clone)]
        pub enum ServerEvent {
            $(
                $(#[$meta])*
                $variant { event_id: String, $($field: $ty),* },
            )*
            /// Event types this crate does not model, preserved as raw JSON.
            Unknown(ArbitraryJson),
        }

        #[derive(Debug, Clone, Deserialize, Serialize)]
        #[serde(tag = "type")]
        enum ServerEventRepr {
            $(
                #[serde(rename = $tag)]
                $variant { event_id: String, $($field: $ty),* },
            )*
        }

        impl From<ServerEventRepr> for ServerEvent {
            fn from(repr: ServerEventRepr) -> Self {
                match repr {
                    $(ServerEventRepr::$variant { event_id, $($field),* } => Self::$variant { event_id, $($field),* },)*
                }
            }
        }

        impl ServerEvent {
            fn to_repr(&self) -> ServerEventRepr {
                match self {
                    $(Self::$variant { event_id, $($field),* } => ServerEventRepr::$variant {
                        event_id: event_id.clone(),
                        $($field: $field.clone()),*
                    },)*
                    Self::Unknown(_) => unreachable!("unknown events serialize as raw JSON"),
                }
            }

            /// Wire `type` of the event.
            #[must_use]
            pub fn kind(&self) -> &str {
                match self {
                    $(Self::$variant { .. } => $tag,)*
                    Self::Unknown(value) => value.get("type").and_then(Value::as_str).unwrap_or("unknown"),
                }
            }

            #[must_use]
            pub fn event_id(&self) -> Option<&str> {
                match self {
                    $(Self::$variant { event_id, .. } => Some(event_id.as_str()),)*
                    Self::Unknown(value) => value.get("event_id").and_then(Value::as_str),
                }
            }

            /// An event of a modeled type whose payload did not parse.
            #[must_use]
            pub fn is_malformed(&self) -> bool {
                matches!(self, Self::Unknown(_)) && is_modeled(self.kind())
            }
        }

        fn is_modeled(kind: &str) -> bool {
            matches!(kind, $($tag)|*)
        }
    };
}

server_events! {
    "error" => Error { error: ServerError },
    "session.created" => SessionCreated { session: Session },
    "session.updated" => SessionUpdated { session: Session },
    "input_audio_buffer.speech_started" => InputAudioBufferSpeechStarted {
        audio_start_ms: u32,
        item_id: String,
    },
    "input_audio_buffer.speech_stopped" => InputAudioBufferSpeechStopped {
        audio_end_ms: u32,
        item_id: String,
    },
    "input_audio_buffer.committed" => InputAudioBufferCommitted {
        previous_item_id: Option<String>,
        item_id: String,
    },
    "input_audio_buffer.cleared" => InputAudioBufferCleared {},
    "conversation.item.created" => ConversationItemCreated {
        previous_item_id: Option<String>,
        item: Item,
    },
    "conversation.item.input_audio_transcription.completed" => InputAudioTranscriptionCompleted {
        item_id: String,
        content_index: u32,
        transcript: String,
    },
    "response.created" => ResponseCreated { response: Response },
    "response.done" => ResponseDone { response: Response },
    "response.output_item.added" => ResponseOutputItemAdded {
        response_id: String,
        output_index: u32,
        item: Item,
    },
    "response.output_item.done" => ResponseOutputItemDone {
        response_id: String,
        output_index: u32,
        item: Item,
    },
    "response.function_call_arguments.delta" => ResponseFunctionCallArgumentsDelta {
        response_id: String,
        item_id: String,
        output_index: u32,
        call_id: String,
        delta: String,
    },
    /// `name` is only present on newer protocol revisions.
    "response.function_call_arguments.done" => ResponseFunctionCallArgumentsDone {
        response_id: String,
        item_id: String,
        output_index: u32,
        call_id: String,
        name: Option<String>,
        arguments: String,
    },
    "response.audio.delta" => ResponseAudioDelta {
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
        delta: String,
    },
    "response.audio.done" => ResponseAudioDone {
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
    },
    "response.audio_transcript.delta" => ResponseAudioTranscriptDelta {
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
        delta: String,
    },
    "response.audio_transcript.done" => ResponseAudioTranscriptDone {
        response_id: String,
        item_id: String,
        output_index: u32,
        content_index: u32,
        transcript: String,
    },
    "rate_limits.updated" => RateLimitsUpdated { rate_limits: Vec<RateLimit> },
}

impl Serialize for ServerEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if let Self::Unknown(value) = self {
            value.serialize(serializer)
        } else {
            self.to_repr().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ServerEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = ArbitraryJson::deserialize(deserializer)?;
        match ServerEventRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
                if is_modeled(kind) {
                    tracing::warn!(kind, error = %err, "Malformed server event");
                } else {
                    tracing::debug!(kind, "Unmodeled server event");
                }
                Ok(Self::Unknown(value))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimit {
    pub name: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_done_parses_without_name() {
        let evt: ServerEvent = serde_json::from_value(json!({
            "type": "response.function_call_arguments.done",
            "event_id": "evt_1",
            "response_id": "resp_1",
            "item_id": "item_1",
            "output_index": 0,
            "call_id": "call_1",
            "arguments": "{\"request\":\"check network status\"}"
        }))
        .unwrap();
        match evt {
            ServerEvent::ResponseFunctionCallArgumentsDone { call_id, name, arguments, .. } => {
                assert_eq!(call_id, "call_1");
                assert!(name.is_none());
                assert!(arguments.contains("check network status"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_event_is_flagged() {
        let raw = json!({
            "type": "response.done",
            "event_id": "evt_4",
            "response": { "id": "resp_1", "status": 42 }
        });
        let evt: ServerEvent = serde_json::from_value(raw).unwrap();
        assert!(matches!(evt, ServerEvent::Unknown(_)));
        assert_eq!(evt.kind(), "response.done");
        assert!(evt.is_malformed());

        let other: ServerEvent =
            serde_json::from_value(json!({ "type": "output_audio_buffer.started", "event_id": "e" })).unwrap();
        assert!(!other.is_malformed());
    }

    #[test]
    fn unknown_event_keeps_raw_json() {
        let raw = json!({ "type": "output_audio_buffer.started", "event_id": "evt_9", "response_id": "r" });
        let evt: ServerEvent = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(evt, ServerEvent::Unknown(_)));
        assert_eq!(evt.kind(), "output_audio_buffer.started");
        assert_eq!(evt.event_id(), Some("evt_9"));
        assert_eq!(serde_json::to_value(&evt).unwrap(), raw);
    }

    #[test]
    fn known_event_serializes_with_type_tag() {
        let evt = ServerEvent::InputAudioBufferCleared { event_id: "evt_2".to_string() };
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value, json!({ "type": "input_audio_buffer.cleared", "event_id": "evt_2" }));
        assert_eq!(evt.kind(), "input_audio_buffer.cleared");
    }

    #[test]
    fn error_event_parses_code() {
        let evt: ServerEvent = serde_json::from_value(json!({
            "type": "error",
            "event_id": "evt_3",
            "error": {
                "type": "invalid_request_error",
                "code": "conversation_already_has_active_response",
                "message": "Conversation already has an active response",
                "param": null,
                "event_id": null
            }
        }))
        .unwrap();
        match evt {
            ServerEvent::Error { error, .. } => {
                assert_eq!(error.code.as_deref(), Some("conversation_already_has_active_response"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
