use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{ArbitraryJson, ItemStatus, Role};

/// Manual (de)serialization preserves unknown variants as raw JSON while keeping
/// strong typing for the items the session acts on.
#[derive(Debug, Clone)]
pub enum Item {
    Message {
        id: Option<String>,
        status: Option<ItemStatus>,
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: Option<String>,
        status: Option<ItemStatus>,
        name: String,
        call_id: String,
        arguments: String,
    },
    FunctionCallOutput {
        id: Option<String>,
        call_id: String,
        output: String,
    },
    Unknown(ArbitraryJson),
}

impl Item {
    /// A text message item, used for host-injected turns.
    #[must_use]
    pub fn text_message(role: Role, text: impl Into<String>) -> Self {
        let text = text.into();
        let part = match role {
            Role::Assistant => ContentPart::Text { text },
            Role::User | Role::System => ContentPart::InputText { text },
        };
        Self::Message {
            id: None,
            status: None,
            role,
            content: vec![part],
        }
    }

    #[must_use]
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::FunctionCallOutput {
            id: None,
            call_id: call_id.into(),
            output: output.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Message { id, .. }
            | Self::FunctionCall { id, .. }
            | Self::FunctionCallOutput { id, .. } => id.as_deref(),
            Self::Unknown(value) => value.get("id").and_then(|v| v.as_str()),
        }
    }
}

impl std::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Message { .. } => "message",
            Self::FunctionCall { .. } => "function_call",
            Self::FunctionCallOutput { .. } => "function_call_output",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ItemRepr {
    Message {
        id: Option<String>,
        status: Option<ItemStatus>,
        role: Role,
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: Option<String>,
        status: Option<ItemStatus>,
        name: String,
        call_id: String,
        #[serde(default)]
        arguments: String,
    },
    FunctionCallOutput {
        id: Option<String>,
        call_id: String,
        output: String,
    },
}

impl From<ItemRepr> for Item {
    fn from(repr: ItemRepr) -> Self {
        match repr {
            ItemRepr::Message { id, status, role, content } => Self::Message {
                id,
                status,
                role,
                content,
            },
            ItemRepr::FunctionCall { id, status, name, call_id, arguments } => Self::FunctionCall {
                id,
                status,
                name,
                call_id,
                arguments,
            },
            ItemRepr::FunctionCallOutput { id, call_id, output } => Self::FunctionCallOutput {
                id,
                call_id,
                output,
            },
        }
    }
}

/// Borrowed view used for serialization; `None` fields are omitted.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ItemRef<'a> {
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<ItemStatus>,
        role: Role,
        content: &'a [ContentPart],
    },
    FunctionCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<ItemStatus>,
        name: &'a str,
        call_id: &'a str,
        arguments: &'a str,
    },
    FunctionCallOutput {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<&'a str>,
        call_id: &'a str,
        output: &'a str,
    },
}

impl Serialize for Item {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let view = match self {
            Self::Unknown(value) => return value.serialize(serializer),
            Self::Message { id, status, role, content } => ItemRef::Message {
                id: id.as_deref(),
                status: *status,
                role: *role,
                content,
            },
            Self::FunctionCall { id, status, name, call_id, arguments } => ItemRef::FunctionCall {
                id: id.as_deref(),
                status: *status,
                name,
                call_id,
                arguments,
            },
            Self::FunctionCallOutput { id, call_id, output } => ItemRef::FunctionCallOutput {
                id: id.as_deref(),
                call_id,
                output,
            },
        };
        view.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Item {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = ArbitraryJson::deserialize(deserializer)?;
        match ItemRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::debug!("Failed to parse Item: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ContentPart {
    InputText {
        text: String,
    },
    InputAudio {
        audio: Option<String>,
        transcript: Option<String>,
    },
    Text {
        text: String,
    },
    Audio {
        audio: Option<String>,
        transcript: Option<String>,
    },
    Unknown(ArbitraryJson),
}

impl std::fmt::Display for ContentPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InputText { .. } => "input_text",
            Self::InputAudio { .. } => "input_audio",
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPartRepr {
    InputText { text: String },
    InputAudio {
        audio: Option<String>,
        transcript: Option<String>,
    },
    Text { text: String },
    Audio {
        audio: Option<String>,
        transcript: Option<String>,
    },
}

impl From<ContentPartRepr> for ContentPart {
    fn from(repr: ContentPartRepr) -> Self {
        match repr {
            ContentPartRepr::InputText { text } => Self::InputText { text },
            ContentPartRepr::InputAudio { audio, transcript } => Self::InputAudio { audio, transcript },
            ContentPartRepr::Text { text } => Self::Text { text },
            ContentPartRepr::Audio { audio, transcript } => Self::Audio { audio, transcript },
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPartRef<'a> {
    InputText {
        text: &'a str,
    },
    InputAudio {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript: Option<&'a str>,
    },
    Text {
        text: &'a str,
    },
    Audio {
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transcript: Option<&'a str>,
    },
}

impl Serialize for ContentPart {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let view = match self {
            Self::Unknown(value) => return value.serialize(serializer),
            Self::InputText { text } => ContentPartRef::InputText { text },
            Self::Text { text } => ContentPartRef::Text { text },
            Self::InputAudio { audio, transcript } => ContentPartRef::InputAudio {
                audio: audio.as_deref(),
                transcript: transcript.as_deref(),
            },
            Self::Audio { audio, transcript } => ContentPartRef::Audio {
                audio: audio.as_deref(),
                transcript: transcript.as_deref(),
            },
        };
        view.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentPart {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = ArbitraryJson::deserialize(deserializer)?;
        match ContentPartRepr::deserialize(value.clone()) {
            Ok(repr) => Ok(repr.into()),
            Err(err) => {
                tracing::debug!("Failed to parse ContentPart: {err}");
                Ok(Self::Unknown(value))
            }
        }
    }
}
