//! Boundary to the external agent network.
//!
//! The session hands each tool call to an [`AgentGateway`] and forgets about
//! it until the host injects an [`ExternalResult`] for the same `call_id`.

use crate::Result;
use crate::protocol::models::Metadata;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::calls::DispatchedCall;

pub const AGENT_NETWORK_TOOL: &str = "send_to_agent_network";

/// Arguments the model supplies to the agent-network tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentNetworkArgs {
    /// Natural-language description of what the agent network should do.
    pub request: String,
}

/// One tool call forwarded to the agent network.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub call_id: String,
    pub tool_name: String,
    /// The `request` argument, or the raw arguments when the model sent something else.
    pub request_text: String,
    pub arguments: Value,
    pub metadata: Metadata,
}

impl GatewayRequest {
    #[must_use]
    pub fn from_call(call: &DispatchedCall, metadata: Metadata) -> Self {
        let request_text = match &call.arguments {
            Value::Object(map) => map
                .get("request")
                .and_then(Value::as_str)
                .map_or_else(|| call.arguments.to_string(), str::to_string),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            request_text,
            arguments: call.arguments.clone(),
            metadata,
        }
    }
}

/// Acknowledgement of a dispatch. The result itself arrives later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAck {
    #[serde(default)]
    pub reference: Option<String>,
}

#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// Forward a call. An error is narrated back to the model as a failed result.
    async fn dispatch(&self, request: GatewayRequest) -> Result<GatewayAck>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Error,
}

/// A result delivered by the agent network for a pending call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalResult {
    pub status: ResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Any further structured fields, passed through to the model verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExternalResult {
    #[must_use]
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Completed,
            message: message.into(),
            error: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            message: message.into(),
            error: Some(error.into()),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }

    /// JSON string placed in the `output` of a `function_call_output` item.
    #[must_use]
    pub fn to_output(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            serde_json::json!({
                "status": "error",
                "message": self.message,
                "error": err.to_string(),
            })
            .to_string()
        })
    }
}
