//! Voice session engine.
//!
//! [`VoiceSession`] owns the connection, the microphone and the speaker and
//! drives them from a single task. The building blocks are public so hosts can
//! reuse them outside a session: [`ResponseGuard`] for response serialization,
//! [`ToolCallTracker`] for the tool-call lifecycle, and the capture/playback
//! pipelines with their device traits.

mod builder;
pub mod calls;
pub mod capture;
pub mod credentials;
pub mod gateway;
pub mod guard;
pub mod pcm;
pub mod playback;
pub mod reconnect;
mod session;
mod status;
mod tools;
mod transport;

pub use builder::{DEFAULT_INSTRUCTIONS, SessionSettings, VoiceSessionBuilder};
pub use calls::{PendingExternalCall, ToolCallStatus, ToolCallTracker};
pub use capture::{AudioCapture, AudioInput, CaptureConfig, CaptureGate, CaptureStream};
pub use credentials::{EphemeralTokenSource, StaticToken, TokenSource};
pub use gateway::{
    AGENT_NETWORK_TOOL, AgentGateway, AgentNetworkArgs, ExternalResult, GatewayAck,
    GatewayRequest, ResultStatus,
};
pub use guard::{ResponseGuard, Submission};
pub use playback::{AudioOutput, AudioPlayback, NullOutput, PlaybackConfig};
pub use reconnect::ReconnectPolicy;
pub use session::{SessionHandle, VoiceSession};
pub use status::{ConnectionState, SessionStatus};
pub use tools::{ToolCatalog, ToolDefinition};
pub use transport::{BoxFuture, Connector, Transport, WsConnector};
