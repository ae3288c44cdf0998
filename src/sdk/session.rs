use crate::error::LastError;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{Item, Response, Role, SessionConfig};
use crate::protocol::server_events::ServerEvent;
use crate::{Error, Result};

use super::builder::{SessionSettings, VoiceSessionBuilder};
use super::calls::{DispatchedCall, ToolCallTracker};
use super::capture::{AudioCapture, AudioInput, CaptureGate};
use super::credentials::TokenSource;
use super::gateway::{AgentGateway, ExternalResult, GatewayAck, GatewayRequest};
use super::guard::{ResponseGuard, Submission};
use super::playback::{AudioOutput, AudioPlayback};
use super::reconnect::{ReconnectDecision, ReconnectionState};
use super::status::{ConnectionState, SessionStatus};
use super::transport::{Connector, Transport};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Added to playback idle deadlines so the output clock is past the end of
/// the last fragment when the check runs.
const PLAYBACK_IDLE_SLACK: Duration = Duration::from_millis(1);

pub(super) struct SessionParts {
    pub settings: SessionSettings,
    pub session_config: SessionConfig,
    pub token_source: Arc<dyn TokenSource>,
    pub connector: Arc<dyn Connector>,
    pub gateway: Arc<dyn AgentGateway>,
    pub input: Box<dyn AudioInput>,
    pub output: Box<dyn AudioOutput>,
}

enum Command {
    Start {
        respond: oneshot::Sender<Result<()>>,
    },
    Stop {
        respond: oneshot::Sender<()>,
    },
    ToggleMute {
        respond: oneshot::Sender<bool>,
    },
    InjectResult {
        call_id: String,
        result: ExternalResult,
        respond: oneshot::Sender<Result<bool>>,
    },
    InjectMessage {
        text: String,
        respond: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable control surface of a running [`VoiceSession`].
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

/// A duplex voice session.
///
/// All state lives in a driver task; this type and its [`SessionHandle`]s send
/// it commands. Dropping every handle stops the session.
pub struct VoiceSession {
    handle: SessionHandle,
}

impl VoiceSession {
    #[must_use]
    pub fn builder() -> VoiceSessionBuilder {
        VoiceSessionBuilder::new()
    }

    pub(super) fn spawn(parts: SessionParts) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let driver = Driver::new(parts, cmd_rx, status_tx);
        tokio::spawn(driver.run());
        Self {
            handle: SessionHandle {
                sender: cmd_tx,
                status: status_rx,
            },
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Connect, configure the session and start the microphone.
    ///
    /// # Errors
    /// Returns an error if credentials, the connection, or the microphone fail.
    /// The session is left in [`ConnectionState::Error`] and may be started again.
    pub async fn start(&self) -> Result<()> {
        self.handle.start().await
    }

    /// Tear everything down. The session may be started again afterwards.
    ///
    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn stop(&self) -> Result<()> {
        self.handle.stop().await
    }

    /// Flip the mute flag and return the new value.
    ///
    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.handle.toggle_mute().await
    }

    /// Deliver an agent-network result for a pending tool call. Returns false
    /// if no call with that id is pending.
    ///
    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn inject_external_result(
        &self,
        call_id: impl Into<String>,
        result: ExternalResult,
    ) -> Result<bool> {
        self.handle.inject_external_result(call_id, result).await
    }

    /// Add a user text message and request a response.
    ///
    /// # Errors
    /// Returns an error if the session is not connected.
    pub async fn inject_message(&self, text: impl Into<String>) -> Result<()> {
        self.handle.inject_message(text).await
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.handle.status()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.handle.subscribe()
    }
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| Error::SessionStopped)?;
        rx.await.map_err(|_| Error::SessionStopped)
    }

    /// # Errors
    /// See [`VoiceSession::start`].
    pub async fn start(&self) -> Result<()> {
        self.request(|respond| Command::Start { respond }).await?
    }

    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn stop(&self) -> Result<()> {
        self.request(|respond| Command::Stop { respond }).await
    }

    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(|respond| Command::ToggleMute { respond }).await
    }

    /// # Errors
    /// Returns an error if the driver is gone.
    pub async fn inject_external_result(
        &self,
        call_id: impl Into<String>,
        result: ExternalResult,
    ) -> Result<bool> {
        let call_id = call_id.into();
        self.request(|respond| Command::InjectResult { call_id, result, respond })
            .await?
    }

    /// # Errors
    /// Returns an error if the session is not connected.
    pub async fn inject_message(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|respond| Command::InjectMessage { text, respond })
            .await?
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    ///
    /// # Errors
    /// Returns an error if the driver exits first.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> Result<SessionStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(predicate)
            .await
            .map_err(|_| Error::SessionStopped)?;
        Ok(status.clone())
    }
}

type DispatchOutcome = (String, Result<GatewayAck>);

enum Wake {
    Command(Command),
    HandlesDropped,
    Server(Result<Option<ServerEvent>>),
    Microphone(Option<Vec<f32>>),
    Dispatch(std::result::Result<DispatchOutcome, JoinError>),
    RetryResponse,
    Reconnect,
    PlaybackCheck,
}

struct Driver {
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<SessionStatus>,
    settings: SessionSettings,
    session_config: SessionConfig,
    token_source: Arc<dyn TokenSource>,
    connector: Arc<dyn Connector>,
    gateway: Arc<dyn AgentGateway>,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
    capture: AudioCapture,
    playback: AudioPlayback,
    calls: ToolCallTracker,
    guard: ResponseGuard,
    reconnect: ReconnectionState,
    reconnect_at: Option<Instant>,
    playback_check_at: Option<Instant>,
    muted: bool,
    last_error: Option<LastError>,
    /// Incremented on every successful connect.
    generation: u64,
    dispatches: JoinSet<DispatchOutcome>,
}

impl Driver {
    fn new(
        parts: SessionParts,
        commands: mpsc::Receiver<Command>,
        status_tx: watch::Sender<SessionStatus>,
    ) -> Self {
        let settings = parts.settings;
        Self {
            commands,
            status_tx,
            session_config: parts.session_config,
            token_source: parts.token_source,
            connector: parts.connector,
            gateway: parts.gateway,
            transport: None,
            state: ConnectionState::Disconnected,
            capture: AudioCapture::new(parts.input, settings.capture.clone()),
            playback: AudioPlayback::new(parts.output, settings.playback.clone()),
            calls: ToolCallTracker::new(),
            guard: ResponseGuard::new(settings.retry_interval()),
            reconnect: ReconnectionState::new(settings.reconnect),
            reconnect_at: None,
            playback_check_at: None,
            muted: false,
            last_error: None,
            generation: 0,
            dispatches: JoinSet::new(),
            settings,
        }
    }

    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                cmd = self.commands.recv() => cmd.map_or(Wake::HandlesDropped, Wake::Command),
                event = next_server_event(&mut self.transport) => Wake::Server(event),
                Some(joined) = self.dispatches.join_next(), if !self.dispatches.is_empty() => {
                    Wake::Dispatch(joined)
                }
                () = sleep_until_opt(self.guard.retry_at()) => Wake::RetryResponse,
                () = sleep_until_opt(self.reconnect_at) => Wake::Reconnect,
                () = sleep_until_opt(self.playback_check_at) => Wake::PlaybackCheck,
                block = self.capture.next_block() => Wake::Microphone(block),
            };

            match wake {
                Wake::HandlesDropped => {
                    self.teardown().await;
                    self.state = ConnectionState::Terminated;
                    self.publish();
                    break;
                }
                Wake::Command(cmd) => self.on_command(cmd).await,
                Wake::Server(event) => self.on_server(event).await,
                Wake::Microphone(block) => self.on_microphone(block).await,
                Wake::Dispatch(joined) => self.on_dispatch_outcome(joined).await,
                Wake::RetryResponse => {
                    let events = self.guard.on_retry(Instant::now(), self.can_send());
                    self.send_all(events).await;
                }
                Wake::Reconnect => self.on_reconnect().await,
                Wake::PlaybackCheck => {
                    self.playback_check_at = None;
                    if !self.playback.poll_idle() {
                        self.arm_playback_check();
                    }
                }
            }
            self.publish();
        }
        tracing::debug!("Session driver exited");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { respond } => {
                let result = self.start().await;
                let _ = respond.send(result);
            }
            Command::Stop { respond } => {
                self.stop().await;
                let _ = respond.send(());
            }
            Command::ToggleMute { respond } => {
                self.muted = !self.muted;
                tracing::info!(muted = self.muted, "Microphone mute toggled");
                let _ = respond.send(self.muted);
            }
            Command::InjectResult { call_id, result, respond } => {
                let outcome = self.inject_result(&call_id, result).await;
                let _ = respond.send(outcome);
            }
            Command::InjectMessage { text, respond } => {
                let outcome = self.inject_message(text).await;
                let _ = respond.send(outcome);
            }
        }
    }

    // ---- lifecycle ----

    async fn start(&mut self) -> Result<()> {
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            return Ok(());
        }
        self.last_error = None;
        self.set_state(ConnectionState::Connecting);

        let opened = match self.open_connection().await {
            Ok(()) => self.capture.start(),
            // nothing to fall back on before the first connection
            Err(Error::CredentialsUnavailable(reason)) => Err(Error::Credentials(reason)),
            Err(err) => Err(err),
        };
        if let Err(err) = opened {
            self.fail(&err).await;
            return Err(err);
        }

        self.reconnect.reset();
        self.set_state(ConnectionState::Connected);
        tracing::info!(model = %self.settings.model, "Voice session started");

        if self.settings.auto_greet {
            let events = self.guard.request_response(Instant::now(), true);
            self.send_all(events).await;
        }
        Ok(())
    }

    async fn open_connection(&mut self) -> Result<()> {
        let token = self
            .token_source
            .get_token()
            .await
            .map_err(Error::into_credentials_error)?;
        let transport = self.connector.connect(&token).await?;
        self.transport = Some(transport);
        self.generation += 1;
        self.send(ClientEvent::session_update(self.session_config.clone()))
            .await
    }

    async fn stop(&mut self) {
        self.teardown().await;
        self.muted = false;
        self.set_state(ConnectionState::Terminated);
        tracing::info!("Voice session stopped");
    }

    async fn fail(&mut self, err: &Error) {
        tracing::error!(error = %err, "Voice session failed");
        self.teardown().await;
        self.last_error = Some(LastError::from(err));
        self.set_state(ConnectionState::Error);
    }

    async fn teardown(&mut self) {
        self.capture.stop();
        self.playback.stop();
        if let Some(mut transport) = self.transport.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "Failed to close transport"),
                Err(_) => tracing::debug!("Timed out closing transport"),
            }
        }
        self.dispatches.abort_all();
        self.dispatches = JoinSet::new();
        self.calls.clear();
        self.guard.reset();
        self.reconnect.reset();
        self.reconnect_at = None;
        self.playback_check_at = None;
    }

    async fn on_connection_lost(&mut self, err: Error) {
        tracing::warn!(error = %err, "Connection lost");
        self.transport = None;
        self.last_error = Some(LastError::from(&err));
        self.playback.stop();
        self.playback_check_at = None;
        self.guard.on_disconnect(Instant::now());
        self.calls.forget_unexecuted();

        match self.reconnect.on_connection_lost() {
            ReconnectDecision::Retry { attempt, delay } => {
                tracing::info!(attempt, ?delay, "Scheduling reconnection");
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Connecting);
            }
            ReconnectDecision::Exhausted { attempts } => {
                self.fail(&Error::ReconnectExhausted { attempts }).await;
            }
        }
    }

    async fn on_reconnect(&mut self) {
        self.reconnect_at = None;
        match self.open_connection().await {
            Ok(()) => {
                tracing::info!(generation = self.generation, "Reconnected");
                self.guard.on_new_conversation();
                self.reconnect.reset();
                self.set_state(ConnectionState::Connected);
            }
            Err(err) if err.is_fatal() => self.fail(&err).await,
            Err(err) => self.on_connection_lost(err).await,
        }
    }

    // ---- server events ----

    async fn on_server(&mut self, event: Result<Option<ServerEvent>>) {
        match event {
            Ok(Some(event)) => self.on_server_event(event).await,
            Ok(None) => {
                tracing::info!("Server closed the connection");
                self.transport = None;
                self.capture.stop();
                self.playback.stop();
                self.playback_check_at = None;
                self.guard.reset();
                self.calls.forget_unexecuted();
                self.set_state(ConnectionState::Disconnected);
            }
            Err(err) if err.kind() == crate::ErrorKind::Retriable => {
                self.on_connection_lost(err).await;
            }
            Err(err) => tracing::warn!(error = %err, "Discarding unreadable server message"),
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session, .. } => {
                tracing::debug!(session_id = ?session.id, "Realtime session created");
            }
            ServerEvent::SessionUpdated { .. } => tracing::debug!("Session configuration applied"),
            ServerEvent::InputAudioBufferSpeechStarted { item_id, .. } => {
                tracing::debug!(item_id, "User speech started");
            }
            ServerEvent::InputAudioBufferSpeechStopped { item_id, .. } => {
                tracing::debug!(item_id, "User speech stopped");
            }
            ServerEvent::InputAudioTranscriptionCompleted { transcript, .. } => {
                tracing::debug!(transcript, "User transcript");
            }
            ServerEvent::ConversationItemCreated { item, .. }
            | ServerEvent::ResponseOutputItemAdded { item, .. } => {
                if let Item::FunctionCall { id, name, call_id, .. } = &item {
                    self.calls
                        .on_item_created(call_id, name, id.as_deref().unwrap_or_default());
                }
            }
            ServerEvent::ResponseFunctionCallArgumentsDone {
                response_id,
                item_id,
                call_id,
                name,
                arguments,
                ..
            } => {
                self.calls.on_arguments(
                    &call_id,
                    name.as_deref(),
                    &item_id,
                    Some(&response_id),
                    arguments,
                );
            }
            ServerEvent::ResponseOutputItemDone { response_id, item, .. } => {
                self.observe_completed_item(&item, &response_id);
            }
            ServerEvent::ResponseCreated { response, .. } => {
                tracing::debug!(response_id = %response.id, "Response started");
                self.guard.on_response_created(&response.id);
            }
            ServerEvent::ResponseDone { response, .. } => self.on_response_done(&response).await,
            ServerEvent::ResponseAudioDelta { response_id, delta, .. } => {
                self.on_audio_delta(&response_id, &delta).await;
            }
            ServerEvent::ResponseAudioDone { response_id, .. } => {
                if self.guard.accepts(&response_id) {
                    self.end_playback_turn().await;
                }
            }
            ServerEvent::ResponseAudioTranscriptDone { transcript, .. } => {
                tracing::debug!(transcript, "Assistant transcript");
            }
            ServerEvent::Error { error, .. } => {
                tracing::warn!(code = ?error.code, message = %error.message, "Server reported an error");
                if !error.is_active_response_conflict() {
                    self.last_error = Some(LastError::from(&Error::Api(error.clone())));
                }
                self.guard.on_error(&error, Instant::now());
            }
            event if event.is_malformed() => self.on_malformed_event(&event).await,
            other => tracing::trace!(kind = other.kind(), "Ignoring server event"),
        }
    }

    /// A `response.created` or `response.done` that failed to parse still
    /// moves the turn forward, using whatever response id can be read.
    async fn on_malformed_event(&mut self, event: &ServerEvent) {
        let ServerEvent::Unknown(raw) = event else {
            return;
        };
        let response_id = raw
            .pointer("/response/id")
            .and_then(Value::as_str)
            .or_else(|| self.guard.active_response_id())
            .unwrap_or_default()
            .to_string();
        match event.kind() {
            "response.created" if !response_id.is_empty() => {
                self.guard.on_response_created(&response_id);
            }
            "response.done" => self.finish_response(&response_id).await,
            _ => {}
        }
    }

    fn observe_completed_item(&mut self, item: &Item, response_id: &str) {
        if let Item::FunctionCall { id, name, call_id, arguments, .. } = item {
            let anchor = id.as_deref().unwrap_or_default();
            self.calls.on_item_created(call_id, name, anchor);
            self.calls
                .on_arguments(call_id, Some(name), anchor, Some(response_id), arguments.clone());
        }
    }

    async fn on_response_done(&mut self, response: &Response) {
        tracing::debug!(response_id = %response.id, status = ?response.status, "Response finished");
        for item in &response.output {
            self.observe_completed_item(item, &response.id);
        }
        self.finish_response(&response.id).await;
    }

    async fn finish_response(&mut self, response_id: &str) {
        self.guard.on_response_done(response_id);
        self.end_playback_turn().await;

        let due = self
            .calls
            .on_response_done(response_id, Instant::now(), self.generation);
        for call in due {
            self.dispatch_call(&call);
        }
    }

    async fn on_audio_delta(&mut self, response_id: &str, delta: &str) {
        if !self.guard.accepts(response_id) {
            tracing::trace!(response_id, "Dropping audio from a superseded response");
            return;
        }
        match self.playback.push_delta(delta) {
            Ok(()) => self.arm_playback_check(),
            Err(err) if err.is_fatal() => self.fail(&err).await,
            Err(err) => tracing::warn!(error = %err, "Dropping undecodable audio fragment"),
        }
    }

    async fn end_playback_turn(&mut self) {
        match self.playback.end_turn() {
            Ok(()) => self.arm_playback_check(),
            Err(err) if err.is_fatal() => self.fail(&err).await,
            Err(err) => tracing::warn!(error = %err, "Failed to schedule buffered audio"),
        }
    }

    fn arm_playback_check(&mut self) {
        self.playback_check_at = self
            .playback
            .remaining()
            .map(|left| Instant::now() + left + PLAYBACK_IDLE_SLACK);
    }

    // ---- tool calls ----

    fn dispatch_call(&mut self, call: &DispatchedCall) {
        let request = GatewayRequest::from_call(call, self.settings.metadata.clone());
        let gateway = Arc::clone(&self.gateway);
        let call_id = call.call_id.clone();
        tracing::info!(call_id = %call.call_id, tool = %call.name, "Dispatching tool call to agent network");
        self.dispatches.spawn(async move {
            let outcome = AssertUnwindSafe(gateway.dispatch(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Gateway("gateway dispatch panicked".to_string())));
            (call_id, outcome)
        });
    }

    async fn on_dispatch_outcome(&mut self, joined: std::result::Result<DispatchOutcome, JoinError>) {
        match joined {
            Ok((call_id, Ok(ack))) => {
                tracing::debug!(call_id, reference = ?ack.reference, "Agent network accepted call");
                self.calls.mark_awaiting_result(&call_id);
            }
            Ok((call_id, Err(err))) => {
                let err = match err {
                    Error::Gateway(_) => err,
                    other => Error::Gateway(other.to_string()),
                };
                tracing::warn!(call_id, error = %err, "Agent network dispatch failed");
                self.last_error = Some(LastError::from(&err));
                let result = ExternalResult::failed(
                    "The request could not be delivered to the agent network.",
                    err.to_string(),
                );
                if let Err(err) = self.inject_result(&call_id, result).await {
                    tracing::warn!(call_id, error = %err, "Failed to report dispatch failure");
                }
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::error!(error = %err, "Gateway task failed"),
        }
    }

    async fn inject_result(&mut self, call_id: &str, result: ExternalResult) -> Result<bool> {
        let Some(resolved) = self.calls.resolve(call_id, result.is_error()) else {
            tracing::warn!(call_id, "Ignoring result for an unknown or already resolved call");
            return Ok(false);
        };
        let call = resolved.call;
        tracing::info!(
            call_id,
            status = ?resolved.status,
            elapsed = ?call.dispatched_at.elapsed(),
            "Delivering agent network result"
        );

        let output = result.to_output();
        let text = format!("Result of the earlier {} request: {output}", call.name);
        let detached = Item::text_message(Role::System, text);
        let submission = if call.generation == self.generation {
            let anchor = Some(call.anchor_item_id).filter(|id| !id.is_empty());
            Submission::tied(Item::function_call_output(call_id, output), anchor, detached)
        } else {
            // the anchor item belongs to a conversation that no longer exists
            Submission::new(detached)
        };
        let events = self
            .guard
            .submit_and_request_response(submission, Instant::now(), self.can_send());
        self.send_all(events).await;
        Ok(true)
    }

    async fn inject_message(&mut self, text: String) -> Result<()> {
        if !self.can_send() {
            return Err(Error::ConnectionClosed);
        }
        let item = Item::text_message(Role::User, text);
        let events = self
            .guard
            .submit_and_request_response(Submission::new(item), Instant::now(), true);
        self.send_all(events).await;
        Ok(())
    }

    // ---- audio in ----

    async fn on_microphone(&mut self, block: Option<Vec<f32>>) {
        let Some(block) = block else {
            self.fail(&Error::Microphone("capture device disconnected".to_string()))
                .await;
            return;
        };
        let frames = self.capture.process(&block, self.gate());
        for frame in frames {
            if let Err(err) = self.send(ClientEvent::audio_append(frame)).await {
                tracing::debug!(error = %err, "Dropping microphone frame");
                break;
            }
        }
    }

    // ---- plumbing ----

    fn can_send(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.is_some()
    }

    const fn gate(&self) -> CaptureGate {
        CaptureGate {
            connected: matches!(self.state, ConnectionState::Connected),
            playback_active: self.playback.is_active(),
            muted: self.muted,
        }
    }

    async fn send(&mut self, event: ClientEvent) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        transport.send(event).await
    }

    async fn send_all(&mut self, events: Vec<ClientEvent>) {
        for event in events {
            let kind = event.kind();
            if let Err(err) = self.send(event).await {
                tracing::warn!(kind, error = %err, "Failed to send client event");
                break;
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "Connection state changed");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let status = SessionStatus {
            state: self.state,
            connected: self.state == ConnectionState::Connected,
            listening: self.capture.is_running() && self.gate().is_open(),
            speaking: self.playback.is_active(),
            muted: self.muted,
            pending_external_calls: self.calls.pending_len(),
            reconnect_attempts: self.reconnect.attempts(),
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

async fn next_server_event(transport: &mut Option<Box<dyn Transport>>) -> Result<Option<ServerEvent>> {
    match transport {
        Some(transport) => transport.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
