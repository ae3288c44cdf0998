//! Single-active-response guard.
//!
//! Every `response.create` the session sends goes through [`ResponseGuard`].
//! A request made while a response is in flight (or while the server has not
//! yet acknowledged the previous request) is queued and retried on a fixed
//! interval until the active response completes.

use crate::error::ServerError;
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::Item;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An item to insert into the conversation.
#[derive(Debug, Clone)]
pub struct Submission {
    pub item: Item,
    pub previous_item_id: Option<String>,
    /// Sent instead of `item`, unanchored, if the conversation `item` refers
    /// to is replaced before it goes out.
    pub detached: Option<Item>,
}

impl Submission {
    #[must_use]
    pub const fn new(item: Item) -> Self {
        Self {
            item,
            previous_item_id: None,
            detached: None,
        }
    }

    /// `item` belongs to the current conversation, after `previous_item_id`
    /// when one is known.
    #[must_use]
    pub const fn tied(item: Item, previous_item_id: Option<String>, detached: Item) -> Self {
        Self {
            item,
            previous_item_id,
            detached: Some(detached),
        }
    }
}

/// A deferred unit of work that ends in exactly one `response.create`.
#[derive(Debug, Clone)]
pub enum GuardedRequest {
    Respond,
    SubmitAndRespond(Submission),
}

impl GuardedRequest {
    fn into_events(self) -> Vec<ClientEvent> {
        match self {
            Self::Respond => vec![ClientEvent::response_create()],
            Self::SubmitAndRespond(submission) => vec![
                ClientEvent::item_create(submission.item, submission.previous_item_id),
                ClientEvent::response_create(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// `response.create` sent, `response.created` not yet seen.
    Requested,
    Active,
}

#[derive(Debug)]
pub struct ResponseGuard {
    phase: Phase,
    active_response_id: Option<String>,
    deferred: VecDeque<GuardedRequest>,
    retry_interval: Duration,
    retry_at: Option<Instant>,
}

impl Default for ResponseGuard {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL)
    }
}

impl ResponseGuard {
    #[must_use]
    pub const fn new(retry_interval: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            active_response_id: None,
            deferred: VecDeque::new(),
            retry_interval,
            retry_at: None,
        }
    }

    /// True from the moment a `response.create` is issued until the matching
    /// `response.done` (or a protocol error) arrives.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.phase != Phase::Idle
    }

    #[must_use]
    pub fn active_response_id(&self) -> Option<&str> {
        self.active_response_id.as_deref()
    }

    /// Whether streamed output for `response_id` belongs to the current turn.
    #[must_use]
    pub fn accepts(&self, response_id: &str) -> bool {
        self.active_response_id
            .as_deref()
            .is_none_or(|active| active == response_id)
    }

    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Next instant at which a deferred request should be retried.
    #[must_use]
    pub const fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Ask for a model response. Returns the events to send now, or nothing if
    /// the request was deferred.
    pub fn request_response(&mut self, now: Instant, can_send: bool) -> Vec<ClientEvent> {
        self.submit(GuardedRequest::Respond, now, can_send)
    }

    /// Insert an item into the conversation and ask for a response. The item
    /// and its `response.create` are sent together or deferred together.
    pub fn submit_and_request_response(
        &mut self,
        submission: Submission,
        now: Instant,
        can_send: bool,
    ) -> Vec<ClientEvent> {
        self.submit(GuardedRequest::SubmitAndRespond(submission), now, can_send)
    }

    fn submit(&mut self, request: GuardedRequest, now: Instant, can_send: bool) -> Vec<ClientEvent> {
        if !can_send || self.is_active() || !self.deferred.is_empty() {
            tracing::debug!(
                active = self.is_active(),
                queued = self.deferred.len() + 1,
                "Deferring response request"
            );
            self.deferred.push_back(request);
            self.schedule_retry(now);
            return Vec::new();
        }
        self.issue(request)
    }

    fn issue(&mut self, request: GuardedRequest) -> Vec<ClientEvent> {
        self.phase = Phase::Requested;
        request.into_events()
    }

    fn schedule_retry(&mut self, now: Instant) {
        if self.retry_at.is_none() {
            self.retry_at = Some(now + self.retry_interval);
        }
    }

    pub fn on_response_created(&mut self, response_id: &str) {
        self.phase = Phase::Active;
        self.active_response_id = Some(response_id.to_string());
    }

    pub fn on_response_done(&mut self, response_id: &str) {
        if let Some(active) = self.active_response_id.as_deref() {
            if active != response_id {
                tracing::debug!(active, done = response_id, "response.done for a different response");
            }
        }
        self.phase = Phase::Idle;
        self.active_response_id = None;
    }

    /// React to a server `error` event.
    ///
    /// A conflict means the server is still running a response we did not
    /// know about: the request is re-queued. Any other error clears the flag.
    pub fn on_error(&mut self, error: &ServerError, now: Instant) {
        if error.is_active_response_conflict() {
            tracing::debug!("Server reports an active response, re-queueing request");
            self.phase = Phase::Active;
            self.deferred.push_front(GuardedRequest::Respond);
            self.schedule_retry(now);
        } else {
            self.phase = Phase::Idle;
            self.active_response_id = None;
        }
    }

    /// Retry timer fired. Issues at most one deferred request.
    pub fn on_retry(&mut self, now: Instant, can_send: bool) -> Vec<ClientEvent> {
        self.retry_at = None;
        let mut events = Vec::new();
        if can_send && !self.is_active() {
            if let Some(request) = self.deferred.pop_front() {
                events = self.issue(request);
            }
        }
        if !self.deferred.is_empty() {
            self.schedule_retry(now);
        }
        events
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.active_response_id = None;
        self.deferred.clear();
        self.retry_at = None;
    }

    /// Forget the in-flight response after a dropped connection, keeping
    /// deferred requests for the next connection.
    pub fn on_disconnect(&mut self, now: Instant) {
        self.phase = Phase::Idle;
        self.active_response_id = None;
        if !self.deferred.is_empty() {
            self.schedule_retry(now);
        }
    }

    /// A new connection started a new conversation: deferred items tied to
    /// the old one are swapped for their detached form.
    pub fn on_new_conversation(&mut self) {
        let mut detached = 0;
        for request in &mut self.deferred {
            if let GuardedRequest::SubmitAndRespond(submission) = request {
                if let Some(item) = submission.detached.take() {
                    *submission = Submission::new(item);
                    detached += 1;
                }
            }
        }
        if detached > 0 {
            tracing::debug!(detached, "Detached deferred items from the previous conversation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorType;
    use crate::protocol::models::Role;

    fn conflict() -> ServerError {
        ServerError {
            error_type: ApiErrorType::InvalidRequestError,
            code: Some(crate::error::ACTIVE_RESPONSE_CONFLICT.to_string()),
            message: "Conversation already has an active response".to_string(),
            param: None,
            event_id: None,
        }
    }

    fn count_creates(events: &[ClientEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ClientEvent::ResponseCreate { .. }))
            .count()
    }

    #[test]
    fn issues_immediately_when_idle() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        let events = guard.request_response(now, true);
        assert_eq!(count_creates(&events), 1);
        assert!(guard.is_active());
        assert!(guard.retry_at().is_none());
    }

    #[test]
    fn defers_while_active_and_retries_after_done() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        guard.on_response_created("resp_1");

        let submission = Submission::tied(
            Item::function_call_output("call_1", "{}"),
            Some("item_1".into()),
            Item::text_message(Role::System, "done"),
        );
        assert!(guard.submit_and_request_response(submission, now, true).is_empty());
        assert_eq!(guard.deferred_len(), 1);
        assert_eq!(guard.retry_at(), Some(now + DEFAULT_RETRY_INTERVAL));

        // still active: nothing leaves, retry re-armed
        let tick = now + DEFAULT_RETRY_INTERVAL;
        assert!(guard.on_retry(tick, true).is_empty());
        assert_eq!(guard.retry_at(), Some(tick + DEFAULT_RETRY_INTERVAL));

        guard.on_response_done("resp_1");
        let events = guard.on_retry(tick + DEFAULT_RETRY_INTERVAL, true);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ClientEvent::ConversationItemCreate { previous_item_id: Some(id), .. } if id == "item_1"
        ));
        assert_eq!(count_creates(&events), 1);
        assert!(guard.retry_at().is_none());
    }

    #[test]
    fn pending_creation_blocks_second_request() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        assert_eq!(count_creates(&guard.request_response(now, true)), 1);
        assert!(guard.request_response(now, true).is_empty());
        assert_eq!(guard.deferred_len(), 1);
    }

    #[test]
    fn one_request_per_tick() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        guard.on_response_created("resp_1");
        for text in ["a", "b"] {
            let item = Item::text_message(Role::User, text);
            guard.submit_and_request_response(Submission::new(item), now, true);
        }
        guard.on_response_done("resp_1");

        let first = guard.on_retry(now + DEFAULT_RETRY_INTERVAL, true);
        assert_eq!(count_creates(&first), 1);
        // the first request is now pending creation
        let second = guard.on_retry(now + DEFAULT_RETRY_INTERVAL * 2, true);
        assert!(second.is_empty());
        assert_eq!(guard.deferred_len(), 1);
    }

    #[test]
    fn conflict_requeues_bare_request() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        guard.request_response(now, true);
        guard.on_error(&conflict(), now);
        assert!(guard.is_active());
        assert_eq!(guard.deferred_len(), 1);

        guard.on_response_done("resp_auto");
        let events = guard.on_retry(now + DEFAULT_RETRY_INTERVAL, true);
        assert_eq!(events.len(), 1);
        assert_eq!(count_creates(&events), 1);
    }

    #[test]
    fn other_errors_clear_the_flag() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        guard.request_response(now, true);
        let mut err = conflict();
        err.code = Some("invalid_value".into());
        guard.on_error(&err, now);
        assert!(!guard.is_active());
    }

    #[test]
    fn offline_requests_wait_for_connection() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        assert!(guard.request_response(now, false).is_empty());
        assert!(guard.on_retry(now + DEFAULT_RETRY_INTERVAL, false).is_empty());
        assert_eq!(guard.deferred_len(), 1);
        assert_eq!(count_creates(&guard.on_retry(now + DEFAULT_RETRY_INTERVAL * 2, true)), 1);
    }

    #[test]
    fn new_conversation_detaches_tied_items() {
        let mut guard = ResponseGuard::default();
        let now = Instant::now();
        let tied = Submission::tied(
            Item::function_call_output("call_1", "{}"),
            Some("item_1".into()),
            Item::text_message(Role::System, "Result of the earlier request: done"),
        );
        guard.submit_and_request_response(tied, now, false);
        let plain = Item::text_message(Role::User, "hello");
        guard.submit_and_request_response(Submission::new(plain), now, false);
        guard.on_disconnect(now);
        guard.on_new_conversation();

        let events = guard.on_retry(now + DEFAULT_RETRY_INTERVAL, true);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ClientEvent::ConversationItemCreate { item, previous_item_id, .. } => {
                assert!(previous_item_id.is_none());
                assert!(matches!(item.as_ref(), Item::Message { role: Role::System, .. }));
            }
            other => panic!("wrong event: {other:?}"),
        }

        guard.on_response_created("resp_1");
        guard.on_response_done("resp_1");
        let events = guard.on_retry(now + DEFAULT_RETRY_INTERVAL * 2, true);
        assert!(matches!(
            &events[0],
            ClientEvent::ConversationItemCreate { item, .. }
                if matches!(item.as_ref(), Item::Message { role: Role::User, .. })
        ));
    }

    #[test]
    fn stale_audio_is_rejected() {
        let mut guard = ResponseGuard::default();
        assert!(guard.accepts("anything"));
        guard.on_response_created("resp_2");
        assert!(guard.accepts("resp_2"));
        assert!(!guard.accepts("resp_1"));
    }
}
