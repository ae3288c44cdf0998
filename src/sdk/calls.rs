//! Tool-call lifecycle.
//!
//! A call moves `AwaitingArguments -> ReadyToExecute -> Dispatched ->
//! AwaitingExternalResult -> Completed | Failed`. Execution is deferred until
//! the response that produced the call has finished, and a call id is
//! dispatched at most once no matter how often the server repeats the events
//! that describe it. Resolved ids are remembered for the most recent
//! [`FINISHED_CALL_HISTORY`] calls.

use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::time::Instant;

pub const FINISHED_CALL_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    AwaitingArguments,
    ReadyToExecute,
    Dispatched,
    AwaitingExternalResult,
    Completed,
    Failed,
}

/// A call observed in the current response.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub name: String,
    /// Id of the conversation item that carried the call.
    pub anchor_item_id: String,
    pub response_id: Option<String>,
    pub arguments: Option<String>,
    pub status: ToolCallStatus,
}

/// A call that has been handed to the agent network and awaits its result.
#[derive(Debug, Clone)]
pub struct PendingExternalCall {
    pub call_id: String,
    pub name: String,
    pub anchor_item_id: String,
    pub dispatched_at: Instant,
    /// Connection generation the call was dispatched on; the anchor item only
    /// exists in that connection's conversation.
    pub generation: u64,
    pub status: ToolCallStatus,
}

/// Output of [`ToolCallTracker::on_response_done`]: a call ready to dispatch.
#[derive(Debug, Clone)]
pub struct DispatchedCall {
    pub call_id: String,
    pub name: String,
    pub anchor_item_id: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub call: PendingExternalCall,
    pub status: ToolCallStatus,
}

/// Ids of resolved or dropped calls, oldest evicted first.
#[derive(Debug)]
struct FinishedCalls {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FinishedCalls {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, call_id: &str) -> bool {
        self.ids.contains(call_id)
    }

    fn insert(&mut self, call_id: String) {
        if !self.ids.insert(call_id.clone()) {
            return;
        }
        self.order.push_back(call_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

#[derive(Debug)]
pub struct ToolCallTracker {
    active: HashMap<String, ToolCallRecord>,
    pending: HashMap<String, PendingExternalCall>,
    finished: FinishedCalls,
}

impl Default for ToolCallTracker {
    fn default() -> Self {
        Self::with_history(FINISHED_CALL_HISTORY)
    }
}

impl ToolCallTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember at most `history` finished call ids.
    #[must_use]
    pub fn with_history(history: usize) -> Self {
        Self {
            active: HashMap::new(),
            pending: HashMap::new(),
            finished: FinishedCalls::new(history),
        }
    }

    fn is_known(&self, call_id: &str) -> bool {
        self.active.contains_key(call_id)
            || self.pending.contains_key(call_id)
            || self.finished.contains(call_id)
    }

    /// A `function_call` item was created. Returns true if this created a new record.
    pub fn on_item_created(&mut self, call_id: &str, name: &str, anchor_item_id: &str) -> bool {
        if call_id.is_empty() || self.is_known(call_id) {
            return false;
        }
        tracing::debug!(call_id, name, "Tool call announced");
        self.active.insert(
            call_id.to_string(),
            ToolCallRecord {
                call_id: call_id.to_string(),
                name: name.to_string(),
                anchor_item_id: anchor_item_id.to_string(),
                response_id: None,
                arguments: None,
                status: ToolCallStatus::AwaitingArguments,
            },
        );
        true
    }

    /// The call's arguments are complete. Creates the record if the item
    /// announcement was never seen. Returns true on the transition to
    /// `ReadyToExecute`.
    pub fn on_arguments(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        anchor_item_id: &str,
        response_id: Option<&str>,
        arguments: String,
    ) -> bool {
        if call_id.is_empty() || self.pending.contains_key(call_id) || self.finished.contains(call_id) {
            return false;
        }
        let record = self
            .active
            .entry(call_id.to_string())
            .or_insert_with(|| ToolCallRecord {
                call_id: call_id.to_string(),
                name: String::new(),
                anchor_item_id: anchor_item_id.to_string(),
                response_id: None,
                arguments: None,
                status: ToolCallStatus::AwaitingArguments,
            });
        if record.status != ToolCallStatus::AwaitingArguments {
            return false;
        }
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            record.name = name.to_string();
        }
        if record.anchor_item_id.is_empty() {
            record.anchor_item_id = anchor_item_id.to_string();
        }
        record.response_id = response_id.map(str::to_string);
        record.arguments = Some(arguments);
        record.status = ToolCallStatus::ReadyToExecute;
        tracing::debug!(call_id, name = %record.name, "Tool call arguments complete");
        true
    }

    /// The response `response_id` finished. Every call it produced that is
    /// ready moves to the pending set and is returned for dispatch; calls
    /// whose arguments never completed are dropped.
    pub fn on_response_done(
        &mut self,
        response_id: &str,
        now: Instant,
        generation: u64,
    ) -> Vec<DispatchedCall> {
        let belongs = |record: &ToolCallRecord| {
            record.response_id.as_deref().is_none_or(|id| id == response_id)
        };
        let ids: Vec<String> = self
            .active
            .values()
            .filter(|record| belongs(record))
            .map(|record| record.call_id.clone())
            .collect();

        let mut due = Vec::new();
        for call_id in ids {
            let Some(record) = self.active.remove(&call_id) else {
                continue;
            };
            if record.status != ToolCallStatus::ReadyToExecute {
                tracing::warn!(call_id, "Dropping tool call whose arguments never completed");
                self.finished.insert(call_id);
                continue;
            }
            let raw = record.arguments.unwrap_or_default();
            let arguments = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            self.pending.insert(
                call_id.clone(),
                PendingExternalCall {
                    call_id: call_id.clone(),
                    name: record.name.clone(),
                    anchor_item_id: record.anchor_item_id.clone(),
                    dispatched_at: now,
                    generation,
                    status: ToolCallStatus::Dispatched,
                },
            );
            due.push(DispatchedCall {
                call_id,
                name: record.name,
                anchor_item_id: record.anchor_item_id,
                arguments,
            });
        }
        due
    }

    /// The gateway accepted the call.
    pub fn mark_awaiting_result(&mut self, call_id: &str) {
        if let Some(call) = self.pending.get_mut(call_id) {
            call.status = ToolCallStatus::AwaitingExternalResult;
        }
    }

    /// A result arrived for `call_id`. Returns `None` for calls that are not
    /// pending, including calls already resolved.
    pub fn resolve(&mut self, call_id: &str, failed: bool) -> Option<ResolvedCall> {
        let call = self.pending.remove(call_id)?;
        self.finished.insert(call_id.to_string());
        let status = if failed {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        Some(ResolvedCall { call, status })
    }

    #[must_use]
    pub fn status(&self, call_id: &str) -> Option<ToolCallStatus> {
        self.active
            .get(call_id)
            .map(|r| r.status)
            .or_else(|| self.pending.get(call_id).map(|c| c.status))
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingExternalCall> {
        self.pending.values()
    }

    /// Drop calls from an unfinished response. Their ids stay unknown so the
    /// model may reissue them on a new connection.
    pub fn forget_unexecuted(&mut self) {
        if !self.active.is_empty() {
            tracing::debug!(count = self.active.len(), "Discarding unexecuted tool calls");
        }
        self.active.clear();
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
        self.finished.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(tracker: &mut ToolCallTracker, call_id: &str, response_id: &str) {
        tracker.on_item_created(call_id, "send_to_agent_network", "item_1");
        tracker.on_arguments(
            call_id,
            None,
            "item_1",
            Some(response_id),
            r#"{"request":"check latency"}"#.to_string(),
        );
    }

    #[test]
    fn waits_for_response_done_before_dispatch() {
        let mut tracker = ToolCallTracker::new();
        tracker.on_item_created("call_1", "send_to_agent_network", "item_1");
        assert_eq!(tracker.status("call_1"), Some(ToolCallStatus::AwaitingArguments));

        tracker.on_arguments("call_1", None, "item_1", Some("resp_1"), "{}".into());
        assert_eq!(tracker.status("call_1"), Some(ToolCallStatus::ReadyToExecute));

        let due = tracker.on_response_done("resp_1", Instant::now(), 1);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "send_to_agent_network");
        assert_eq!(due[0].anchor_item_id, "item_1");
        assert_eq!(tracker.status("call_1"), Some(ToolCallStatus::Dispatched));
        tracker.mark_awaiting_result("call_1");
        assert_eq!(tracker.status("call_1"), Some(ToolCallStatus::AwaitingExternalResult));
    }

    #[test]
    fn repeated_events_do_not_redispatch() {
        let mut tracker = ToolCallTracker::new();
        ready(&mut tracker, "call_1", "resp_1");
        assert_eq!(tracker.on_response_done("resp_1", Instant::now(), 1).len(), 1);

        ready(&mut tracker, "call_1", "resp_1");
        assert!(tracker.on_response_done("resp_1", Instant::now(), 1).is_empty());

        assert!(tracker.resolve("call_1", false).is_some());
        ready(&mut tracker, "call_1", "resp_2");
        assert!(tracker.on_response_done("resp_2", Instant::now(), 1).is_empty());
        assert!(tracker.resolve("call_1", false).is_none());
    }

    #[test]
    fn arguments_without_announcement_create_record() {
        let mut tracker = ToolCallTracker::new();
        assert!(tracker.on_arguments(
            "call_9",
            Some("send_to_agent_network"),
            "item_9",
            Some("resp_1"),
            r#"{"request":"x"}"#.into()
        ));
        let due = tracker.on_response_done("resp_1", Instant::now(), 1);
        assert_eq!(due[0].name, "send_to_agent_network");
        assert_eq!(due[0].arguments["request"], "x");
    }

    #[test]
    fn incomplete_calls_are_dropped_on_done() {
        let mut tracker = ToolCallTracker::new();
        tracker.on_item_created("call_1", "send_to_agent_network", "item_1");
        assert!(tracker.on_response_done("resp_1", Instant::now(), 1).is_empty());
        assert_eq!(tracker.status("call_1"), None);
        assert!(!tracker.on_arguments("call_1", None, "item_1", Some("resp_1"), "{}".into()));
    }

    #[test]
    fn other_response_keeps_its_calls() {
        let mut tracker = ToolCallTracker::new();
        ready(&mut tracker, "call_1", "resp_2");
        assert!(tracker.on_response_done("resp_1", Instant::now(), 1).is_empty());
        assert_eq!(tracker.on_response_done("resp_2", Instant::now(), 1).len(), 1);
    }

    #[test]
    fn resolve_reports_failure() {
        let mut tracker = ToolCallTracker::new();
        ready(&mut tracker, "call_1", "resp_1");
        tracker.on_response_done("resp_1", Instant::now(), 3);
        let resolved = tracker.resolve("call_1", true).unwrap();
        assert_eq!(resolved.status, ToolCallStatus::Failed);
        assert_eq!(resolved.call.generation, 3);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn finished_history_is_bounded() {
        let mut tracker = ToolCallTracker::with_history(2);
        for (call_id, response_id) in [("call_1", "resp_1"), ("call_2", "resp_2"), ("call_3", "resp_3")] {
            ready(&mut tracker, call_id, response_id);
            tracker.on_response_done(response_id, Instant::now(), 1);
            assert!(tracker.resolve(call_id, false).is_some());
        }
        assert_eq!(tracker.finished.order.len(), 2);
        assert_eq!(tracker.finished.ids.len(), 2);

        // the two most recent ids are still refused
        assert!(!tracker.on_item_created("call_3", "send_to_agent_network", "item_1"));
        assert!(!tracker.on_item_created("call_2", "send_to_agent_network", "item_1"));
        // the oldest has been forgotten
        assert!(tracker.on_item_created("call_1", "send_to_agent_network", "item_1"));
    }

    #[test]
    fn unparsable_arguments_pass_through_as_string() {
        let mut tracker = ToolCallTracker::new();
        tracker.on_arguments("call_1", Some("t"), "item_1", None, "not json".into());
        let due = tracker.on_response_done("resp_1", Instant::now(), 1);
        assert_eq!(due[0].arguments, Value::String("not json".into()));
    }
}
