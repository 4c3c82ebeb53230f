//! The event envelope — every observable thing the engine does is wrapped
//! in one of these before it reaches a subscriber.
//!
//! `seq` lets subscribers detect gaps; `correlation_id` + `causation_id`
//! let a listener reconstruct the sub-agent call tree without walking the
//! session store. `event_id` and `seq` are deliberately separate: dedup
//! cares about `event_id`, ordering cares about `seq`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where in the call tree this run sits. Only two levels exist — a
/// sub-agent never spawns a grandchild the engine tracks as `subagent` of
/// `subagent`; nested delegation still reports `subagent` at every depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLevel {
    Core,
    Subagent,
}

/// The closed set of event types a subscriber can see. Anything not in
/// this list is an internal diagnostic and is never forwarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "workflow.input.received")]
    InputReceived,
    #[serde(rename = "workflow.node.started")]
    NodeStarted,
    #[serde(rename = "workflow.node.output.delta")]
    NodeOutputDelta,
    #[serde(rename = "workflow.node.output.summary")]
    NodeOutputSummary,
    #[serde(rename = "workflow.node.completed")]
    NodeCompleted,
    #[serde(rename = "workflow.tool.started")]
    ToolStarted,
    #[serde(rename = "workflow.tool.progress")]
    ToolProgress,
    #[serde(rename = "workflow.tool.completed")]
    ToolCompleted,
    #[serde(rename = "workflow.result.final")]
    ResultFinal,
    #[serde(rename = "workflow.result.cancelled")]
    ResultCancelled,
    #[serde(rename = "workflow.error")]
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InputReceived => "workflow.input.received",
            EventType::NodeStarted => "workflow.node.started",
            EventType::NodeOutputDelta => "workflow.node.output.delta",
            EventType::NodeOutputSummary => "workflow.node.output.summary",
            EventType::NodeCompleted => "workflow.node.completed",
            EventType::ToolStarted => "workflow.tool.started",
            EventType::ToolProgress => "workflow.tool.progress",
            EventType::ToolCompleted => "workflow.tool.completed",
            EventType::ResultFinal => "workflow.result.final",
            EventType::ResultCancelled => "workflow.result.cancelled",
            EventType::Error => "workflow.error",
        }
    }

    /// Whether this type is retained in the replay-able history store.
    /// All public types are; the allowlist exists so an internal-only
    /// variant added later doesn't silently start getting persisted.
    pub fn is_replayable(&self) -> bool {
        true
    }
}

/// A typed, immutable record of something the engine did. Once emitted,
/// an `Event` is never mutated — corrections are new events, not patches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    /// Per-run monotonic counter, starting at 1. Strictly increasing for
    /// a given `run_id` regardless of which task emitted it.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub run_id: Uuid,
    /// Empty for the root run of a causal chain.
    pub parent_run_id: Option<Uuid>,
    /// Root run_id of the causal chain this event belongs to.
    pub correlation_id: Uuid,
    /// The tool-call id (or other originating id) that caused this run to
    /// exist. `None` at the root.
    pub causation_id: Option<String>,
    pub agent_level: AgentLevel,
    pub payload: serde_json::Value,
}

/// Builds events for a single run, handing out strictly increasing `seq`
/// values. One builder per run; cloning the builder does NOT give a
/// second independent counter — it shares the same atomic so sub-agent
/// forwarders stamping events on the parent's behalf don't race.
pub struct EventBuilder {
    session_id: String,
    run_id: Uuid,
    parent_run_id: Option<Uuid>,
    correlation_id: Uuid,
    causation_id: Option<String>,
    agent_level: AgentLevel,
    seq: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl EventBuilder {
    pub fn root(session_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            session_id: session_id.into(),
            run_id,
            parent_run_id: None,
            correlation_id: run_id,
            causation_id: None,
            agent_level: AgentLevel::Core,
            seq: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Build a child builder for a sub-agent run. `causation_id` is the
    /// id of the tool call that spawned it; `correlation_id` is inherited
    /// unchanged from the parent so the whole tree shares one root id.
    pub fn child(
        &self,
        session_id: impl Into<String>,
        child_run_id: Uuid,
        causation_id: impl Into<String>,
    ) -> Self {
        Self::child_of(self.run_id, self.correlation_id, session_id, child_run_id, causation_id)
    }

    /// Build a child builder from a parent's `run_id`/`correlation_id`
    /// alone, for call sites that only carry those ids across an await
    /// boundary rather than the parent `EventBuilder` itself.
    pub fn child_of(
        parent_run_id: Uuid,
        correlation_id: Uuid,
        session_id: impl Into<String>,
        child_run_id: Uuid,
        causation_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            run_id: child_run_id,
            parent_run_id: Some(parent_run_id),
            correlation_id,
            causation_id: Some(causation_id.into()),
            agent_level: AgentLevel::Subagent,
            seq: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn build(&self, event_type: EventType, payload: serde_json::Value) -> Event {
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        Event {
            event_id: Uuid::new_v4(),
            event_type,
            seq,
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id.clone(),
            agent_level: self.agent_level,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_builder_correlation_equals_run_id() {
        let run_id = Uuid::new_v4();
        let b = EventBuilder::root("s1", run_id);
        let e = b.build(EventType::InputReceived, serde_json::json!({}));
        assert_eq!(e.correlation_id, run_id);
        assert_eq!(e.parent_run_id, None);
        assert_eq!(e.agent_level, AgentLevel::Core);
        assert_eq!(e.seq, 1);
    }

    #[test]
    fn seq_is_strictly_monotonic() {
        let b = EventBuilder::root("s1", Uuid::new_v4());
        let e1 = b.build(EventType::NodeStarted, serde_json::json!({}));
        let e2 = b.build(EventType::NodeCompleted, serde_json::json!({}));
        assert!(e1.seq < e2.seq);
    }

    #[test]
    fn child_inherits_correlation_and_sets_causation() {
        let parent_run = Uuid::new_v4();
        let parent = EventBuilder::root("s1", parent_run);
        let child_run = Uuid::new_v4();
        let child = parent.child("s1", child_run, "call_abc");
        let e = child.build(EventType::ResultFinal, serde_json::json!({}));
        assert_eq!(e.correlation_id, parent.correlation_id());
        assert_eq!(e.parent_run_id, Some(parent_run));
        assert_eq!(e.causation_id.as_deref(), Some("call_abc"));
        assert_eq!(e.agent_level, AgentLevel::Subagent);
    }

    #[test]
    fn event_ids_are_unique() {
        let b = EventBuilder::root("s1", Uuid::new_v4());
        let e1 = b.build(EventType::NodeStarted, serde_json::json!({}));
        let e2 = b.build(EventType::NodeStarted, serde_json::json!({}));
        assert_ne!(e1.event_id, e2.event_id);
    }

    #[test]
    fn event_type_strings_match_closed_set() {
        assert_eq!(EventType::InputReceived.as_str(), "workflow.input.received");
        assert_eq!(EventType::ToolCompleted.as_str(), "workflow.tool.completed");
        assert_eq!(EventType::ResultCancelled.as_str(), "workflow.result.cancelled");
    }
}
