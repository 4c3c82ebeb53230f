//! Per-tool circuit breaker.
//!
//! Wraps each tool dispatch with a simple closed/open/half-open breaker:
//! consecutive failures past a threshold open the circuit for a cooldown
//! window, during which calls are short-circuited with a degraded response
//! instead of hitting the tool. After the cooldown a single probe call is
//! let through (half-open); success closes the circuit, failure re-opens it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Failures in a row before a tool's circuit opens.
const FAILURE_THRESHOLD: u32 = 5;
/// How long the circuit stays open before a probe is allowed through.
const COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

/// Tracks breaker state per tool name.
pub struct ToolBreaker {
    tools: Mutex<HashMap<String, State>>,
}

impl Default for ToolBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBreaker {
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a call to `tool_name` should be let through right now.
    ///
    /// Transitions `Open` -> `HalfOpen` once the cooldown has elapsed, and
    /// treats an unseen tool as closed.
    pub fn allow(&self, tool_name: &str) -> bool {
        let mut tools = self.tools.lock();
        match tools.get(tool_name).copied() {
            None | Some(State::Closed { .. }) | Some(State::HalfOpen) => true,
            Some(State::Open { opened_at }) => {
                if opened_at.elapsed() >= COOLDOWN {
                    tools.insert(tool_name.to_string(), State::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record the outcome of a call that was let through.
    pub fn record(&self, tool_name: &str, succeeded: bool) {
        let mut tools = self.tools.lock();
        let next = match (tools.get(tool_name).copied(), succeeded) {
            (_, true) => State::Closed {
                consecutive_failures: 0,
            },
            (Some(State::Closed { consecutive_failures }), false) => {
                let failures = consecutive_failures + 1;
                if failures >= FAILURE_THRESHOLD {
                    State::Open {
                        opened_at: Instant::now(),
                    }
                } else {
                    State::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            (Some(State::HalfOpen), false) => State::Open {
                opened_at: Instant::now(),
            },
            (None, false) => State::Closed {
                consecutive_failures: 1,
            },
            (Some(State::Open { opened_at }), false) => State::Open { opened_at },
        };
        tools.insert(tool_name.to_string(), next);
    }

    /// True if the breaker currently has `tool_name`'s circuit open.
    pub fn is_open(&self, tool_name: &str) -> bool {
        matches!(
            self.tools.lock().get(tool_name),
            Some(State::Open { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let b = ToolBreaker::new();
        assert!(b.allow("exec"));
        assert!(!b.is_open("exec"));
    }

    #[test]
    fn opens_after_threshold_failures() {
        let b = ToolBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            assert!(b.allow("exec"));
            b.record("exec", false);
        }
        assert!(b.is_open("exec"));
        assert!(!b.allow("exec"));
    }

    #[test]
    fn success_resets_failure_count() {
        let b = ToolBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.record("exec", false);
        }
        b.record("exec", true);
        for _ in 0..FAILURE_THRESHOLD - 1 {
            b.record("exec", false);
        }
        assert!(!b.is_open("exec"));
    }

    #[test]
    fn tools_are_independent() {
        let b = ToolBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            b.record("exec", false);
        }
        assert!(b.is_open("exec"));
        assert!(b.allow("file_read"));
        assert!(!b.is_open("file_read"));
    }
}
