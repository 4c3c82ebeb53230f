//! Event pipeline — per-run serialized fan-out to session-scoped
//! subscribers, plus replay of persisted history.
//!
//! `OnEvent` is called from the engine's hot path and must never block it;
//! delivery to subscribers happens on `tokio::sync::broadcast` channels,
//! which are non-blocking for the sender (a slow subscriber just lags and
//! is told so via `RecvError::Lagged`, it never backpressures the engine).
//!
//! Ordering within one run is guaranteed by construction: the engine
//! calls `on_event` sequentially within a single run's iteration loop (see
//! [`crate::runtime::turn`]), so events reach this module already in
//! `seq` order; `on_event` only has to preserve that order through to
//! each subscriber, which a broadcast channel does.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::event::Event;

const SUBSCRIBER_BUFFER: usize = 100;
const MAX_TRACKED_SESSIONS: usize = 2048;
const SESSION_TTL: Duration = Duration::from_secs(30 * 60);

/// Replay mode for [`Broadcaster::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayMode {
    /// Persisted history for the session, oldest first, then live tail.
    Full,
    /// Same as `Full` — kept as a distinct variant so callers can later
    /// scope "session" replay (all runs) apart from "run" replay without
    /// an API break.
    Session,
    /// No replay — live events only.
    None,
}

struct SessionChannel {
    tx: broadcast::Sender<Event>,
    last_touched: Instant,
}

/// A bounded, age-ordered history buffer per session used to serve
/// replay. Persistence to a durable store is a separate concern (the
/// event history store, §6.3); this in-memory tail covers reconnects
/// within the retention window without a store round-trip.
struct History {
    events: Vec<Event>,
    cap: usize,
}

impl History {
    fn new(cap: usize) -> Self {
        Self { events: Vec::new(), cap }
    }

    fn push(&mut self, e: Event) {
        self.events.push(e);
        if self.events.len() > self.cap {
            let excess = self.events.len() - self.cap;
            self.events.drain(0..excess);
        }
    }
}

/// Per-session broadcaster state: a live channel plus a bounded replay
/// history.
struct SessionState {
    channel: SessionChannel,
    history: History,
}

pub struct Broadcaster {
    sessions: Mutex<HashMap<String, SessionState>>,
    history_cap_per_session: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_cap_per_session: 500,
        }
    }

    /// Record an event. Never blocks: broadcast sends are fire-and-forget
    /// (a `SendError` just means there were zero subscribers, which is
    /// not an error condition here).
    pub fn on_event(&self, event: Event) {
        let mut sessions = self.sessions.lock();
        self.evict_stale_locked(&mut sessions);

        let state = sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionState {
                channel: SessionChannel {
                    tx: broadcast::channel(SUBSCRIBER_BUFFER).0,
                    last_touched: Instant::now(),
                },
                history: History::new(self.history_cap_per_session),
            });

        state.channel.last_touched = Instant::now();
        state.history.push(event.clone());
        // A full ring buffer with no subscribers yields Err(SendError); expected.
        let _ = state.channel.tx.send(event);
    }

    /// Subscribe to a session's events. When `replay` is not `None`, the
    /// caller should first drain [`Subscription::replay`] before reading
    /// live events from [`Subscription::receiver`] — events produced
    /// between snapshotting history and subscribing the receiver are
    /// deduped by `event_id` by the caller (SSE handlers track seen ids
    /// for the reconnect window).
    pub fn subscribe(&self, session_id: &str, replay: ReplayMode) -> Subscription {
        let mut sessions = self.sessions.lock();
        self.evict_stale_locked(&mut sessions);

        let state = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState {
                channel: SessionChannel {
                    tx: broadcast::channel(SUBSCRIBER_BUFFER).0,
                    last_touched: Instant::now(),
                },
                history: History::new(self.history_cap_per_session),
            });
        state.channel.last_touched = Instant::now();

        let replay_events = match replay {
            ReplayMode::None => Vec::new(),
            ReplayMode::Full | ReplayMode::Session => state.history.events.clone(),
        };

        Subscription {
            replay: replay_events,
            receiver: state.channel.tx.subscribe(),
        }
    }

    /// Bounded-map eviction: drop sessions untouched for longer than
    /// `SESSION_TTL`, and if still over capacity, drop the oldest-touched
    /// until back under `MAX_TRACKED_SESSIONS`. Abandoned sessions must
    /// not leak memory.
    fn evict_stale_locked(&self, sessions: &mut HashMap<String, SessionState>) {
        let now = Instant::now();
        sessions.retain(|_, s| now.duration_since(s.channel.last_touched) < SESSION_TTL);

        if sessions.len() > MAX_TRACKED_SESSIONS {
            let mut by_age: Vec<(String, Instant)> = sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.channel.last_touched))
                .collect();
            by_age.sort_by_key(|(_, t)| *t);
            let overflow = sessions.len() - MAX_TRACKED_SESSIONS;
            for (key, _) in by_age.into_iter().take(overflow) {
                sessions.remove(&key);
            }
        }
    }

    pub fn tracked_session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// A live subscription: a replay batch (possibly empty) plus a receiver
/// for events emitted after the subscription was established.
pub struct Subscription {
    pub replay: Vec<Event>,
    pub receiver: broadcast::Receiver<Event>,
}

/// Merge a replay batch with a live receiver into a single ordered,
/// `event_id`-deduplicated stream. Used by SSE handlers.
pub async fn drain_deduped(
    mut sub: Subscription,
    mut on_event: impl FnMut(Event),
) {
    let mut seen: std::collections::HashSet<Uuid> = std::collections::HashSet::new();
    for e in sub.replay.drain(..) {
        if seen.insert(e.event_id) {
            on_event(e);
        }
    }
    loop {
        match sub.receiver.recv().await {
            Ok(e) => {
                if seen.insert(e.event_id) {
                    on_event(e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub type SharedBroadcaster = Arc<Broadcaster>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event::{EventBuilder, EventType};

    fn ev(builder: &EventBuilder, t: EventType) -> Event {
        builder.build(t, serde_json::json!({}))
    }

    #[tokio::test]
    async fn subscribe_receives_live_events() {
        let b = Broadcaster::new();
        let sub = b.subscribe("s1", ReplayMode::None);
        let builder = EventBuilder::root("s1", Uuid::new_v4());
        b.on_event(ev(&builder, EventType::InputReceived));

        let mut rx = sub.receiver;
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::InputReceived);
    }

    #[tokio::test]
    async fn replay_full_returns_persisted_then_live_no_dupes() {
        let b = Broadcaster::new();
        let builder = EventBuilder::root("s1", Uuid::new_v4());
        b.on_event(ev(&builder, EventType::InputReceived));
        b.on_event(ev(&builder, EventType::NodeStarted));

        let sub = b.subscribe("s1", ReplayMode::Full);
        assert_eq!(sub.replay.len(), 2);

        let seen: std::sync::Arc<Mutex<Vec<EventType>>> = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        b.on_event(ev(&builder, EventType::ResultFinal));

        // Manually emulate the SSE handler's dedup/merge without blocking forever.
        let mut ids = std::collections::HashSet::new();
        for e in &sub.replay {
            ids.insert(e.event_id);
            seen2.lock().push(e.event_type);
        }
        let mut rx = sub.receiver;
        if let Ok(e) = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
            let e = e.unwrap();
            if ids.insert(e.event_id) {
                seen2.lock().push(e.event_type);
            }
        }
        assert_eq!(
            *seen.lock(),
            vec![EventType::InputReceived, EventType::NodeStarted, EventType::ResultFinal]
        );
    }

    #[tokio::test]
    async fn isolated_sessions_do_not_cross_talk() {
        let b = Broadcaster::new();
        let sub_a = b.subscribe("a", ReplayMode::None);
        let _sub_b = b.subscribe("b", ReplayMode::None);

        let builder_b = EventBuilder::root("b", Uuid::new_v4());
        b.on_event(ev(&builder_b, EventType::InputReceived));

        let mut rx_a = sub_a.receiver;
        let res = tokio::time::timeout(Duration::from_millis(30), rx_a.recv()).await;
        assert!(res.is_err(), "session a must not see session b's events");
    }
}
