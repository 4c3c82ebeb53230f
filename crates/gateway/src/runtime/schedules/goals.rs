//! Goal store port: resolves the next fire time for goal-triggered
//! schedules. Mirrors [`super::store::ScheduleStore`]'s file-backed
//! persistence style, kept separate since goals are owned externally
//! (a planning/goals feature, not schedule state itself).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single goal record as written by the goals feature: a deadline or
/// recurrence the scheduler should translate into a `next_run_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GoalRecord {
    pub goal_id: String,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Resolves goal ids to their next scheduled fire time.
#[async_trait]
pub trait GoalStore: Send + Sync {
    async fn resolve_next_fire(&self, goal_id: &str) -> Option<DateTime<Utc>>;
}

/// File-backed `GoalStore`: reads `{state_path}/goals.json`, an array of
/// [`GoalRecord`]. Re-read on every resolve so an external writer (the
/// goals feature) can update it without restarting the gateway.
pub struct FileGoalStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, GoalRecord>>,
}

impl FileGoalStore {
    pub fn new(state_path: &Path) -> Self {
        let store = Self {
            path: state_path.join("goals.json"),
            cache: RwLock::new(HashMap::new()),
        };
        store.reload();
        store
    }

    fn reload(&self) {
        let Ok(data) = std::fs::read_to_string(&self.path) else {
            return;
        };
        let Ok(records) = serde_json::from_str::<Vec<GoalRecord>>(&data) else {
            tracing::warn!(path = %self.path.display(), "goals.json present but not valid JSON");
            return;
        };
        let mut map = HashMap::new();
        for r in records {
            map.insert(r.goal_id.clone(), r);
        }
        *self.cache.write().unwrap() = map;
    }
}

#[async_trait]
impl GoalStore for FileGoalStore {
    async fn resolve_next_fire(&self, goal_id: &str) -> Option<DateTime<Utc>> {
        self.reload();
        self.cache
            .read()
            .unwrap()
            .get(goal_id)
            .filter(|r| r.active)
            .and_then(|r| r.next_fire_at)
    }
}

/// Sync interval for goal-triggered schedules (spec: every 5 minutes).
pub const GOAL_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Re-resolve `next_run_at` for every enabled, goal-triggered schedule
/// from the goal store. Schedules with no goal record (or an inactive
/// one) are left untouched — their existing `next_run_at` (from the
/// fallback cron) still governs.
pub async fn sync_goal_triggers(
    schedule_store: &super::store::ScheduleStore,
    goal_store: &dyn GoalStore,
) {
    let schedules = schedule_store.list().await;
    for schedule in schedules {
        if !schedule.enabled {
            continue;
        }
        let Some(goal_id) = schedule.goal_id.clone() else {
            continue;
        };
        if let Some(next_fire) = goal_store.resolve_next_fire(&goal_id).await {
            schedule_store
                .update(&schedule.id, |s| {
                    s.next_run_at = Some(next_fire);
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubGoalStore(Option<DateTime<Utc>>);

    #[async_trait]
    impl GoalStore for StubGoalStore {
        async fn resolve_next_fire(&self, _goal_id: &str) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    #[tokio::test]
    async fn sync_skips_non_goal_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::super::store::ScheduleStore::new(dir.path());
        let schedule = super::super::model::Schedule {
            id: uuid::Uuid::new_v4(),
            name: "cron-only".into(),
            cron: "0 * * * *".into(),
            goal_id: None,
            timezone: "UTC".into(),
            enabled: true,
            agent_id: String::new(),
            prompt_template: String::new(),
            sources: vec![],
            delivery_targets: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_id: None,
            last_run_at: None,
            next_run_at: None,
            missed_policy: Default::default(),
            max_concurrency: 1,
            timeout_ms: None,
            digest_mode: Default::default(),
            fetch_config: Default::default(),
            max_catchup_runs: 5,
            source_states: HashMap::new(),
            last_error: None,
            last_error_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_runs: 0,
        };
        let before = store.insert(schedule.clone()).await.next_run_at;

        let goals = StubGoalStore(Some(Utc::now() + chrono::Duration::hours(1)));
        sync_goal_triggers(&store, &goals).await;

        let after = store.get(&schedule.id).await.unwrap().next_run_at;
        assert_eq!(before, after, "cron-only schedules must not be touched");
    }

    #[tokio::test]
    async fn sync_applies_goal_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let store = super::super::store::ScheduleStore::new(dir.path());
        let schedule = super::super::model::Schedule {
            id: uuid::Uuid::new_v4(),
            name: "goal-driven".into(),
            cron: "*/5 * * * *".into(),
            goal_id: Some("goal-abc".into()),
            timezone: "UTC".into(),
            enabled: true,
            agent_id: String::new(),
            prompt_template: String::new(),
            sources: vec![],
            delivery_targets: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_id: None,
            last_run_at: None,
            next_run_at: None,
            missed_policy: Default::default(),
            max_concurrency: 1,
            timeout_ms: None,
            digest_mode: Default::default(),
            fetch_config: Default::default(),
            max_catchup_runs: 5,
            source_states: HashMap::new(),
            last_error: None,
            last_error_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_runs: 0,
        };
        store.insert(schedule.clone()).await;

        let target = Utc::now() + chrono::Duration::hours(2);
        let goals = StubGoalStore(Some(target));
        sync_goal_triggers(&store, &goals).await;

        let after = store.get(&schedule.id).await.unwrap().next_run_at.unwrap();
        assert_eq!(after.timestamp(), target.timestamp());
    }
}
