//! Durable background-task store — the `bg_dispatch` / `bg_status` /
//! `bg_collect` tool trio dispatches into here.
//!
//! Distinct from [`crate::runtime::tasks::TaskStore`]: that store tracks
//! the concurrent HTTP task queue (ephemeral, in-memory — "runs are the
//! durable record"). Background tasks ARE the durable record for
//! fire-and-poll child work, including work that outlives the process
//! (detached subprocess bridges, see [`crate::runtime::bridge`]).
//!
//! Persisted as JSONL, one line per task, rewritten wholesale on load to
//! drop stale-but-terminal entries — same shape as [`crate::runtime::runs::RunStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// `(status, priority, created_at)` is the store's primary access pattern
/// per the background-task contract — `list()` below filters/sorts on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundTaskStatus {
    Pending,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl BackgroundTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackgroundTaskStatus::Completed
                | BackgroundTaskStatus::Failed
                | BackgroundTaskStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub task_id: String,
    pub agent_kind: String,
    pub prompt: String,
    pub parent_session_key: Option<String>,
    pub status: BackgroundTaskStatus,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// CAS token: whoever holds the matching owner id may transition the
    /// task. `None` means unclaimed.
    pub lease_owner: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    /// Output directory for a detached-subprocess bridge, if any.
    pub bridge_dir: Option<PathBuf>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl BackgroundTask {
    fn new(task_id: String, agent_kind: String, prompt: String, parent_session_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            agent_kind,
            prompt,
            parent_session_key,
            status: BackgroundTaskStatus::Pending,
            priority: 0,
            created_at: now,
            updated_at: now,
            lease_owner: None,
            lease_until: None,
            bridge_dir: None,
            output: None,
            error: None,
        }
    }
}

const DEFAULT_LEASE_SECS: i64 = 30 * 60;

struct Inner {
    tasks: HashMap<String, BackgroundTask>,
}

pub struct BackgroundTaskStore {
    inner: RwLock<Inner>,
    log_path: PathBuf,
}

impl BackgroundTaskStore {
    pub fn new(state_path: &Path) -> Self {
        let dir = state_path.join("background_tasks");
        std::fs::create_dir_all(&dir).ok();
        let log_path = dir.join("tasks.jsonl");
        let tasks = Self::load(&log_path);
        Self {
            inner: RwLock::new(Inner { tasks }),
            log_path,
        }
    }

    fn load(log_path: &Path) -> HashMap<String, BackgroundTask> {
        let mut tasks = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(log_path) {
            for line in content.lines() {
                if let Ok(task) = serde_json::from_str::<BackgroundTask>(line) {
                    tasks.insert(task.task_id.clone(), task);
                }
            }
        }
        tasks
    }

    fn persist_locked(&self, inner: &Inner) {
        let mut buf = String::new();
        for task in inner.tasks.values() {
            if let Ok(line) = serde_json::to_string(task) {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        if let Err(e) = std::fs::write(&self.log_path, buf) {
            tracing::warn!(error = %e, "failed to persist background task store");
        }
    }

    /// Auto-generate a stable id from the prompt when none is supplied —
    /// first 40 chars, slugified, plus a short random suffix so repeated
    /// identical prompts don't collide.
    fn derive_task_id(prompt: &str) -> String {
        let slug: String = prompt
            .chars()
            .take(40)
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        let slug = slug.trim_matches('-');
        format!("{slug}-{}", &uuid::Uuid::new_v4().to_string()[..8])
    }

    pub fn dispatch(
        &self,
        task_id: Option<String>,
        agent_kind: String,
        prompt: String,
        parent_session_key: Option<String>,
    ) -> BackgroundTask {
        let task_id = task_id.unwrap_or_else(|| Self::derive_task_id(&prompt));
        let task = BackgroundTask::new(task_id.clone(), agent_kind, prompt, parent_session_key);

        let mut inner = self.inner.write();
        inner.tasks.insert(task_id, task.clone());
        self.persist_locked(&inner);
        task
    }

    pub fn get(&self, task_id: &str) -> Option<BackgroundTask> {
        self.inner.read().tasks.get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<BackgroundTask> {
        let inner = self.inner.read();
        let mut tasks: Vec<_> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    pub fn list_by_status(&self, status: BackgroundTaskStatus) -> Vec<BackgroundTask> {
        self.list().into_iter().filter(|t| t.status == status).collect()
    }

    /// Claim an unleased (or lease-expired) pending task via compare-and-set
    /// on `lease_owner`. Returns `None` if no claimable task matches, or if
    /// a concurrent claim won the race.
    pub fn claim_next(&self, owner: &str) -> Option<BackgroundTask> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let candidate_id = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == BackgroundTaskStatus::Pending
                    && (t.lease_owner.is_none() || t.lease_until.map(|u| u < now).unwrap_or(true))
            })
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.created_at.cmp(&a.created_at)))
            .map(|t| t.task_id.clone())?;

        let task = inner.tasks.get_mut(&candidate_id)?;
        task.lease_owner = Some(owner.to_string());
        task.lease_until = Some(now + chrono::Duration::seconds(DEFAULT_LEASE_SECS));
        task.status = BackgroundTaskStatus::Running;
        task.updated_at = now;
        let result = task.clone();
        self.persist_locked(&inner);
        Some(result)
    }

    /// Release a lease: the caller must present the owner token it claimed
    /// with, otherwise the update is rejected (lost the race to a
    /// reclaim after the lease expired).
    pub fn finish(
        &self,
        task_id: &str,
        owner: &str,
        status: BackgroundTaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> bool {
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return false;
        };
        if task.lease_owner.as_deref() != Some(owner) {
            return false;
        }
        task.status = status;
        task.output = output;
        task.error = error;
        task.lease_owner = None;
        task.lease_until = None;
        task.updated_at = Utc::now();
        self.persist_locked(&inner);
        true
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = BackgroundTaskStatus::Cancelled;
        task.lease_owner = None;
        task.updated_at = Utc::now();
        self.persist_locked(&inner);
        true
    }

    pub fn set_bridge_dir(&self, task_id: &str, dir: PathBuf) {
        let mut inner = self.inner.write();
        if let Some(task) = inner.tasks.get_mut(task_id) {
            task.bridge_dir = Some(dir);
            task.updated_at = Utc::now();
        }
        self.persist_locked(&inner);
    }
}

pub type SharedBackgroundTaskStore = Arc<BackgroundTaskStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, BackgroundTaskStore) {
        let dir = tempdir().unwrap();
        let store = BackgroundTaskStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn dispatch_generates_id_from_prompt_when_absent() {
        let (_d, store) = store();
        let task = store.dispatch(None, "coder".into(), "fix the flaky test".into(), None);
        assert!(task.task_id.starts_with("fix-the-flaky-test-"));
        assert_eq!(task.status, BackgroundTaskStatus::Pending);
    }

    #[test]
    fn claim_is_compare_and_set() {
        let (_d, store) = store();
        let task = store.dispatch(Some("t1".into()), "coder".into(), "p".into(), None);
        assert_eq!(task.task_id, "t1");

        let claimed = store.claim_next("worker-a").unwrap();
        assert_eq!(claimed.lease_owner.as_deref(), Some("worker-a"));
        assert_eq!(claimed.status, BackgroundTaskStatus::Running);

        // Second claim attempt finds nothing claimable.
        assert!(store.claim_next("worker-b").is_none());
    }

    #[test]
    fn finish_rejects_wrong_owner() {
        let (_d, store) = store();
        store.dispatch(Some("t1".into()), "coder".into(), "p".into(), None);
        store.claim_next("worker-a").unwrap();

        assert!(!store.finish("t1", "worker-b", BackgroundTaskStatus::Completed, None, None));
        assert!(store.finish("t1", "worker-a", BackgroundTaskStatus::Completed, Some("done".into()), None));

        let task = store.get("t1").unwrap();
        assert_eq!(task.status, BackgroundTaskStatus::Completed);
        assert_eq!(task.output.as_deref(), Some("done"));
        assert!(task.lease_owner.is_none());
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let (_d, store) = store();
        store.dispatch(Some("t1".into()), "coder".into(), "p".into(), None);
        {
            let mut inner = store.inner.write();
            let task = inner.tasks.get_mut("t1").unwrap();
            task.lease_owner = Some("stale-worker".into());
            task.lease_until = Some(Utc::now() - chrono::Duration::seconds(1));
            task.status = BackgroundTaskStatus::Pending;
        }
        let claimed = store.claim_next("worker-fresh").unwrap();
        assert_eq!(claimed.lease_owner.as_deref(), Some("worker-fresh"));
    }

    #[test]
    fn cancel_refuses_terminal_tasks() {
        let (_d, store) = store();
        store.dispatch(Some("t1".into()), "coder".into(), "p".into(), None);
        store.claim_next("w").unwrap();
        store.finish("t1", "w", BackgroundTaskStatus::Completed, None, None);
        assert!(!store.cancel("t1"));
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempdir().unwrap();
        {
            let store = BackgroundTaskStore::new(dir.path());
            store.dispatch(Some("t1".into()), "coder".into(), "p".into(), None);
        }
        let reloaded = BackgroundTaskStore::new(dir.path());
        assert!(reloaded.get("t1").is_some());
    }
}
