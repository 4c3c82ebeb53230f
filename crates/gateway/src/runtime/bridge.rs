//! Detached subprocess bridge — "external coding agents" that survive the
//! gateway process dying.
//!
//! A bridge task is spawned as a session leader (so killing the gateway's
//! process group does not kill it) and writes its progress to
//! `{work_dir}/.elephant/bridge/{task_id}/output.jsonl`, one JSON line per
//! step, followed by a `.done` sentinel file once it exits. The gateway
//! never reads the child's stdout directly — it tails the file, the same
//! way a human would with `tail -f`, which is what makes the bridge
//! survive a gateway restart: on restart we just resume tailing.
//!
//! Polling backs off 200ms → 2s while idle (see [`PollBackoff`]) rather
//! than busy-looping, and resets to 200ms the moment new bytes appear.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

const BRIDGE_SUBDIR: &str = ".elephant/bridge";
const DONE_SENTINEL: &str = ".done";
const OUTPUT_FILE: &str = "output.jsonl";
const POLL_MIN: Duration = Duration::from_millis(200);
const POLL_MAX: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Running,
    Completed,
    Failed,
    Orphaned,
}

/// Disposition assigned to a bridge directory found on startup with no
/// matching in-memory record — the five classes a bridge can end up in
/// after an unclean gateway restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDisposition {
    /// Process still alive (pid in `pid` file responds to signal 0) and no
    /// `.done` sentinel yet — reattach the tailer, no process action.
    Adopt,
    /// `.done` sentinel present but its output was never collected by
    /// `bg_collect` — surface it as-is, no process action.
    Harvest,
    /// Process is dead, no `.done` sentinel, but the output file shows
    /// forward progress (non-empty, growing) — worth a fresh attempt that
    /// continues from the last recorded step rather than from scratch.
    RetryResume,
    /// Process is dead, no `.done` sentinel, output file is empty or only
    /// has a startup line — nothing to resume from, start over.
    RetryFresh,
    /// Output file missing or unreadable, pid file missing — nothing to
    /// recover, report failure upstream.
    MarkFailed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub task_id: String,
    pub work_dir: PathBuf,
    pub status: BridgeStatus,
    pub pid: Option<u32>,
    pub last_offset: u64,
}

struct PollBackoff {
    current: Duration,
}

impl PollBackoff {
    fn new() -> Self {
        Self { current: POLL_MIN }
    }

    fn grow(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(POLL_MAX);
        wait
    }

    fn reset(&mut self) {
        self.current = POLL_MIN;
    }
}

fn bridge_dir(work_dir: &Path, task_id: &str) -> PathBuf {
    work_dir.join(BRIDGE_SUBDIR).join(task_id)
}

/// Manages the lifecycle of detached bridge subprocesses: spawning,
/// tailing their output, and classifying orphans found on startup.
pub struct BridgeManager {
    records: RwLock<HashMap<String, BridgeRecord>>,
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeManager {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a detached session-leader process writing progress to
    /// `{work_dir}/.elephant/bridge/{task_id}/output.jsonl`. Returns
    /// immediately; the tailer is started separately via [`Self::tail`].
    pub async fn spawn(
        &self,
        task_id: &str,
        work_dir: &Path,
        program: &str,
        args: &[String],
    ) -> std::io::Result<BridgeRecord> {
        let dir = bridge_dir(work_dir, task_id);
        tokio::fs::create_dir_all(&dir).await?;
        let output_path = dir.join(OUTPUT_FILE);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid() detaches the child into its own session so it
        // survives the gateway's process group being signalled.
        unsafe {
            cmd.pre_exec(|| {
                if libc_setsid() != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        tokio::fs::write(dir.join("pid"), pid.map(|p| p.to_string()).unwrap_or_default()).await.ok();
        tokio::fs::write(&output_path, b"").await.ok();

        let record = BridgeRecord {
            task_id: task_id.to_string(),
            work_dir: work_dir.to_path_buf(),
            status: BridgeStatus::Running,
            pid,
            last_offset: 0,
        };
        self.records.write().insert(task_id.to_string(), record.clone());
        Ok(record)
    }

    /// Tail a bridge's output file until the `.done` sentinel appears,
    /// invoking `on_line` for each new JSONL line. Backs off from 200ms to
    /// 2s while idle; resets on every line read.
    pub async fn tail(&self, task_id: &str, mut on_line: impl FnMut(&str)) -> BridgeStatus {
        let Some(record) = self.records.read().get(task_id).cloned() else {
            return BridgeStatus::Orphaned;
        };
        let dir = bridge_dir(&record.work_dir, task_id);
        let output_path = dir.join(OUTPUT_FILE);
        let done_path = dir.join(DONE_SENTINEL);

        let mut offset = record.last_offset;
        let mut backoff = PollBackoff::new();

        loop {
            let read_more = read_new_lines(&output_path, offset).await;
            if let Ok((new_offset, lines)) = read_more {
                if new_offset > offset {
                    offset = new_offset;
                    backoff.reset();
                    for line in lines {
                        on_line(&line);
                    }
                    if let Some(rec) = self.records.write().get_mut(task_id) {
                        rec.last_offset = offset;
                    }
                }
            }

            if done_path.exists() {
                let status = if tokio::fs::read_to_string(&done_path)
                    .await
                    .map(|s| s.trim() == "ok")
                    .unwrap_or(true)
                {
                    BridgeStatus::Completed
                } else {
                    BridgeStatus::Failed
                };
                if let Some(rec) = self.records.write().get_mut(task_id) {
                    rec.status = status;
                }
                return status;
            }

            tokio::time::sleep(backoff.grow()).await;
        }
    }

    /// Scan `{work_dir}/.elephant/bridge/*` for directories with no
    /// matching in-memory record (i.e. left behind by a previous gateway
    /// process) and classify each into one of the five dispositions.
    pub async fn recover_orphans(&self, work_dir: &Path) -> Vec<(String, OrphanDisposition)> {
        let root = work_dir.join(BRIDGE_SUBDIR);
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if !file_type.is_dir() {
                continue;
            }
            let task_id = entry.file_name().to_string_lossy().to_string();
            if self.records.read().contains_key(&task_id) {
                continue;
            }
            let disposition = self.classify_orphan(&entry.path()).await;
            out.push((task_id, disposition));
        }
        out
    }

    async fn classify_orphan(&self, dir: &Path) -> OrphanDisposition {
        let done_path = dir.join(DONE_SENTINEL);
        let output_path = dir.join(OUTPUT_FILE);
        let pid_path = dir.join("pid");

        let pid: Option<u32> = tokio::fs::read_to_string(&pid_path)
            .await
            .ok()
            .and_then(|s| s.trim().parse().ok());

        let output_len = tokio::fs::metadata(&output_path).await.map(|m| m.len()).unwrap_or(0);

        if done_path.exists() {
            return OrphanDisposition::Harvest;
        }

        let alive = pid.map(process_is_alive).unwrap_or(false);
        if alive {
            return OrphanDisposition::Adopt;
        }

        if pid.is_none() && output_len == 0 {
            return OrphanDisposition::MarkFailed;
        }

        if output_len > 0 {
            OrphanDisposition::RetryResume
        } else {
            OrphanDisposition::RetryFresh
        }
    }

    pub fn get(&self, task_id: &str) -> Option<BridgeRecord> {
        self.records.read().get(task_id).cloned()
    }

    pub fn list(&self) -> Vec<BridgeRecord> {
        self.records.read().values().cloned().collect()
    }
}

async fn read_new_lines(path: &Path, offset: u64) -> std::io::Result<(u64, Vec<String>)> {
    use tokio::io::AsyncSeekExt;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).await?;
    let new_offset = offset + buf.len() as u64;
    let lines = buf.lines().map(String::from).collect();
    Ok((new_offset, lines))
}

fn process_is_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence without sending a signal.
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

extern "C" {
    #[link_name = "setsid"]
    fn libc_setsid() -> i32;
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

use std::os::unix::process::CommandExt;

pub type SharedBridgeManager = Arc<BridgeManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn classify_harvest_when_done_sentinel_present() {
        let dir = tempdir().unwrap();
        let bridge_dir = dir.path().join(BRIDGE_SUBDIR).join("t1");
        tokio::fs::create_dir_all(&bridge_dir).await.unwrap();
        tokio::fs::write(bridge_dir.join(OUTPUT_FILE), b"{}\n").await.unwrap();
        tokio::fs::write(bridge_dir.join(DONE_SENTINEL), b"ok").await.unwrap();

        let mgr = BridgeManager::new();
        let found = mgr.recover_orphans(dir.path()).await;
        assert_eq!(found, vec![("t1".to_string(), OrphanDisposition::Harvest)]);
    }

    #[tokio::test]
    async fn classify_retry_fresh_when_empty_and_dead() {
        let dir = tempdir().unwrap();
        let bridge_dir = dir.path().join(BRIDGE_SUBDIR).join("t2");
        tokio::fs::create_dir_all(&bridge_dir).await.unwrap();
        tokio::fs::write(bridge_dir.join(OUTPUT_FILE), b"").await.unwrap();
        tokio::fs::write(bridge_dir.join("pid"), b"999999").await.unwrap();

        let mgr = BridgeManager::new();
        let found = mgr.recover_orphans(dir.path()).await;
        assert_eq!(found, vec![("t2".to_string(), OrphanDisposition::RetryFresh)]);
    }

    #[tokio::test]
    async fn classify_retry_resume_when_output_present_and_dead() {
        let dir = tempdir().unwrap();
        let bridge_dir = dir.path().join(BRIDGE_SUBDIR).join("t3");
        tokio::fs::create_dir_all(&bridge_dir).await.unwrap();
        tokio::fs::write(bridge_dir.join(OUTPUT_FILE), b"{\"step\":1}\n").await.unwrap();
        tokio::fs::write(bridge_dir.join("pid"), b"999999").await.unwrap();

        let mgr = BridgeManager::new();
        let found = mgr.recover_orphans(dir.path()).await;
        assert_eq!(found, vec![("t3".to_string(), OrphanDisposition::RetryResume)]);
    }

    #[tokio::test]
    async fn classify_mark_failed_when_no_pid_no_output() {
        let dir = tempdir().unwrap();
        let bridge_dir = dir.path().join(BRIDGE_SUBDIR).join("t4");
        tokio::fs::create_dir_all(&bridge_dir).await.unwrap();
        tokio::fs::write(bridge_dir.join(OUTPUT_FILE), b"").await.unwrap();

        let mgr = BridgeManager::new();
        let found = mgr.recover_orphans(dir.path()).await;
        assert_eq!(found, vec![("t4".to_string(), OrphanDisposition::MarkFailed)]);
    }

    #[test]
    fn backoff_grows_then_caps() {
        let mut b = PollBackoff::new();
        assert_eq!(b.grow(), POLL_MIN);
        assert_eq!(b.grow(), POLL_MIN * 2);
        for _ in 0..10 {
            b.grow();
        }
        assert_eq!(b.current, POLL_MAX);
    }
}
