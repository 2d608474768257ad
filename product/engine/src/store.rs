//! Durable queue + history snapshot and the reconciliation applied on load.

use crate::models::{Job, JobStatus};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsState {
    pub queue: Vec<Job>,
    /// Newest first.
    pub history: Vec<Job>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub requeued: usize,
    pub moved_to_history: usize,
    pub dropped_duplicates: usize,
}

/// Writes `<path>.tmp` then renames it over `path`, so a failed write keeps the old file.
pub fn export_state(path: &Path, state: &JobsState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(state)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, format!("{json}\n"))?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

pub fn import_state(path: &Path) -> Result<JobsState> {
    let bytes = std::fs::read(path)?;
    let state: JobsState = serde_json::from_slice(&bytes)?;
    Ok(state)
}

/// Never fails: a missing or unreadable file yields an empty state.
pub fn load_state(path: &Path) -> JobsState {
    match import_state(path) {
        Ok(mut state) => {
            let summary = reconcile(&mut state);
            info!(
                path = %path.display(),
                queue = state.queue.len(),
                history = state.history.len(),
                requeued = summary.requeued,
                "loaded jobs state"
            );
            state
        }
        Err(crate::EngineError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no jobs state file; starting empty");
            JobsState::default()
        }
        Err(err) => {
            warn!(path = %path.display(), "could not load jobs state, starting empty: {err}");
            JobsState::default()
        }
    }
}

/// Crash recovery for a freshly loaded state.
///
/// Non-terminal queue jobs (including ones that were mid-run when the process died)
/// go back to WAITING with progress 0. Terminal jobs found in the queue move to the
/// front of history; non-terminal jobs found in history move to the queue tail as
/// WAITING. Duplicate ids keep their first occurrence, queue before history.
pub fn reconcile(state: &mut JobsState) -> ReconcileSummary {
    let mut summary = ReconcileSummary::default();
    let mut seen: HashSet<String> = HashSet::new();

    let mut queue = Vec::with_capacity(state.queue.len());
    let mut finished = Vec::new();
    for mut job in std::mem::take(&mut state.queue) {
        if job.status.is_terminal() {
            finished.push(job);
            continue;
        }
        if !seen.insert(job.id.clone()) {
            summary.dropped_duplicates += 1;
            continue;
        }
        if job.status != JobStatus::Waiting || job.progress != 0.0 {
            summary.requeued += 1;
        }
        job.status = JobStatus::Waiting;
        job.progress = 0.0;
        queue.push(job);
    }

    let mut history = Vec::with_capacity(state.history.len() + finished.len());
    for (from_queue, mut job) in finished
        .into_iter()
        .map(|j| (true, j))
        .chain(std::mem::take(&mut state.history).into_iter().map(|j| (false, j)))
    {
        if !seen.insert(job.id.clone()) {
            summary.dropped_duplicates += 1;
            continue;
        }
        if !job.status.is_terminal() {
            summary.requeued += 1;
            job.status = JobStatus::Waiting;
            job.progress = 0.0;
            queue.push(job);
            continue;
        }
        if from_queue {
            summary.moved_to_history += 1;
        }
        history.push(job);
    }

    state.queue = queue;
    state.history = history;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(id: &str, status: JobStatus, progress: f64) -> Job {
        let mut job = Job::new(format!("https://example.com/{id}"), None, vec![]);
        job.id = id.to_string();
        job.status = status;
        job.progress = progress;
        job
    }

    #[test]
    fn export_then_import_keeps_membership_ids_and_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("jobs.json");
        let mut done = job_with("h1", JobStatus::ErrorProcess, 12.0);
        done.log_line("ERROR: unsupported url");
        done.final_filename = Some("a.mp4".to_string());
        let state = JobsState {
            queue: vec![job_with("q1", JobStatus::Waiting, 0.0), job_with("q2", JobStatus::Waiting, 0.0)],
            history: vec![done, job_with("h2", JobStatus::Completed, 100.0)],
        };

        export_state(&path, &state).expect("export");
        let loaded = import_state(&path).expect("import");

        assert_eq!(loaded, state);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_requeues_jobs_that_were_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        let state = JobsState {
            queue: vec![
                job_with("a", JobStatus::Running, 57.0),
                job_with("b", JobStatus::Cancelling, 3.0),
                job_with("c", JobStatus::Waiting, 0.0),
            ],
            history: vec![],
        };
        export_state(&path, &state).expect("export");

        let loaded = load_state(&path);
        let ids: Vec<&str> = loaded.queue.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        for job in &loaded.queue {
            assert_eq!(job.status, JobStatus::Waiting);
            assert_eq!(job.progress, 0.0);
        }
    }

    #[test]
    fn terminal_jobs_in_queue_move_to_history_front_and_duplicates_drop() {
        let mut state = JobsState {
            queue: vec![
                job_with("a", JobStatus::Completed, 100.0),
                job_with("b", JobStatus::Starting, 0.0),
                job_with("b", JobStatus::Waiting, 0.0),
            ],
            history: vec![
                job_with("old", JobStatus::Cancelled, 0.0),
                job_with("b", JobStatus::ErrorCrash, 0.0),
            ],
        };

        let summary = reconcile(&mut state);

        assert_eq!(
            summary,
            ReconcileSummary {
                requeued: 1,
                moved_to_history: 1,
                dropped_duplicates: 2,
            }
        );
        let queue: Vec<&str> = state.queue.iter().map(|j| j.id.as_str()).collect();
        let history: Vec<&str> = state.history.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(queue, vec!["b"]);
        assert_eq!(history, vec!["a", "old"]);
    }

    #[test]
    fn missing_or_malformed_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        assert_eq!(load_state(&path), JobsState::default());

        std::fs::write(&path, "{\"queue\": [oops").expect("write");
        assert_eq!(load_state(&path), JobsState::default());
        assert!(import_state(&path).is_err());
    }

    #[test]
    fn legacy_file_with_prefixed_status_and_unknown_fields_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"{
  "queue": [{"id": "x", "url": "https://e/x", "status": "STATUS_RUNNING", "progress": 40.0, "color": "red"}],
  "history": [{"id": "y", "url": "https://e/y", "status": "STATUS_ALREADY_DOWNLOADED"},
              {"id": "z", "status": "NOT_A_STATUS"}],
  "version": 2
}"#,
        )
        .expect("write");

        let state = load_state(&path);
        let queue: Vec<&str> = state.queue.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(queue, vec!["x", "z"]);
        assert!(state.queue.iter().all(|j| j.status == JobStatus::Waiting && j.progress == 0.0));
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].status, JobStatus::AlreadyDownloaded);
    }

    #[test]
    fn unfinished_job_found_in_history_returns_to_queue_tail() {
        let mut state = JobsState {
            queue: vec![job_with("q", JobStatus::Waiting, 0.0)],
            history: vec![
                job_with("done", JobStatus::Completed, 100.0),
                job_with("stray", JobStatus::Running, 30.0),
            ],
        };

        let summary = reconcile(&mut state);

        assert_eq!(summary.requeued, 1);
        let queue: Vec<&str> = state.queue.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(queue, vec!["q", "stray"]);
        assert_eq!(state.queue[1].status, JobStatus::Waiting);
        assert_eq!(state.queue[1].progress, 0.0);
        let history: Vec<&str> = state.history.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(history, vec!["done"]);
    }
}
