#![cfg(unix)]

use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tubequeue_engine::config::{self, AppConfig};
use tubequeue_engine::jobs::{JobManager, OsLauncher};
use tubequeue_engine::models::{Job, JobStatus};
use tubequeue_engine::paths::AppPaths;
use tubequeue_engine::store;

const JOB_TIMEOUT_SECS: u64 = 20;

#[derive(Debug)]
struct SmokeFailure {
    message: String,
}

impl std::fmt::Display for SmokeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SmokeFailure {}

type SmokeResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// `/bin/sh` stands in for yt-dlp: each job runs `sh -c <script> <url>`.
fn start_manager(base: &Path, max_parallel: usize) -> SmokeResult<JobManager> {
    let paths = AppPaths::new(base.to_path_buf());
    paths.ensure_dirs()?;
    let cfg = AppConfig {
        yt_dlp_path: Some("/bin/sh".to_string()),
        max_parallel_downloads: max_parallel,
        ..AppConfig::default()
    };
    let state_path = paths.jobs_state_path();
    let manager = JobManager::start_with(
        paths,
        config::shared(cfg),
        Box::new(OsLauncher),
        Some(state_path),
        Duration::from_millis(50),
    )?;
    Ok(manager)
}

fn submit_script(manager: &JobManager, out: &Path, url: &str, script: &str) -> String {
    manager
        .submit(
            url,
            Some(out.to_string_lossy().to_string()),
            vec!["-c".to_string(), script.to_string()],
        )
        .id
}

fn wait_for_status(
    manager: &JobManager,
    job_id: &str,
    timeout: Duration,
    done: impl Fn(JobStatus) -> bool,
) -> SmokeResult<Job> {
    let started = Instant::now();
    loop {
        if started.elapsed() > timeout {
            return Err(Box::new(SmokeFailure {
                message: format!(
                    "timeout waiting for job {job_id} (last seen: {:?})",
                    manager.get_job(job_id).map(|j| j.status)
                ),
            }));
        }
        if let Some(job) = manager.get_job(job_id) {
            if done(job.status) {
                return Ok(job);
            }
        }
        sleep(Duration::from_millis(50));
    }
}

fn wait_for_job_done(manager: &JobManager, job_id: &str) -> SmokeResult<Job> {
    wait_for_status(
        manager,
        job_id,
        Duration::from_secs(JOB_TIMEOUT_SECS),
        |s| s.is_terminal() || s == JobStatus::AlreadyDownloaded,
    )
}

#[test]
fn successful_download_completes_with_parsed_output() -> SmokeResult<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = start_manager(dir.path(), 2)?;

    let script = "echo '[download]  37.0% of 1MiB'; \
                  echo '[download] Destination: movie.mp4'; \
                  echo '[download] 100% of 1MiB'; exit 0";
    let id = submit_script(&manager, dir.path(), "https://example.com/ok", script);
    let job = wait_for_job_done(&manager, &id)?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);
    assert_eq!(job.final_filename.as_deref(), Some("movie.mp4"));
    assert_eq!(job.title, "movie");
    assert!(job.log.contains("Command: /bin/sh -c"));
    assert!(manager.queue().is_empty());
    assert_eq!(manager.active_count(), 0);

    manager.shutdown();
    Ok(())
}

#[test]
fn failing_tool_is_classified_from_exit_and_log() -> SmokeResult<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = start_manager(dir.path(), 2)?;

    let already = submit_script(
        &manager,
        dir.path(),
        "https://example.com/dup",
        "echo '[download] movie.mp4 has already been downloaded'; exit 1",
    );
    let broken = submit_script(
        &manager,
        dir.path(),
        "https://example.com/bad",
        "echo 'ERROR: Unsupported URL' >&2; exit 1",
    );

    assert_eq!(
        wait_for_job_done(&manager, &already)?.status,
        JobStatus::AlreadyDownloaded
    );
    let job = wait_for_job_done(&manager, &broken)?;
    assert_eq!(job.status, JobStatus::ErrorProcess);
    assert!(job.log.contains("Unsupported URL"));

    manager.shutdown();
    Ok(())
}

#[test]
fn cancel_kills_a_running_download() -> SmokeResult<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = start_manager(dir.path(), 1)?;

    // The forked `sleep` keeps the output pipes open, like yt-dlp's ffmpeg helper.
    let id = submit_script(&manager, dir.path(), "https://example.com/slow", "echo go; sleep 30; true");
    wait_for_status(&manager, &id, Duration::from_secs(JOB_TIMEOUT_SECS), |s| {
        s == JobStatus::Running
    })?;

    let cancelled_at = Instant::now();
    manager.cancel(&id)?;
    let job = wait_for_job_done(&manager, &id)?;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(5),
        "cancel took {:?}",
        cancelled_at.elapsed()
    );
    assert_eq!(manager.active_count(), 0);

    manager.shutdown();
    Ok(())
}

#[test]
fn parallel_limit_holds_with_real_processes() -> SmokeResult<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = start_manager(dir.path(), 1)?;

    let ids: Vec<String> = (0..3)
        .map(|n| {
            submit_script(
                &manager,
                dir.path(),
                &format!("https://example.com/{n}"),
                "sleep 0.2; exit 0",
            )
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(JOB_TIMEOUT_SECS);
    while !manager.is_idle() {
        assert!(manager.active_count() <= 1);
        assert!(Instant::now() < deadline, "queue never drained");
        sleep(Duration::from_millis(20));
    }

    let history = manager.history();
    assert_eq!(history.len(), 3);
    // Newest first, so completion order is the reverse of submission.
    let finished: Vec<&str> = history.iter().rev().map(|j| j.id.as_str()).collect();
    assert_eq!(finished, ids.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(history.iter().all(|j| j.status == JobStatus::Completed));

    manager.shutdown();
    Ok(())
}

#[test]
fn interrupted_job_is_requeued_on_next_load() -> SmokeResult<()> {
    let dir = tempfile::tempdir()?;
    let mut manager = start_manager(dir.path(), 1)?;

    let id = submit_script(&manager, dir.path(), "https://example.com/long", "echo '[download]  12.0%'; exec sleep 30");
    wait_for_status(&manager, &id, Duration::from_secs(JOB_TIMEOUT_SECS), |s| {
        s == JobStatus::Running
    })?;
    manager.shutdown();

    let state = store::load_state(&AppPaths::new(dir.path().to_path_buf()).jobs_state_path());
    assert_eq!(state.queue.len(), 1);
    assert_eq!(state.queue[0].id, id);
    assert_eq!(state.queue[0].status, JobStatus::Waiting);
    assert_eq!(state.queue[0].progress, 0.0);
    assert!(state.history.is_empty());
    Ok(())
}
