use crate::cmd;
use crate::models::Job;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const PROCESS_POLL_INTERVAL_MS: u64 = 50;
const READ_BUF_BYTES: usize = 8192;
/// How long output may keep flowing after the process exits (grandchildren holding the pipes).
const READER_DRAIN_TIMEOUT_MS: u64 = 2_000;

/// Exit code reported when no OS exit code exists (not started, or killed by a signal).
pub const SENTINEL_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Normal,
    /// Signal, crash, or a process that never got to run.
    Abnormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessErrorKind {
    FailedToStart,
    WaitFailed,
    Unknown,
}

impl ProcessErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessErrorKind::FailedToStart => "FailedToStart",
            ProcessErrorKind::WaitFailed => "WaitFailed",
            ProcessErrorKind::Unknown => "UnknownError",
        }
    }
}

/// Everything a runner (or thumbnail worker) reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started {
        job_id: String,
    },
    Output {
        job_id: String,
        text: String,
    },
    Finished {
        job_id: String,
        exit_code: i32,
        exit_kind: ExitKind,
    },
    ProcessError {
        job_id: String,
        kind: ProcessErrorKind,
        message: String,
    },
    ThumbnailReady {
        job_id: String,
        path: String,
    },
    ThumbnailFailed {
        job_id: String,
        reason: String,
    },
    Shutdown,
}

/// The scheduler's view of a live runner.
pub trait RunnerControl: Send {
    /// Requests forceful termination; returns whether a live process was observed.
    fn cancel(&self) -> bool;
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RunnerHandle {
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
}

impl RunnerControl for RunnerHandle {
    fn cancel(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return false;
        }
        // Still latched if the child has not spawned yet; the supervisor kills it on sight.
        self.cancel.store(true, Ordering::SeqCst);
        self.running.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// One external yt-dlp invocation bound to one job.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    pub job_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRunner {
    /// Arguments are `job.args_list ++ [job.url]`; the working dir is the job's output path.
    pub fn for_job(job: &Job, program: &str) -> Self {
        let mut args = job.args_list.clone();
        args.push(job.url.clone());
        Self {
            job_id: job.id.clone(),
            program: program.to_string(),
            args,
            cwd: job
                .output_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn command_line(&self) -> String {
        cmd::display_command_line(&self.program, &self.args)
    }

    /// Starts supervision on a background thread. Lifecycle is reported only through `events`.
    pub fn start(self, events: Sender<JobEvent>) -> std::io::Result<RunnerHandle> {
        let handle = RunnerHandle {
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
        };

        if self.program.trim().is_empty() {
            error!(job_id = %self.job_id, "download tool path is not configured");
            handle.exited.store(true, Ordering::SeqCst);
            let _ = events.send(JobEvent::Finished {
                job_id: self.job_id,
                exit_code: SENTINEL_EXIT_CODE,
                exit_kind: ExitKind::Abnormal,
            });
            return Ok(handle);
        }

        info!(job_id = %self.job_id, command = %self.command_line(), "starting process");
        let worker = handle.clone();
        let short_id: String = self.job_id.chars().take(8).collect();
        thread::Builder::new()
            .name(format!("runner-{short_id}"))
            .spawn(move || supervise(self, worker, events))?;
        Ok(handle)
    }
}

fn supervise(runner: ProcessRunner, handle: RunnerHandle, events: Sender<JobEvent>) {
    let job_id = runner.job_id.clone();
    let spawned = cmd::tool_command(&runner.program, &runner.args, runner.cwd.as_deref()).spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            error!(job_id = %job_id, "process could not start: {err}");
            handle.exited.store(true, Ordering::SeqCst);
            let _ = events.send(JobEvent::ProcessError {
                job_id,
                kind: ProcessErrorKind::FailedToStart,
                message: err.to_string(),
            });
            return;
        }
    };

    handle.running.store(true, Ordering::SeqCst);
    info!(job_id = %job_id, pid = child.id(), "process started");
    let _ = events.send(JobEvent::Started {
        job_id: job_id.clone(),
    });

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, job_id.clone(), events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, job_id.clone(), events.clone()));
    }

    let mut killed = false;
    let outcome = loop {
        if !killed && handle.cancel.load(Ordering::SeqCst) {
            info!(job_id = %job_id, "killing process");
            kill_child_process_tree(&mut child);
            killed = true;
        }
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => thread::sleep(Duration::from_millis(PROCESS_POLL_INTERVAL_MS)),
            Err(err) => {
                kill_child_process_tree(&mut child);
                break Err(err);
            }
        }
    };

    // Drain remaining output before the terminal event.
    drain_readers(readers, &job_id);
    handle.running.store(false, Ordering::SeqCst);
    handle.exited.store(true, Ordering::SeqCst);

    match outcome {
        Ok(status) => {
            let (exit_code, exit_kind) = classify_exit(&status);
            info!(job_id = %job_id, exit_code, ?exit_kind, "process finished");
            let _ = events.send(JobEvent::Finished {
                job_id,
                exit_code,
                exit_kind,
            });
        }
        Err(err) => {
            error!(job_id = %job_id, "waiting on process failed: {err}");
            let _ = events.send(JobEvent::ProcessError {
                job_id,
                kind: ProcessErrorKind::WaitFailed,
                message: err.to_string(),
            });
        }
    }
}

fn spawn_reader<R>(mut source: R, job_id: String, events: Sender<JobEvent>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0_u8; READ_BUF_BYTES];
        let mut decoder = Utf8Chunker::default();
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    if !text.is_empty()
                        && events
                            .send(JobEvent::Output {
                                job_id: job_id.clone(),
                                text,
                            })
                            .is_err()
                    {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(job_id = %job_id, "output stream closed: {err}");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() {
            let _ = events.send(JobEvent::Output { job_id, text: rest });
        }
    })
}

fn drain_readers(readers: Vec<thread::JoinHandle<()>>, job_id: &str) {
    let deadline = Instant::now() + Duration::from_millis(READER_DRAIN_TIMEOUT_MS);
    while readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            // Late chunks still arrive, but the scheduler drops output for inactive jobs.
            warn!(job_id = %job_id, "output pipe still open after exit; detaching reader");
        }
    }
}

fn classify_exit(status: &ExitStatus) -> (i32, ExitKind) {
    match status.code() {
        Some(code) => (code, ExitKind::Normal),
        None => (SENTINEL_EXIT_CODE, ExitKind::Abnormal),
    }
}

fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = cmd::tool_command("taskkill", ["/PID", pid.as_str(), "/T", "/F"], None).status();
    }

    #[cfg(unix)]
    {
        // The child leads its own group (see `cmd::tool_command`).
        let pgid = child.id() as libc::pid_t;
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }

    let _ = child.kill();
}

/// Decodes a byte stream to text, holding back a multi-byte character split across reads.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep_from = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(keep_from);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn sh_job(script: &str) -> Job {
        // `sh -c <script> <url>`: the url lands in $0 and is otherwise ignored.
        Job::new("job-url", None, vec!["-c".to_string(), script.to_string()])
    }

    fn collect_until_terminal(rx: &mpsc::Receiver<JobEvent>) -> Vec<JobEvent> {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => {
                    let done = matches!(
                        event,
                        JobEvent::Finished { .. } | JobEvent::ProcessError { .. }
                    );
                    seen.push(event);
                    if done {
                        return seen;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        panic!("runner never reported a terminal event: {seen:?}");
    }

    fn output_text(events: &[JobEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Output { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn args_are_job_args_followed_by_url() {
        let mut job = Job::new("https://x/v", Some("/dl".to_string()), vec!["-f".to_string(), "best".to_string()]);
        job.id = "id-1".to_string();
        let runner = ProcessRunner::for_job(&job, "/fake/yt-dlp");
        assert_eq!(runner.args, vec!["-f", "best", "https://x/v"]);
        assert_eq!(runner.cwd, Some(PathBuf::from("/dl")));
        assert_eq!(runner.command_line(), "/fake/yt-dlp -f best https://x/v");
    }

    #[test]
    fn empty_program_reports_abnormal_finish_without_spawning() {
        let job = Job::new("https://x/v", None, vec![]);
        let (tx, rx) = mpsc::channel();
        let handle = ProcessRunner::for_job(&job, "").start(tx).expect("start");
        assert!(!handle.is_running());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).expect("event"),
            JobEvent::Finished {
                job_id: job.id.clone(),
                exit_code: SENTINEL_EXIT_CODE,
                exit_kind: ExitKind::Abnormal,
            }
        );
        assert!(!handle.cancel());
    }

    #[test]
    fn missing_executable_reports_failed_to_start() {
        let job = Job::new("https://x/v", None, vec![]);
        let (tx, rx) = mpsc::channel();
        ProcessRunner::for_job(&job, "/definitely/not/here/yt-dlp")
            .start(tx)
            .expect("start");
        let events = collect_until_terminal(&rx);
        assert!(matches!(
            events.last(),
            Some(JobEvent::ProcessError {
                kind: ProcessErrorKind::FailedToStart,
                ..
            })
        ));
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Started { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_and_stderr_arrive_before_finish() {
        let job = sh_job("echo '[download] Destination: movie.mp4'; echo oops >&2; exit 3");
        let (tx, rx) = mpsc::channel();
        ProcessRunner::for_job(&job, "/bin/sh").start(tx).expect("start");
        let events = collect_until_terminal(&rx);

        assert!(matches!(events.first(), Some(JobEvent::Started { .. })));
        let text = output_text(&events);
        assert!(text.contains("[download] Destination: movie.mp4"));
        assert!(text.contains("oops"));
        assert_eq!(
            events.last(),
            Some(&JobEvent::Finished {
                job_id: job.id.clone(),
                exit_code: 3,
                exit_kind: ExitKind::Normal,
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn cancel_kills_a_running_process() {
        let job = sh_job("echo ready; exec sleep 30");
        let (tx, rx) = mpsc::channel();
        let handle = ProcessRunner::for_job(&job, "/bin/sh").start(tx).expect("start");

        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(handle.cancel());

        let events = collect_until_terminal(&rx);
        assert!(matches!(
            events.last(),
            Some(JobEvent::Finished {
                exit_kind: ExitKind::Abnormal,
                ..
            })
        ));
        assert!(!handle.is_running());
        assert!(!handle.cancel());
    }

    #[cfg(unix)]
    #[test]
    fn cancel_also_kills_helpers_holding_the_output_pipes() {
        // `sleep` runs as a forked child of sh, inheriting stdout/stderr.
        let job = sh_job("echo go; sleep 8; true");
        let (tx, rx) = mpsc::channel();
        let handle = ProcessRunner::for_job(&job, "/bin/sh").start(tx).expect("start");

        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let cancelled_at = Instant::now();
        assert!(handle.cancel());

        let events = collect_until_terminal(&rx);
        let elapsed = cancelled_at.elapsed();
        assert!(matches!(
            events.last(),
            Some(JobEvent::Finished {
                exit_kind: ExitKind::Abnormal,
                ..
            })
        ));
        assert!(elapsed < Duration::from_secs(4), "cancel took {elapsed:?}");
    }

    #[cfg(unix)]
    #[test]
    fn exit_is_reported_even_if_a_background_helper_keeps_the_pipes() {
        let job = sh_job("sleep 8 & echo done; exit 0");
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        ProcessRunner::for_job(&job, "/bin/sh").start(tx).expect("start");

        let events = collect_until_terminal(&rx);
        let elapsed = started.elapsed();
        assert!(output_text(&events).contains("done"));
        assert_eq!(
            events.last(),
            Some(&JobEvent::Finished {
                job_id: job.id.clone(),
                exit_code: 0,
                exit_kind: ExitKind::Normal,
            })
        );
        assert!(elapsed < Duration::from_secs(6), "finish took {elapsed:?}");
    }

    #[test]
    fn cancel_before_spawn_is_latched_until_the_child_exists() {
        let handle = RunnerHandle {
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
        };
        assert!(!handle.cancel());
        assert!(handle.cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn chunker_holds_back_split_characters() {
        let mut chunker = Utf8Chunker::default();
        let bytes = "häj".as_bytes();
        assert_eq!(chunker.push(&bytes[..2]), "h");
        assert_eq!(chunker.push(&bytes[2..]), "äj");
        assert_eq!(chunker.finish(), "");

        assert_eq!(chunker.push(&[0xff, b'a']), "\u{fffd}a");
    }
}
