use crate::config::{self, AppConfig, SharedConfig};
use crate::models::{Job, JobStatus};
use crate::output_rules::{self, ALREADY_DOWNLOADED_MARKER};
use crate::paths::AppPaths;
use crate::runner::{ExitKind, JobEvent, ProcessErrorKind, ProcessRunner, RunnerControl};
use crate::store::{self, JobsState};
use crate::thumbnail::{self, ThumbnailRequest};
use crate::{EngineError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const ADMISSION_TICK_INTERVAL_MS: u64 = 1000;

/// Outbound change notifications, fired after every committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    QueueChanged,
    HistoryChanged,
    JobUpdated(String),
    ActiveCountChanged(usize),
}

/// Seam between the scheduler and the OS.
pub trait ProcessLauncher: Send {
    fn start_download(
        &self,
        runner: ProcessRunner,
        events: Sender<JobEvent>,
    ) -> std::io::Result<Box<dyn RunnerControl>>;

    fn start_thumbnail(
        &self,
        request: ThumbnailRequest,
        events: Sender<JobEvent>,
    ) -> std::io::Result<()>;
}

/// Spawns real yt-dlp / ffmpeg processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn start_download(
        &self,
        runner: ProcessRunner,
        events: Sender<JobEvent>,
    ) -> std::io::Result<Box<dyn RunnerControl>> {
        let handle = runner.start(events)?;
        Ok(Box::new(handle))
    }

    fn start_thumbnail(
        &self,
        request: ThumbnailRequest,
        events: Sender<JobEvent>,
    ) -> std::io::Result<()> {
        thumbnail::spawn(request, events)
    }
}

#[derive(Default)]
struct Notifier {
    subscribers: Vec<Sender<Notification>>,
}

impl Notifier {
    fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, notification: Notification) {
        self.subscribers
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

/// Terminal status for a process that has exited.
pub fn classify_exit(current: JobStatus, log: &str, exit_code: i32, exit_kind: ExitKind) -> JobStatus {
    if current == JobStatus::Cancelling {
        return JobStatus::Cancelled;
    }
    if exit_code == 0 && exit_kind == ExitKind::Normal {
        return JobStatus::Completed;
    }
    if log.contains(ALREADY_DOWNLOADED_MARKER) {
        JobStatus::AlreadyDownloaded
    } else if exit_kind == ExitKind::Abnormal {
        JobStatus::ErrorCrash
    } else {
        JobStatus::ErrorProcess
    }
}

/// Owns queue, history and the active-runner table. Every mutation goes through `&mut self`,
/// so callers serialize access (see [`JobManager`]).
pub struct Scheduler {
    paths: AppPaths,
    config: SharedConfig,
    state_path: Option<PathBuf>,
    queue: Vec<Job>,
    history: Vec<Job>,
    active: HashMap<String, Box<dyn RunnerControl>>,
    thumbnails_in_flight: HashSet<String>,
    launcher: Box<dyn ProcessLauncher>,
    events: Sender<JobEvent>,
    notifier: Notifier,
}

impl Scheduler {
    pub fn new(
        paths: AppPaths,
        config: SharedConfig,
        launcher: Box<dyn ProcessLauncher>,
        events: Sender<JobEvent>,
    ) -> Self {
        Self {
            paths,
            config,
            state_path: None,
            queue: Vec::new(),
            history: Vec::new(),
            active: HashMap::new(),
            thumbnails_in_flight: HashSet::new(),
            launcher,
            events,
            notifier: Notifier::default(),
        }
    }

    /// Enables persistence to `path` (still gated by `save_queue_on_exit`).
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_path = Some(path);
        self
    }

    pub fn subscribe(&mut self) -> Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn queue(&self) -> Vec<Job> {
        self.queue.clone()
    }

    pub fn history(&self) -> Vec<Job> {
        self.history.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.queue
            .iter()
            .chain(self.history.iter())
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// True once nothing is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }

    pub fn submit(&mut self, url: &str, output_path: Option<String>, args: Vec<String>) -> Job {
        let job = Job::new(url.trim(), output_path, args);
        info!(job_id = %job.id, url = %job.url, "job queued");
        self.queue.push(job.clone());
        self.notifier.emit(Notification::QueueChanged);
        self.persist();
        job
    }

    /// Splits `text` on whitespace and queues one job per URL with args from the current config.
    pub fn submit_urls(&mut self, text: &str, output_path: Option<String>) -> Vec<Job> {
        let urls: Vec<&str> = text.split_whitespace().collect();
        if urls.is_empty() {
            warn!("ignoring empty url submission");
            return Vec::new();
        }
        let args = config::build_download_args(&config::snapshot(&self.config));
        let jobs: Vec<Job> = urls
            .into_iter()
            .map(|url| self.submit(url, output_path.clone(), args.clone()))
            .collect();
        info!(count = jobs.len(), ?args, "queued batch");
        jobs
    }

    /// Promotes WAITING jobs in queue order while slots are free.
    pub fn admission_tick(&mut self) {
        let cfg = config::snapshot(&self.config);
        let limit = cfg.concurrency_limit();
        while self.active.len() < limit {
            let Some(idx) = self
                .queue
                .iter()
                .position(|j| j.status == JobStatus::Waiting)
            else {
                break;
            };
            self.launch(idx, &cfg);
        }
    }

    fn launch(&mut self, idx: usize, cfg: &AppConfig) {
        let Some(tool) = self.paths.resolve_tool(cfg.yt_dlp_path.as_deref()) else {
            let job = &mut self.queue[idx];
            error!(job_id = %job.id, "cannot start job: yt-dlp path is not configured");
            job.status = JobStatus::ErrorStartFail;
            job.log_line("Error: path to yt-dlp is not configured.");
            self.move_to_history(idx);
            return;
        };

        let job = &mut self.queue[idx];
        job.status = JobStatus::Starting;
        let job_id = job.id.clone();
        let runner = ProcessRunner::for_job(job, &tool.to_string_lossy());
        job.log_line(&format!("Command: {}", runner.command_line()));
        job.log_line("");
        self.notifier.emit(Notification::JobUpdated(job_id.clone()));

        match self.launcher.start_download(runner, self.events.clone()) {
            Ok(control) => {
                debug!(job_id = %job_id, "runner registered");
                self.active.insert(job_id, control);
                self.notifier
                    .emit(Notification::ActiveCountChanged(self.active.len()));
            }
            Err(err) => {
                error!(job_id = %job_id, "could not start runner: {err}");
                let job = &mut self.queue[idx];
                job.status = JobStatus::ErrorException;
                job.log_line(&format!("Error: could not start runner: {err}"));
                self.move_to_history(idx);
            }
        }
    }

    /// Applies one runner/thumbnail event. Returns false for `Shutdown`.
    pub fn handle_event(&mut self, event: JobEvent) -> bool {
        match event {
            JobEvent::Started { job_id } => self.on_started(&job_id),
            JobEvent::Output { job_id, text } => self.on_output(&job_id, &text),
            JobEvent::Finished {
                job_id,
                exit_code,
                exit_kind,
            } => self.on_finished(&job_id, exit_code, exit_kind),
            JobEvent::ProcessError {
                job_id,
                kind,
                message,
            } => self.on_process_error(&job_id, kind, &message),
            JobEvent::ThumbnailReady { job_id, path } => self.on_thumbnail_ready(&job_id, path),
            JobEvent::ThumbnailFailed { job_id, reason } => {
                self.on_thumbnail_failed(&job_id, &reason)
            }
            JobEvent::Shutdown => return false,
        }
        true
    }

    fn on_started(&mut self, job_id: &str) {
        if !self.active.contains_key(job_id) {
            return;
        }
        let Some(job) = self.queue.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        if job.status == JobStatus::Starting {
            job.status = JobStatus::Running;
            self.notifier
                .emit(Notification::JobUpdated(job_id.to_string()));
        }
    }

    fn on_output(&mut self, job_id: &str, text: &str) {
        if !self.active.contains_key(job_id) {
            return;
        }
        let Some(job) = self.queue.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        job.append_log(text);
        let update = output_rules::scan_chunk(text, job);
        if let Some(duration) = update.duration.as_deref() {
            info!(job_id = %job_id, duration, "found duration");
        }
        if let Some(thumb) = update.thumbnail_path.as_deref() {
            info!(job_id = %job_id, thumbnail = thumb, "found thumbnail");
        }
        update.apply(job);
        self.notifier
            .emit(Notification::JobUpdated(job_id.to_string()));
    }

    fn on_finished(&mut self, job_id: &str, exit_code: i32, exit_kind: ExitKind) {
        if self.active.remove(job_id).is_none() {
            warn!(job_id = %job_id, "finished event for unknown job");
            return;
        }
        self.notifier
            .emit(Notification::ActiveCountChanged(self.active.len()));

        if let Some(idx) = self.queue_index(job_id) {
            let job = &mut self.queue[idx];
            job.status = classify_exit(job.status, &job.log, exit_code, exit_kind);
            if job.status == JobStatus::Completed {
                job.progress = 100.0;
            }
            info!(job_id = %job_id, exit_code, ?exit_kind, status = %job.status, "job finished");
            self.move_to_history(idx);
            self.generate_thumbnail_if_needed(job_id);
        }
        self.admission_tick();
    }

    fn on_process_error(&mut self, job_id: &str, kind: ProcessErrorKind, message: &str) {
        if self.active.remove(job_id).is_none() {
            return;
        }
        self.notifier
            .emit(Notification::ActiveCountChanged(self.active.len()));

        if let Some(idx) = self.queue_index(job_id) {
            let job = &mut self.queue[idx];
            job.status = JobStatus::ErrorStartFail;
            job.log_line(&format!("Process error: {} - {message}", kind.as_str()));
            self.move_to_history(idx);
        }
        self.admission_tick();
    }

    fn on_thumbnail_ready(&mut self, job_id: &str, path: String) {
        self.thumbnails_in_flight.remove(job_id);
        let Some(job) = self.history.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        info!(job_id = %job_id, thumbnail = %path, "thumbnail generated");
        job.thumbnail_path = Some(path);
        self.notifier
            .emit(Notification::JobUpdated(job_id.to_string()));
        self.persist();
    }

    fn on_thumbnail_failed(&mut self, job_id: &str, reason: &str) {
        self.thumbnails_in_flight.remove(job_id);
        warn!(job_id = %job_id, "thumbnail generation failed: {reason}");
        let Some(job) = self.history.iter_mut().find(|j| j.id == job_id) else {
            return;
        };
        job.log_line(&format!("Thumbnail generation failed: {reason}"));
        self.notifier
            .emit(Notification::JobUpdated(job_id.to_string()));
        self.persist();
    }

    /// Requests a still-frame thumbnail for a finished job that has none.
    pub fn trigger_thumbnail(&mut self, job_id: &str) -> Result<()> {
        if !self.history.iter().any(|j| j.id == job_id) {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        self.generate_thumbnail_if_needed(job_id);
        Ok(())
    }

    fn generate_thumbnail_if_needed(&mut self, job_id: &str) {
        let Some(job) = self.history.iter().find(|j| j.id == job_id) else {
            return;
        };
        let finished_ok = matches!(
            job.status,
            JobStatus::Completed | JobStatus::AlreadyDownloaded
        );
        if !finished_ok || job.thumbnail_path.is_some() {
            return;
        }

        let cfg = config::snapshot(&self.config);
        let ffmpeg = self
            .paths
            .resolve_tool(cfg.ffmpeg_path.as_deref())
            .filter(|p| p.exists());
        let Some(ffmpeg_path) = ffmpeg else {
            warn!(job_id = %job_id, "cannot generate thumbnail: ffmpeg path missing or invalid");
            return;
        };
        if !self.thumbnails_in_flight.insert(job_id.to_string()) {
            return;
        }

        let request = ThumbnailRequest {
            job_id: job_id.to_string(),
            ffmpeg_path,
            output_path: job.output_path.clone(),
            final_filename: job.final_filename.clone(),
        };
        info!(job_id = %job_id, "no thumbnail found; generating one with ffmpeg");
        if let Err(err) = self.launcher.start_thumbnail(request, self.events.clone()) {
            self.thumbnails_in_flight.remove(job_id);
            warn!(job_id = %job_id, "could not start thumbnail generation: {err}");
        }
    }

    /// Running jobs go to CANCELLING and are killed; waiting jobs are cancelled on the spot.
    pub fn cancel(&mut self, job_id: &str) -> Result<()> {
        if let Some(control) = self.active.get(job_id) {
            if let Some(job) = self.queue.iter_mut().find(|j| j.id == job_id) {
                job.status = JobStatus::Cancelling;
            }
            let killed = control.cancel();
            info!(job_id = %job_id, killed, "cancelling active job");
            self.notifier
                .emit(Notification::JobUpdated(job_id.to_string()));
            return Ok(());
        }

        match self.queue_index(job_id) {
            Some(idx) if self.queue[idx].status == JobStatus::Waiting => {
                info!(job_id = %job_id, "cancelling waiting job");
                self.queue[idx].status = JobStatus::Cancelled;
                self.move_to_history(idx);
                Ok(())
            }
            Some(idx) => Err(self.invalid_state(&self.queue[idx], "cancel")),
            None => match self.history.iter().find(|j| j.id == job_id) {
                Some(job) => Err(self.invalid_state(job, "cancel")),
                None => Err(EngineError::JobNotFound(job_id.to_string())),
            },
        }
    }

    /// Moves a history job back to the queue tail as WAITING with a fresh log.
    pub fn retry(&mut self, job_id: &str) -> Result<Job> {
        let Some(idx) = self.history.iter().position(|j| j.id == job_id) else {
            return match self.queue.iter().find(|j| j.id == job_id) {
                Some(job) => Err(self.invalid_state(job, "retry")),
                None => Err(EngineError::JobNotFound(job_id.to_string())),
            };
        };
        let mut job = self.history.remove(idx);
        job.reset_for_retry();
        info!(job_id = %job_id, "retrying job");
        self.queue.push(job.clone());
        self.thumbnails_in_flight.remove(job_id);
        self.notifier.emit(Notification::HistoryChanged);
        self.notifier.emit(Notification::QueueChanged);
        self.persist();
        self.admission_tick();
        Ok(job)
    }

    /// Deletes a waiting or finished job. Jobs with a live process must be cancelled first.
    pub fn remove(&mut self, job_id: &str) -> Result<()> {
        if self.active.contains_key(job_id) {
            return Err(EngineError::JobActive(job_id.to_string()));
        }
        if let Some(idx) = self.queue_index(job_id) {
            if self.queue[idx].status != JobStatus::Waiting {
                return Err(self.invalid_state(&self.queue[idx], "remove"));
            }
            self.queue.remove(idx);
            self.notifier.emit(Notification::QueueChanged);
        } else if let Some(idx) = self.history.iter().position(|j| j.id == job_id) {
            self.history.remove(idx);
            self.notifier.emit(Notification::HistoryChanged);
        } else {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        info!(job_id = %job_id, "job removed");
        self.persist();
        Ok(())
    }

    pub fn clear_history(&mut self) {
        let removed = self.history.len();
        self.history.clear();
        info!(removed, "history cleared");
        self.notifier.emit(Notification::HistoryChanged);
        self.persist();
    }

    pub fn state(&self) -> JobsState {
        JobsState {
            queue: self.queue.clone(),
            history: self.history.clone(),
        }
    }

    pub fn export_to(&self, path: &Path) -> Result<()> {
        store::export_state(path, &self.state())?;
        info!(
            path = %path.display(),
            queue = self.queue.len(),
            history = self.history.len(),
            "exported jobs"
        );
        Ok(())
    }

    /// Replaces queue and history from a file. Refused while any runner is live.
    pub fn import_from(&mut self, path: &Path) -> Result<()> {
        if !self.active.is_empty() {
            return Err(EngineError::RunnersActive(self.active.len()));
        }
        let mut state = store::import_state(path)?;
        store::reconcile(&mut state);
        info!(
            path = %path.display(),
            queue = state.queue.len(),
            history = state.history.len(),
            "imported jobs"
        );
        self.replace_state(state);
        Ok(())
    }

    /// Startup load from the configured state file; never fails.
    pub fn restore(&mut self) {
        let Some(path) = self.state_path.clone() else {
            return;
        };
        if !self.active.is_empty() {
            warn!("not restoring jobs state while runners are active");
            return;
        }
        let state = store::load_state(&path);
        self.replace_state(state);
    }

    fn replace_state(&mut self, state: JobsState) {
        self.queue = state.queue;
        self.history = state.history;
        self.thumbnails_in_flight.clear();
        self.notifier.emit(Notification::QueueChanged);
        self.notifier.emit(Notification::HistoryChanged);
        self.persist();
        self.admission_tick();
    }

    /// Kills live processes without touching job state, then persists.
    /// Jobs left mid-run are re-queued by the next load.
    pub fn shutdown(&mut self) {
        for (job_id, control) in &self.active {
            if control.cancel() {
                info!(job_id = %job_id, "killed on shutdown");
            }
        }
        self.persist();
    }

    fn move_to_history(&mut self, idx: usize) {
        let job = self.queue.remove(idx);
        info!(job_id = %job.id, status = %job.status, "job moved to history");
        self.history.insert(0, job);
        self.notifier.emit(Notification::QueueChanged);
        self.notifier.emit(Notification::HistoryChanged);
        self.persist();
    }

    fn persist(&self) {
        let Some(path) = self.state_path.as_deref() else {
            return;
        };
        if !config::snapshot(&self.config).save_queue_on_exit {
            return;
        }
        if let Err(err) = store::export_state(path, &self.state()) {
            warn!(path = %path.display(), "could not save jobs state: {err}");
        }
    }

    fn queue_index(&self, job_id: &str) -> Option<usize> {
        self.queue.iter().position(|j| j.id == job_id)
    }

    fn invalid_state(&self, job: &Job, action: &'static str) -> EngineError {
        EngineError::InvalidJobState {
            id: job.id.clone(),
            status: job.status.to_string(),
            action,
        }
    }
}

fn lock(scheduler: &Mutex<Scheduler>) -> MutexGuard<'_, Scheduler> {
    scheduler.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a [`Scheduler`] on a driver thread: runner events and the periodic admission tick
/// are applied one at a time under the scheduler lock.
pub struct JobManager {
    scheduler: Arc<Mutex<Scheduler>>,
    events: Sender<JobEvent>,
    worker: Option<thread::JoinHandle<()>>,
}

impl JobManager {
    /// Real processes, state persisted to `paths.jobs_state_path()`, restored on start.
    pub fn start(paths: AppPaths, config: SharedConfig) -> Result<Self> {
        paths.ensure_dirs()?;
        let state_path = paths.jobs_state_path();
        Self::start_with(
            paths,
            config,
            Box::new(OsLauncher),
            Some(state_path),
            Duration::from_millis(ADMISSION_TICK_INTERVAL_MS),
        )
    }

    pub fn start_with(
        paths: AppPaths,
        config: SharedConfig,
        launcher: Box<dyn ProcessLauncher>,
        state_path: Option<PathBuf>,
        tick: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut scheduler = Scheduler::new(paths, config, launcher, tx.clone());
        if let Some(path) = state_path {
            scheduler = scheduler.with_state_file(path);
        }
        scheduler.restore();

        let scheduler = Arc::new(Mutex::new(scheduler));
        let driver = scheduler.clone();
        let worker = thread::Builder::new()
            .name("job-scheduler".to_string())
            .spawn(move || drive(driver, rx, tick))?;

        Ok(Self {
            scheduler,
            events: tx,
            worker: Some(worker),
        })
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        lock(&self.scheduler).subscribe()
    }

    pub fn submit(&self, url: &str, output_path: Option<String>, args: Vec<String>) -> Job {
        lock(&self.scheduler).submit(url, output_path, args)
    }

    pub fn submit_urls(&self, text: &str, output_path: Option<String>) -> Vec<Job> {
        lock(&self.scheduler).submit_urls(text, output_path)
    }

    pub fn cancel(&self, job_id: &str) -> Result<()> {
        lock(&self.scheduler).cancel(job_id)
    }

    pub fn retry(&self, job_id: &str) -> Result<Job> {
        lock(&self.scheduler).retry(job_id)
    }

    pub fn remove(&self, job_id: &str) -> Result<()> {
        lock(&self.scheduler).remove(job_id)
    }

    pub fn clear_history(&self) {
        lock(&self.scheduler).clear_history()
    }

    pub fn trigger_thumbnail(&self, job_id: &str) -> Result<()> {
        lock(&self.scheduler).trigger_thumbnail(job_id)
    }

    pub fn export_to(&self, path: &Path) -> Result<()> {
        lock(&self.scheduler).export_to(path)
    }

    pub fn import_from(&self, path: &Path) -> Result<()> {
        lock(&self.scheduler).import_from(path)
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        lock(&self.scheduler).get_job(job_id)
    }

    pub fn queue(&self) -> Vec<Job> {
        lock(&self.scheduler).queue()
    }

    pub fn history(&self) -> Vec<Job> {
        lock(&self.scheduler).history()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.scheduler).active_count()
    }

    pub fn is_idle(&self) -> bool {
        lock(&self.scheduler).is_idle()
    }

    /// Runs an admission pass now instead of waiting for the next tick.
    pub fn kick(&self) {
        lock(&self.scheduler).admission_tick()
    }

    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.events.send(JobEvent::Shutdown);
        let _ = worker.join();
        lock(&self.scheduler).shutdown();
        info!("job manager stopped");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drive(scheduler: Arc<Mutex<Scheduler>>, events: Receiver<JobEvent>, tick: Duration) {
    let mut next_tick = Instant::now() + tick;
    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match events.recv_timeout(wait) {
            Ok(event) => {
                if !lock(&scheduler).handle_event(event) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Output floods must not starve the safety-net tick.
        if Instant::now() >= next_tick {
            lock(&scheduler).admission_tick();
            next_tick = Instant::now() + tick;
        }
    }
}
