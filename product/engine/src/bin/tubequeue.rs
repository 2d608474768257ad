use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tubequeue_engine::config::{self, AppConfig};
use tubequeue_engine::jobs::{JobManager, Notification};
use tubequeue_engine::logging;
use tubequeue_engine::paths::AppPaths;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut output_dir: Option<String> = None;
    let mut yt_dlp: Option<String> = None;
    let mut ffmpeg: Option<String> = None;
    let mut parallel: Option<usize> = None;
    let mut export_path: Option<PathBuf> = None;
    let mut import_path: Option<PathBuf> = None;
    let mut save_config = false;
    let mut urls: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => base_dir = Some(PathBuf::from(flag_value(&args, &mut i)?)),
            "--output" => output_dir = Some(flag_value(&args, &mut i)?),
            "--yt-dlp" => yt_dlp = Some(flag_value(&args, &mut i)?),
            "--ffmpeg" => ffmpeg = Some(flag_value(&args, &mut i)?),
            "--parallel" => {
                let v = flag_value(&args, &mut i)?;
                parallel = Some(
                    v.parse()
                        .map_err(|_| format!("--parallel expects a number, got {v}"))?,
                );
            }
            "--export" => export_path = Some(PathBuf::from(flag_value(&args, &mut i)?)),
            "--import" => import_path = Some(PathBuf::from(flag_value(&args, &mut i)?)),
            "--save-config" => save_config = true,
            other if other.starts_with('-') => {
                return Err(format!("unknown arg: {other} (try --help)"))
            }
            url => urls.push(url.to_string()),
        }
        i += 1;
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;

    if let Err(err) = logging::init_logging(&paths) {
        logging::init_logging_stderr();
        tracing::warn!("file logging unavailable, using stderr: {err}");
    }

    let mut cfg: AppConfig = config::load_config_or_default(&paths);
    if yt_dlp.is_some() {
        cfg.yt_dlp_path = yt_dlp;
    }
    if ffmpeg.is_some() {
        cfg.ffmpeg_path = ffmpeg;
    }
    if let Some(n) = parallel {
        cfg.max_parallel_downloads = n;
    }
    if output_dir.is_some() {
        cfg.last_output_dir = output_dir.clone();
    }
    if save_config {
        config::save_config(&paths, &cfg).map_err(|e| e.to_string())?;
    }
    let output_dir = output_dir.or_else(|| cfg.last_output_dir.clone());

    println!("Base dir: {}", paths.base_dir.to_string_lossy());
    let mut manager = JobManager::start(paths, config::shared(cfg)).map_err(|e| e.to_string())?;
    let notifications = manager.subscribe();

    if let Some(path) = import_path {
        manager.import_from(&path).map_err(|e| e.to_string())?;
        println!("Imported jobs from {}", path.display());
    }

    if !urls.is_empty() {
        for job in manager.submit_urls(&urls.join(" "), output_dir) {
            println!("Queued {} {}", job.id, job.url);
        }
    }
    manager.kick();

    while !manager.is_idle() {
        match notifications.recv_timeout(Duration::from_millis(500)) {
            Ok(Notification::HistoryChanged) => {
                if let Some(job) = manager.history().first() {
                    println!("{:<18} {} {}", job.status.as_str(), job.title, job.url);
                }
            }
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(path) = export_path {
        manager.export_to(&path).map_err(|e| e.to_string())?;
        println!("Exported jobs to {}", path.display());
    }

    manager.shutdown();
    Ok(())
}

fn flag_value(args: &[String], i: &mut usize) -> Result<String, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("TUBEQUEUE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("tubequeue"));
            }
        }
    }

    let home = std::env::var("HOME").ok()?;
    let t = home.trim();
    if t.is_empty() {
        return None;
    }
    Some(PathBuf::from(t).join(".local").join("share").join("tubequeue"))
}

fn print_help() {
    println!(
        r#"tubequeue

Queues URLs for yt-dlp and runs them with bounded parallelism until the queue drains.
Jobs left unfinished are kept in <base-dir>/data/jobs.json and resumed on the next run.

Usage:
  cargo run --bin tubequeue -- --yt-dlp /usr/bin/yt-dlp --output ~/Videos <url>...
  cargo run --bin tubequeue -- --import saved.json
  cargo run --bin tubequeue -- --export snapshot.json

Options:
  --base-dir <path>   Override base dir (default: $TUBEQUEUE_BASE_DIR, %APPDATA%\tubequeue, ~/.local/share/tubequeue)
  --output <dir>      Download directory for new jobs
  --yt-dlp <path>     yt-dlp executable (overrides config)
  --ffmpeg <path>     ffmpeg executable, used for fallback thumbnails
  --parallel <n>      Max parallel downloads (1-16)
  --import <file>     Replace queue and history from an exported file
  --export <file>     Write queue and history to a file after the run
  --save-config       Persist the overrides above to config.json
"#
    );
}
