use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 3;
pub const MAX_MAX_PARALLEL_DOWNLOADS: usize = 16;

/// Download-option flags expanded into yt-dlp arguments at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub download_format: String,
    pub write_thumbnail: bool,
    pub embed_thumbnail: bool,
    pub extract_audio: bool,
    pub audio_format: String,
    pub write_subs: bool,
    pub sub_langs: String,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            download_format: "bestvideo+bestaudio/best".to_string(),
            write_thumbnail: true,
            embed_thumbnail: false,
            extract_audio: false,
            audio_format: "mp3".to_string(),
            write_subs: false,
            sub_langs: "en,sv".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub yt_dlp_path: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub max_parallel_downloads: usize,
    pub last_output_dir: Option<String>,
    /// Also gates persistence of the queue/history after each mutation.
    pub save_queue_on_exit: bool,
    pub default_args: Vec<String>,
    #[serde(flatten)]
    pub download: DownloadOptions,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            yt_dlp_path: None,
            ffmpeg_path: None,
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            last_output_dir: None,
            save_queue_on_exit: true,
            default_args: Vec::new(),
            download: DownloadOptions::default(),
        }
    }
}

impl AppConfig {
    pub fn concurrency_limit(&self) -> usize {
        self.max_parallel_downloads
            .clamp(1, MAX_MAX_PARALLEL_DOWNLOADS)
    }
}

pub type SharedConfig = Arc<RwLock<AppConfig>>;

pub fn shared(config: AppConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

pub fn snapshot(config: &SharedConfig) -> AppConfig {
    config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let path = paths.config_path();
    if !path.exists() {
        let config = AppConfig::default();
        save_config(paths, &config)?;
        info!(path = %path.display(), "config file missing; wrote defaults");
        return Ok(config);
    }
    let bytes = std::fs::read(&path)?;
    let parsed: AppConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::ConfigInvalid(format!(
            "failed to parse config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn load_config_or_default(paths: &AppPaths) -> AppConfig {
    match load_config(paths) {
        Ok(config) => config,
        Err(err) => {
            warn!("using default config: {err}");
            AppConfig::default()
        }
    }
}

pub fn save_config(paths: &AppPaths, config: &AppConfig) -> Result<()> {
    let path = paths.config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

/// Expands the option flags plus `default_args` into the argument vector a new job snapshots.
pub fn build_download_args(config: &AppConfig) -> Vec<String> {
    let opts = &config.download;
    let mut args: Vec<String> = Vec::new();

    let format = opts.download_format.trim();
    if !format.is_empty() {
        args.extend(["-f".to_string(), format.to_string()]);
    }
    if opts.write_thumbnail {
        args.push("--write-thumbnail".to_string());
    }
    if opts.embed_thumbnail {
        args.push("--embed-thumbnail".to_string());
    }
    if opts.extract_audio {
        args.push("-x".to_string());
        let audio_format = opts.audio_format.trim();
        if !audio_format.is_empty() {
            args.extend(["--audio-format".to_string(), audio_format.to_string()]);
        }
    }
    if opts.write_subs {
        args.push("--write-subs".to_string());
        let langs = opts.sub_langs.trim();
        if !langs.is_empty() {
            args.extend(["--sub-langs".to_string(), langs.to_string()]);
        }
    }
    args.extend(config.default_args.iter().cloned());

    dedup_option_groups(args)
}

/// Drops repeated option groups (a flag plus the values that follow it), keeping the first.
fn dedup_option_groups(args: Vec<String>) -> Vec<String> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    for arg in args {
        match groups.last_mut() {
            Some(group) if !arg.starts_with('-') => group.push(arg),
            _ => groups.push(vec![arg]),
        }
    }

    let mut kept: Vec<Vec<String>> = Vec::new();
    for group in groups {
        if !kept.contains(&group) {
            kept.push(group);
        }
    }
    kept.into_iter().flatten().collect()
}
