//! Turns free-text yt-dlp output into job field updates.
//!
//! `scan_chunk` is pure: it only reads the job, and the caller applies the
//! returned [`OutputUpdate`]. Rules run in a fixed order per chunk:
//! progress, final filename, thumbnail, duration, phase, then title.

use crate::models::{Job, JobStatus};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Marker yt-dlp prints when the target file is already on disk.
pub const ALREADY_DOWNLOADED_MARKER: &str = "has already been downloaded";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputUpdate {
    pub progress: Option<f64>,
    pub final_filename: Option<String>,
    pub thumbnail_path: Option<String>,
    pub duration: Option<String>,
    pub title: Option<String>,
    pub status: Option<JobStatus>,
}

impl OutputUpdate {
    /// Writes the update into `job`; returns whether any field changed.
    pub fn apply(self, job: &mut Job) -> bool {
        let mut changed = false;
        if let Some(progress) = self.progress {
            changed |= job.progress != progress;
            job.progress = progress;
        }
        if let Some(name) = self.final_filename {
            changed |= job.final_filename.as_deref() != Some(name.as_str());
            job.final_filename = Some(name);
        }
        if let Some(thumb) = self.thumbnail_path {
            changed |= job.thumbnail_path.as_deref() != Some(thumb.as_str());
            job.thumbnail_path = Some(thumb);
        }
        if job.duration.is_none() {
            if let Some(duration) = self.duration {
                job.duration = Some(duration);
                changed = true;
            }
        }
        if let Some(title) = self.title {
            changed |= job.title != title;
            job.title = title;
        }
        if let Some(status) = self.status {
            changed |= job.status != status;
            job.status = status;
        }
        changed
    }
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[download\]\s+([\d.]+)%").expect("progress regex"))
}

fn merger_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\[Merger\] Merging formats into "(.*)""#).expect("merger regex")
    })
}

fn extract_audio_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[ExtractAudio\] Destination: (.*)").expect("extract audio regex")
    })
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[download\] Destination: (.*)").expect("destination regex"))
}

fn thumbnail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Older builds print "Writing thumbnail to:", newer ones "Writing video thumbnail 0 to:".
    RE.get_or_init(|| {
        Regex::new(r"Writing (?:video )?thumbnail(?: \d+)? to: (.*)").expect("thumbnail regex")
    })
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Duration:\s*([\d:.]+)").expect("duration regex"))
}

fn postprocess_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(?:ExtractAudio|EmbedThumbnail|Metadata|Fixup\w*)\]")
            .expect("postprocess regex")
    })
}

pub fn scan_chunk(text: &str, job: &Job) -> OutputUpdate {
    let mut update = OutputUpdate::default();

    // Last match in the chunk wins.
    if let Some(value) = progress_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .last()
    {
        update.progress = Some(value);
    }

    let final_path = [merger_re(), extract_audio_re(), destination_re()]
        .into_iter()
        .find_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str().trim());
    if let Some(path) = final_path {
        if let Some(name) = basename(path) {
            update.final_filename = Some(name);
        }
    }

    if let Some(raw) = thumbnail_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
    {
        update.thumbnail_path = Some(resolve_against_output(raw, job.output_path.as_deref()));
    }

    if job.duration.is_none() {
        if let Some(raw) = duration_re().captures(text).and_then(|c| c.get(1)) {
            let whole = raw.as_str().trim().split('.').next().unwrap_or_default();
            if !whole.is_empty() {
                update.duration = Some(whole.to_string());
            }
        }
    }

    update.status = next_phase(text, job.status);

    if job.has_default_title() {
        if let Some(name) = update.final_filename.as_deref() {
            update.title = Some(file_stem(name));
        }
    }

    update
}

fn next_phase(text: &str, current: JobStatus) -> Option<JobStatus> {
    if !current.is_running() {
        return None;
    }
    if postprocess_re().is_match(text) && current != JobStatus::PostProcessing {
        return Some(JobStatus::PostProcessing);
    }
    if merger_re().is_match(text) && current == JobStatus::Running {
        return Some(JobStatus::Merging);
    }
    None
}

fn basename(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('"');
    // yt-dlp on Windows prints backslash paths; treat both separators alike.
    let name = trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn file_stem(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

fn resolve_against_output(raw: &str, output_path: Option<&str>) -> String {
    let path = Path::new(raw);
    match output_path {
        Some(base) if path.is_relative() => Path::new(base).join(path).to_string_lossy().to_string(),
        _ => raw.to_string(),
    }
}
