use crate::cmd;
use crate::runner::JobEvent;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;
use tracing::{info, warn};

/// Seconds into the video where the still frame is taken.
const FRAME_OFFSET_SECONDS: &str = "5";
const THUMBNAIL_WIDTH_FILTER: &str = "scale=128:-1";

#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailRequest {
    pub job_id: String,
    pub ffmpeg_path: PathBuf,
    pub output_path: Option<String>,
    pub final_filename: Option<String>,
}

impl ThumbnailRequest {
    pub fn video_path(&self) -> Option<PathBuf> {
        let dir = self.output_path.as_deref()?.trim();
        let name = self.final_filename.as_deref()?.trim();
        if dir.is_empty() || name.is_empty() {
            return None;
        }
        Some(Path::new(dir).join(name))
    }
}

/// `<dir>/<stem>.jpg` next to the video.
pub fn thumbnail_target(video: &Path) -> PathBuf {
    video.with_extension("jpg")
}

/// Runs ffmpeg to completion and returns the written image path.
pub fn generate(request: &ThumbnailRequest) -> Result<PathBuf> {
    let video = request.video_path().ok_or_else(|| {
        EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: None,
            stderr: "output path or final filename is unknown".to_string(),
        }
    })?;
    if !video.exists() {
        return Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("video file not found: {}", video.display()),
        )));
    }
    let image = thumbnail_target(&video);

    let args: Vec<String> = vec![
        "-nostdin".to_string(),
        "-ss".to_string(),
        FRAME_OFFSET_SECONDS.to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-vframes".to_string(),
        "1".to_string(),
        "-q:v".to_string(),
        "3".to_string(),
        "-vf".to_string(),
        THUMBNAIL_WIDTH_FILTER.to_string(),
        "-y".to_string(),
        image.to_string_lossy().to_string(),
    ];

    info!(
        job_id = %request.job_id,
        command = %cmd::display_command_line(&request.ffmpeg_path.to_string_lossy(), &args),
        "generating thumbnail"
    );
    let output = cmd::tool_command(&request.ffmpeg_path, &args, None)
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            },
            _ => EngineError::Io(e),
        })?;

    if !output.status.success() || !image.exists() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(image)
}

/// Generates on a worker thread and reports the outcome as a `JobEvent`.
pub fn spawn(request: ThumbnailRequest, events: Sender<JobEvent>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("thumbnail".to_string())
        .spawn(move || {
            let event = match generate(&request) {
                Ok(path) => JobEvent::ThumbnailReady {
                    job_id: request.job_id,
                    path: path.to_string_lossy().to_string(),
                },
                Err(err) => {
                    warn!(job_id = %request.job_id, "thumbnail generation failed: {err}");
                    JobEvent::ThumbnailFailed {
                        job_id: request.job_id,
                        reason: err.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        })?;
    Ok(())
}
