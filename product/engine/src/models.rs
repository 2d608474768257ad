use chrono::{Local, SecondsFormat};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Title placeholder until one is discovered from tool output.
pub const UNKNOWN_TITLE: &str = "N/A";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[default]
    Waiting,
    Starting,
    Running,
    Merging,
    PostProcessing,
    Cancelling,
    Completed,
    Cancelled,
    ErrorStartFail,
    ErrorException,
    ErrorCrash,
    ErrorProcess,
    ErrorYtDlp,
    AlreadyDownloaded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 14] = [
        JobStatus::Waiting,
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Merging,
        JobStatus::PostProcessing,
        JobStatus::Cancelling,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::ErrorStartFail,
        JobStatus::ErrorException,
        JobStatus::ErrorCrash,
        JobStatus::ErrorProcess,
        JobStatus::ErrorYtDlp,
        JobStatus::AlreadyDownloaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Starting => "STARTING",
            JobStatus::Running => "RUNNING",
            JobStatus::Merging => "MERGING",
            JobStatus::PostProcessing => "POSTPROCESSING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::ErrorStartFail => "ERROR_STARTFAIL",
            JobStatus::ErrorException => "ERROR_EXCEPTION",
            JobStatus::ErrorCrash => "ERROR_CRASH",
            JobStatus::ErrorProcess => "ERROR_PROCESS",
            JobStatus::ErrorYtDlp => "ERROR_YTDLP",
            JobStatus::AlreadyDownloaded => "ALREADY_DOWNLOADED",
        }
    }

    /// Accepts both `RUNNING` and the older `STATUS_RUNNING` spelling.
    pub fn from_str(value: &str) -> Option<Self> {
        let value = value.trim();
        let name = value.strip_prefix("STATUS_").unwrap_or(value);
        JobStatus::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Statuses that only leave via an explicit retry; jobs holding one live in history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Cancelled
                | JobStatus::ErrorStartFail
                | JobStatus::ErrorException
                | JobStatus::ErrorCrash
                | JobStatus::ErrorProcess
                | JobStatus::ErrorYtDlp
                | JobStatus::AlreadyDownloaded
        )
    }

    /// Process is up and producing output (includes the merge/post-process phases).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::Running | JobStatus::Merging | JobStatus::PostProcessing
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // An unknown name must not fail the whole record.
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .and_then(JobStatus::from_str)
            .unwrap_or(JobStatus::Waiting))
    }
}

/// One download unit. Serialized as-is into the jobs state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(alias = "argsList")]
    pub args_list: Vec<String>,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(alias = "addedTime")]
    pub added_time: String,
    #[serde(alias = "outputPath")]
    pub output_path: Option<String>,
    #[serde(alias = "finalFilename")]
    pub final_filename: Option<String>,
    #[serde(alias = "thumbnailPath")]
    pub thumbnail_path: Option<String>,
    pub duration: Option<String>,
    pub log: String,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: String::new(),
            title: UNKNOWN_TITLE.to_string(),
            args_list: Vec::new(),
            status: JobStatus::Waiting,
            progress: 0.0,
            added_time: now_iso8601(),
            output_path: None,
            final_filename: None,
            thumbnail_path: None,
            duration: None,
            log: String::new(),
        }
    }
}

impl Job {
    pub fn new(url: impl Into<String>, output_path: Option<String>, args_list: Vec<String>) -> Self {
        Self {
            url: url.into(),
            output_path,
            args_list,
            ..Self::default()
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == UNKNOWN_TITLE
    }

    pub fn append_log(&mut self, text: &str) {
        self.log.push_str(text);
    }

    /// Appends one line, adding the trailing newline.
    pub fn log_line(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }

    /// Back to WAITING for another attempt; id and url survive.
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Waiting;
        self.progress = 0.0;
        self.log.clear();
        self.thumbnail_path = None;
        self.added_time = now_iso8601();
    }
}

pub fn now_iso8601() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}
