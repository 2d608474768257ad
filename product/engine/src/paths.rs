use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join("data")
    }

    /// Queue + history snapshot written after every committed mutation.
    pub fn jobs_state_path(&self) -> PathBuf {
        self.data_dir().join("jobs.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("tubequeue.log")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }

    /// Resolves a tool path from config; bare names are left for `PATH` lookup.
    pub fn resolve_tool(&self, configured: Option<&str>) -> Option<PathBuf> {
        let raw = configured?.trim();
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(raw);
        if path.is_relative() && path.components().count() > 1 {
            return Some(self.base_dir.join(path));
        }
        Some(path.to_path_buf())
    }
}
