//! On-disk layout for recordings: `<root>/YYYY/MM/DD/<file_timestamp>.<ext>`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct MediaLibrary {
    root: PathBuf,
}

impl MediaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder holding the media of the UTC day containing `at`.
    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(at.format("%Y").to_string())
            .join(at.format("%m").to_string())
            .join(at.format("%d").to_string())
    }

    /// Folder for today, created on demand.
    pub async fn get_or_create_current_path(&self) -> Result<PathBuf> {
        self.get_or_create_path_for(Utc::now()).await
    }

    pub async fn get_or_create_path_for(&self, at: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.path_for(at);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }
}
