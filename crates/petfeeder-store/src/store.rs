use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use petfeeder_shared::types::{EventKind, GalleryState};

use crate::database::Database;
use crate::error::Result;
use crate::media::MediaLibrary;
use crate::models::{DateIndex, EventRecord, GalleryEntry};

/// Name of the media folder inside the data directory.
pub const MEDIA_DIR_NAME: &str = "media";

/// Database plus media library, shareable across tasks.
///
/// SQLite calls are short and synchronous; they run under a std mutex.
pub struct Store {
    db: Mutex<Database>,
    media: MediaLibrary,
}

impl Store {
    /// Open `petfeeder.db` and the `media/` folder under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Database::open_in_dir(data_dir)?;
        let media_root = data_dir.join(MEDIA_DIR_NAME);
        std::fs::create_dir_all(&media_root)?;
        Ok(Self {
            db: Mutex::new(db),
            media: MediaLibrary::new(media_root),
        })
    }

    pub fn in_memory(media_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
            media: MediaLibrary::new(media_root),
        })
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn media(&self) -> &MediaLibrary {
        &self.media
    }

    pub fn push_event(&self, kind: EventKind, data: &Value) -> Result<()> {
        self.push_event_at(kind, data, Utc::now())
    }

    pub fn push_event_at(&self, kind: EventKind, data: &Value, at: DateTime<Utc>) -> Result<()> {
        let id = self.db().insert_event(kind, data, at)?;
        tracing::debug!(id, kind = kind.as_str(), "event stored");
        Ok(())
    }

    pub fn push_gallery(&self, file_timestamp: i64) -> Result<GalleryEntry> {
        self.db().insert_gallery(file_timestamp)
    }

    pub fn update_gallery(&self, file_timestamp: i64, state: GalleryState) -> Result<bool> {
        let updated = self.db().update_gallery_state(file_timestamp, state)?;
        if !updated {
            tracing::warn!(file_timestamp, ?state, "gallery row missing");
        }
        Ok(updated)
    }

    pub fn get_events(&self, year: i32, month: u32, date: u32) -> Result<Vec<EventRecord>> {
        self.db().get_events_for_day(year, month, date)
    }

    pub fn get_gallery(&self, year: i32, month: u32, date: u32) -> Result<Vec<GalleryEntry>> {
        self.db().get_gallery_for_day(year, month, date)
    }

    pub fn get_event_dates(&self) -> Result<DateIndex> {
        self.db().event_dates()
    }

    pub fn get_gallery_dates(&self) -> Result<DateIndex> {
        self.db().gallery_dates()
    }

    pub async fn get_or_create_current_path(&self) -> Result<PathBuf> {
        self.media.get_or_create_current_path().await
    }

    pub async fn get_or_create_path_for(&self, at: DateTime<Utc>) -> Result<PathBuf> {
        self.media.get_or_create_path_for(at).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Datelike;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        assert!(dir.path().join(MEDIA_DIR_NAME).is_dir());
        let today = store.get_or_create_current_path().await.unwrap();
        assert!(today.starts_with(dir.path().join(MEDIA_DIR_NAME)));
    }

    #[test]
    fn events_for_today() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory(dir.path()).unwrap();
        let now = Utc::now();

        store
            .push_event_at(EventKind::Warning, &json!({"type": "nofood"}), now)
            .unwrap();

        let events = store.get_events(now.year(), now.month(), now.day()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Warning);

        let dates = store.get_event_dates().unwrap();
        assert_eq!(dates[&now.year()][&now.month()][&now.day()], 1);
    }

    #[test]
    fn gallery_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::in_memory(dir.path()).unwrap();
        let now = Utc::now();
        let ts = now.timestamp_millis();

        store.push_gallery(ts).unwrap();
        assert!(store.update_gallery(ts, GalleryState::Thumbnailed).unwrap());
        assert!(!store.update_gallery(ts + 5, GalleryState::Converted).unwrap());

        let gallery = store.get_gallery(now.year(), now.month(), now.day()).unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].state, GalleryState::Thumbnailed);
    }
}
