use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use petfeeder_shared::types::{EventKind, GalleryState};
use petfeeder_store::{DateIndex, EventRecord, GalleryEntry, Store, StoreError};

type Result<T> = std::result::Result<T, StoreError>;

/// Storage used by the orchestrator: dated events, gallery rows and the
/// media folder for new recordings.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn push_event(&self, kind: EventKind, data: Value) -> Result<()>;

    async fn push_gallery(&self, file_timestamp: i64) -> Result<()>;

    /// Returns `false` when no row has this timestamp.
    async fn update_gallery(&self, file_timestamp: i64, state: GalleryState) -> Result<bool>;

    async fn get_events(&self, year: i32, month: u32, date: u32) -> Result<Vec<EventRecord>>;

    async fn get_gallery(&self, year: i32, month: u32, date: u32) -> Result<Vec<GalleryEntry>>;

    async fn get_event_dates(&self) -> Result<DateIndex>;

    async fn get_gallery_dates(&self) -> Result<DateIndex>;

    /// Media folder of the UTC day containing `at`, created on demand.
    async fn get_or_create_path_for(&self, at: DateTime<Utc>) -> Result<PathBuf>;
}

#[async_trait]
impl Persistence for Store {
    async fn push_event(&self, kind: EventKind, data: Value) -> Result<()> {
        Store::push_event(self, kind, &data)
    }

    async fn push_gallery(&self, file_timestamp: i64) -> Result<()> {
        Store::push_gallery(self, file_timestamp).map(|_| ())
    }

    async fn update_gallery(&self, file_timestamp: i64, state: GalleryState) -> Result<bool> {
        Store::update_gallery(self, file_timestamp, state)
    }

    async fn get_events(&self, year: i32, month: u32, date: u32) -> Result<Vec<EventRecord>> {
        Store::get_events(self, year, month, date)
    }

    async fn get_gallery(&self, year: i32, month: u32, date: u32) -> Result<Vec<GalleryEntry>> {
        Store::get_gallery(self, year, month, date)
    }

    async fn get_event_dates(&self) -> Result<DateIndex> {
        Store::get_event_dates(self)
    }

    async fn get_gallery_dates(&self) -> Result<DateIndex> {
        Store::get_gallery_dates(self)
    }

    async fn get_or_create_path_for(&self, at: DateTime<Utc>) -> Result<PathBuf> {
        Store::get_or_create_path_for(self, at).await
    }
}
