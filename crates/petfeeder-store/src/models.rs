//! Records persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be returned to RPC callers as
//! is.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use petfeeder_shared::types::{EventKind, GalleryState};

use crate::error::{Result, StoreError};

/// A persisted device event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// When the event was recorded (UTC milliseconds).
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
}

/// Processing state of one feeding recording.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GalleryEntry {
    /// Recording start (UTC milliseconds); also the media file stem.
    pub file_timestamp: i64,
    pub state: GalleryState,
    pub updated_at: DateTime<Utc>,
}

/// `{year: {month: {date: count}}}`
pub type DateIndex = BTreeMap<i32, BTreeMap<u32, BTreeMap<u32, u32>>>;

/// `YYYY-MM-DD` bucket for a UTC instant.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// `YYYY-MM-DD` bucket for a calendar date, rejecting impossible dates.
pub fn day_key_from_parts(year: i32, month: u32, date: u32) -> Result<String> {
    NaiveDate::from_ymd_opt(year, month, date)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .ok_or(StoreError::InvalidDate { year, month, date })
}

/// Fold `(day, count)` rows into a [`DateIndex`], skipping malformed days.
pub(crate) fn build_date_index(rows: impl IntoIterator<Item = (String, u32)>) -> DateIndex {
    let mut index = DateIndex::new();
    for (day, count) in rows {
        let Ok(date) = NaiveDate::parse_from_str(&day, "%Y-%m-%d") else {
            tracing::warn!(day = %day, "skipping malformed day bucket");
            continue;
        };
        *index
            .entry(date.year())
            .or_default()
            .entry(date.month())
            .or_default()
            .entry(date.day())
            .or_default() += count;
    }
    index
}
