use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use petfeeder_shared::types::GalleryState;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{build_date_index, day_key, day_key_from_parts, DateIndex, GalleryEntry};

impl Database {
    /// Insert a row in the `Recording` state for a recording that started at
    /// `file_timestamp` (UTC milliseconds).
    pub fn insert_gallery(&self, file_timestamp: i64) -> Result<GalleryEntry> {
        let started = DateTime::<Utc>::from_timestamp_millis(file_timestamp)
            .ok_or(StoreError::InvalidTimestamp(file_timestamp))?;
        let now = Utc::now();

        self.conn().execute(
            "INSERT INTO gallery (file_timestamp, day, state, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                file_timestamp,
                day_key(started),
                u8::from(GalleryState::Recording),
                now.to_rfc3339(),
            ],
        )?;

        Ok(GalleryEntry {
            file_timestamp,
            state: GalleryState::Recording,
            updated_at: now,
        })
    }

    /// Move a row to `state`. Returns `false` if no row matched.
    pub fn update_gallery_state(&self, file_timestamp: i64, state: GalleryState) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE gallery SET state = ?1, updated_at = ?2 WHERE file_timestamp = ?3",
            params![u8::from(state), Utc::now().to_rfc3339(), file_timestamp],
        )?;
        Ok(affected > 0)
    }

    pub fn get_gallery_entry(&self, file_timestamp: i64) -> Result<GalleryEntry> {
        self.conn()
            .query_row(
                "SELECT file_timestamp, state, updated_at FROM gallery WHERE file_timestamp = ?1",
                params![file_timestamp],
                row_to_gallery,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Gallery rows of one UTC day, oldest first.
    pub fn get_gallery_for_day(&self, year: i32, month: u32, date: u32) -> Result<Vec<GalleryEntry>> {
        let day = day_key_from_parts(year, month, date)?;
        let mut stmt = self.conn().prepare(
            "SELECT file_timestamp, state, updated_at
             FROM gallery
             WHERE day = ?1
             ORDER BY file_timestamp ASC",
        )?;

        let rows = stmt.query_map(params![day], row_to_gallery)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn gallery_dates(&self) -> Result<DateIndex> {
        let mut stmt = self
            .conn()
            .prepare("SELECT day, COUNT(*) FROM gallery GROUP BY day")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;

        let mut days = Vec::new();
        for row in rows {
            days.push(row?);
        }
        Ok(build_date_index(days))
    }
}

fn row_to_gallery(row: &rusqlite::Row<'_>) -> rusqlite::Result<GalleryEntry> {
    let file_timestamp: i64 = row.get(0)?;
    let state_raw: u8 = row.get(1)?;
    let updated_str: String = row.get(2)?;

    let state = GalleryState::try_from(state_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Integer, e.into())
    })?;

    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(GalleryEntry {
        file_timestamp,
        state,
        updated_at,
    })
}
