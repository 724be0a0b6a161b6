use chrono::{DateTime, Utc};
use rusqlite::params;
use serde_json::Value;

use petfeeder_shared::types::EventKind;

use crate::database::Database;
use crate::error::Result;
use crate::models::{build_date_index, day_key, day_key_from_parts, DateIndex, EventRecord};

impl Database {
    pub fn insert_event(&self, kind: EventKind, data: &Value, at: DateTime<Utc>) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO events (timestamp_ms, day, kind, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                at.timestamp_millis(),
                day_key(at),
                kind.as_str(),
                serde_json::to_string(data)?,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Events of one UTC day, oldest first.
    pub fn get_events_for_day(&self, year: i32, month: u32, date: u32) -> Result<Vec<EventRecord>> {
        let day = day_key_from_parts(year, month, date)?;
        let mut stmt = self.conn().prepare(
            "SELECT timestamp_ms, kind, data
             FROM events
             WHERE day = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![day], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn event_dates(&self) -> Result<DateIndex> {
        let mut stmt = self
            .conn()
            .prepare("SELECT day, COUNT(*) FROM events GROUP BY day")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;

        let mut days = Vec::new();
        for row in rows {
            days.push(row?);
        }
        Ok(build_date_index(days))
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let timestamp: i64 = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let data_str: String = row.get(2)?;

    let kind = EventKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown event kind '{kind_str}'").into(),
        )
    })?;
    let data: Value = serde_json::from_str(&data_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(EventRecord {
        timestamp,
        kind,
        data,
    })
}
