//! v001 -- Initial schema creation.
//!
//! Creates the `events` and `gallery` tables. Both carry a `day` column
//! (`YYYY-MM-DD`, UTC) so per-day queries and date indexes stay cheap.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Events (feedings, clock synchronizations, warnings)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms INTEGER NOT NULL,             -- UTC milliseconds
    day          TEXT NOT NULL,                -- YYYY-MM-DD (UTC)
    kind         TEXT NOT NULL,                -- feeding | clocksync | warning
    data         TEXT NOT NULL                 -- JSON payload
);

CREATE INDEX IF NOT EXISTS idx_events_day ON events(day, id);

-- ----------------------------------------------------------------
-- Gallery (one row per feeding recording)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS gallery (
    file_timestamp INTEGER PRIMARY KEY NOT NULL, -- UTC milliseconds, also the file stem
    day            TEXT NOT NULL,                -- YYYY-MM-DD (UTC)
    state          INTEGER NOT NULL DEFAULT 0,   -- 0 recording, 1 converted, 2 thumbnailed
    updated_at     TEXT NOT NULL                 -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_gallery_day ON gallery(day, file_timestamp);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
