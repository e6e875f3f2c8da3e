use rusqlite_migration::{Migrations, M};

/// Schema migrations, tracked through SQLite's user_version pragma.
///
/// The database is an audit/analytics sink: the engine writes to it but
/// never reads matching state back.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: devices, reports, daily limits

CREATE TABLE devices (
    device_id TEXT PRIMARY KEY,
    category TEXT,
    nickname TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE reports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reporter_device_id TEXT NOT NULL,
    reported_device_id TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_reports_reported ON reports(reported_device_id);
CREATE INDEX idx_reports_created ON reports(created_at);

CREATE TABLE daily_limits (
    device_id TEXT NOT NULL,
    date TEXT NOT NULL,
    male_count INTEGER NOT NULL DEFAULT 0,
    female_count INTEGER NOT NULL DEFAULT 0,
    non_binary_count INTEGER NOT NULL DEFAULT 0,
    prefer_not_to_say_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (device_id, date)
);
",
    )])
}
