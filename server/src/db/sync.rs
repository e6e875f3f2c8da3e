//! Write-behind persistence.
//!
//! The engine hands [`PersistCommand`]s to a [`PersistSink`] after its
//! critical section. The sink never blocks: a full or closed channel drops
//! the command with a warning. A single writer task drains the channel and
//! applies each command on the blocking pool. Failures are logged and
//! swallowed; the in-memory engine stays authoritative.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

use super::DbPool;
use crate::error::PersistError;
use crate::matching::{Category, DailyCounts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistCommand {
    /// Upsert keyed by `(device_id, date)`.
    UpsertDailyLimit {
        device_id: String,
        date: NaiveDate,
        counts: DailyCounts,
    },
    /// Upsert keyed by `device_id`. `None` fields keep the stored value.
    UpsertDevice {
        device_id: String,
        category: Option<Category>,
        nickname: Option<String>,
    },
    AppendReport {
        reporter: String,
        reported: String,
        reason: String,
    },
}

impl PersistCommand {
    fn kind(&self) -> &'static str {
        match self {
            Self::UpsertDailyLimit { .. } => "daily_limit",
            Self::UpsertDevice { .. } => "device",
            Self::AppendReport { .. } => "report",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PersistSink {
    tx: Option<mpsc::Sender<PersistCommand>>,
}

impl PersistSink {
    /// Sink backed by a bounded channel; the receiver goes to a writer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PersistCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn submit(&self, command: PersistCommand) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(command) {
            let (reason, command) = match e {
                mpsc::error::TrySendError::Full(c) => ("queue full", c),
                mpsc::error::TrySendError::Closed(c) => ("writer gone", c),
            };
            tracing::warn!(kind = command.kind(), reason, "Dropping persistence command");
        }
    }
}

/// Handle to the running writer task.
#[derive(Debug)]
pub struct WriterHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Refuse further commands, apply everything already queued, then wait
    /// for the task. Sinks still held elsewhere see the channel as closed.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        let _ = self.stop.send(());
        self.task.await
    }
}

/// Spawn the writer task and return a sink feeding it.
pub fn spawn_writer(db: DbPool, capacity: usize) -> (PersistSink, WriterHandle) {
    let (sink, rx) = PersistSink::channel(capacity);
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run_writer(db, rx, stop_rx));
    (sink, WriterHandle { stop, task })
}

/// Apply commands in arrival order until every sink is dropped or a stop is
/// requested. A dropped stop handle leaves the writer running.
pub async fn run_writer(
    db: DbPool,
    mut rx: mpsc::Receiver<PersistCommand>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut detached = false;
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => apply_logged(&db, command).await,
                None => break,
            },
            stopped = &mut stop, if !detached => {
                if stopped.is_err() {
                    detached = true;
                    continue;
                }
                rx.close();
                while let Some(command) = rx.recv().await {
                    apply_logged(&db, command).await;
                }
                break;
            }
        }
    }
    tracing::debug!("Persistence writer stopped");
}

async fn apply_logged(db: &DbPool, command: PersistCommand) {
    let kind = command.kind();
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || apply(&db, &command))
        .await
        .map_err(PersistError::from)
        .and_then(|r| r);
    match result {
        Ok(()) => tracing::debug!(kind, "Persisted"),
        Err(e) => tracing::warn!(kind, error = %e, "Persistence write failed"),
    }
}

/// Apply a single command synchronously.
pub fn apply(db: &DbPool, command: &PersistCommand) -> Result<(), PersistError> {
    let conn = db.lock().map_err(|_| PersistError::LockPoisoned)?;
    let now = Utc::now().to_rfc3339();

    match command {
        PersistCommand::UpsertDailyLimit {
            device_id,
            date,
            counts,
        } => {
            conn.execute(
                "INSERT INTO daily_limits (device_id, date, male_count, female_count, non_binary_count, prefer_not_to_say_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(device_id, date) DO UPDATE SET
                    male_count = excluded.male_count,
                    female_count = excluded.female_count,
                    non_binary_count = excluded.non_binary_count,
                    prefer_not_to_say_count = excluded.prefer_not_to_say_count,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    device_id,
                    date.format("%Y-%m-%d").to_string(),
                    counts.male,
                    counts.female,
                    counts.non_binary,
                    counts.prefer_not_to_say,
                    now
                ],
            )?;
        }
        PersistCommand::UpsertDevice {
            device_id,
            category,
            nickname,
        } => {
            conn.execute(
                "INSERT INTO devices (device_id, category, nickname, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(device_id) DO UPDATE SET
                    category = COALESCE(excluded.category, devices.category),
                    nickname = COALESCE(excluded.nickname, devices.nickname),
                    updated_at = excluded.updated_at",
                rusqlite::params![device_id, category.map(|c| c.as_str()), nickname, now],
            )?;
        }
        PersistCommand::AppendReport {
            reporter,
            reported,
            reason,
        } => {
            conn.execute(
                "INSERT INTO reports (reporter_device_id, reported_device_id, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![reporter, reported, reason, now],
            )?;
        }
    }
    Ok(())
}

/// A stored report row, newest first in listings.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub id: i64,
    pub reporter: String,
    pub reported: String,
    pub reason: Option<String>,
    pub created_at: String,
}

pub fn list_reports(db: &DbPool, limit: u32) -> Result<Vec<ReportRow>, PersistError> {
    let conn = db.lock().map_err(|_| PersistError::LockPoisoned)?;
    let mut stmt = conn.prepare(
        "SELECT id, reporter_device_id, reported_device_id, reason, created_at
         FROM reports ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(ReportRow {
                id: row.get(0)?,
                reporter: row.get(1)?,
                reported: row.get(2)?,
                reason: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
