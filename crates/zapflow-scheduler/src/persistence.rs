//! SQLite-backed persistence for dispatch jobs, work items, sending
//! instances, daily quotas, and the dispatch log.
//!
//! Every write that must be atomic (resolving an item together with its job
//! counters, reserving quota) runs in one transaction on the single
//! connection, so concurrent jobs on the same instance cannot overshoot the
//! daily limit.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use zapflow_core::error::{Result, ZapflowError};

use crate::job::{
    BusinessHours, DispatchJob, DispatchLogEntry, DispatchTarget, ItemStatus, JobKind, JobStatus,
    LogEvent, NewItem, PacingConfig, SendQuota, SendingInstance, WorkItem, hhmm,
};

const JOB_COLUMNS: &str = "id, name, kind, status, instance_id, message_template, message_pool,
    min_delay_secs, max_delay_secs, pause_after, pause_duration_secs, window_start, window_end,
    sent, failed, total, progress, created_at, started_at, completed_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, job_id, target, status, variables, attempted_at, error, created_at";

const INSTANCE_COLUMNS: &str =
    "id, name, token, phone, connected, daily_limit, window_start, window_end, created_at";

/// Per-status item counts of one job.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ItemCounts {
    pub pending: u32,
    pub sent: u32,
    pub failed: u32,
}

/// SQLite persistence store for all dispatch data.
pub struct DispatchDb {
    conn: Mutex<Connection>,
}

fn storage(context: &str, e: impl std::fmt::Display) -> ZapflowError {
    ZapflowError::Storage(format!("{context}: {e}"))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Required timestamp column. A malformed value is a conversion error, not "now".
fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn window_columns(w: Option<&BusinessHours>) -> (Option<String>, Option<String>) {
    match w {
        Some(w) => (Some(hhmm::format(&w.start)), Some(hhmm::format(&w.end))),
        None => (None, None),
    }
}

fn window_from(start: Option<String>, end: Option<String>) -> Option<BusinessHours> {
    match (start, end) {
        (Some(s), Some(e)) => BusinessHours::parse(&s, &e),
        _ => None,
    }
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchJob> {
    let kind: String = row.get(2)?;
    let status: String = row.get(3)?;
    let pool: String = row.get(6)?;
    Ok(DispatchJob {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: JobKind::parse(&kind).unwrap_or(JobKind::Campaign),
        // Unknown status is never resumed.
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
        instance_id: row.get(4)?,
        message_template: row.get(5)?,
        message_pool: serde_json::from_str(&pool).unwrap_or_default(),
        pacing: PacingConfig {
            min_delay_secs: row.get::<_, i64>(7)? as u64,
            max_delay_secs: row.get::<_, i64>(8)? as u64,
            pause_after: row.get(9)?,
            pause_duration_secs: row.get::<_, i64>(10)? as u64,
        },
        window: window_from(row.get(11)?, row.get(12)?),
        sent: row.get(13)?,
        failed: row.get(14)?,
        total: row.get(15)?,
        progress: row.get(16)?,
        created_at: parse_ts(row, 17)?,
        started_at: parse_opt_ts(row.get(18)?),
        completed_at: parse_opt_ts(row.get(19)?),
        updated_at: parse_ts(row, 20)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    let target: String = row.get(2)?;
    let status: String = row.get(3)?;
    let variables: String = row.get(4)?;
    let target: DispatchTarget = serde_json::from_str(&target).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(WorkItem {
        id: row.get(0)?,
        job_id: row.get(1)?,
        target,
        status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Failed),
        variables: serde_json::from_str::<HashMap<String, String>>(&variables).unwrap_or_default(),
        attempted_at: parse_opt_ts(row.get(5)?),
        error: row.get(6)?,
        created_at: parse_ts(row, 7)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<SendingInstance> {
    Ok(SendingInstance {
        id: row.get(0)?,
        name: row.get(1)?,
        token: row.get(2)?,
        phone: row.get(3)?,
        connected: row.get::<_, i32>(4)? != 0,
        daily_limit: row.get(5)?,
        window: window_from(row.get(6)?, row.get(7)?),
        created_at: parse_ts(row, 8)?,
    })
}

fn quota_from_row(row: &Row<'_>) -> rusqlite::Result<SendQuota> {
    let date: String = row.get(3)?;
    Ok(SendQuota {
        instance_id: row.get(0)?,
        sent_today: row.get(1)?,
        daily_limit: row.get(2)?,
        last_reset_date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .unwrap_or(NaiveDate::MIN),
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchLogEntry> {
    let event: String = row.get(3)?;
    Ok(DispatchLogEntry {
        id: row.get(0)?,
        job_id: row.get(1)?,
        item_id: row.get(2)?,
        event: LogEvent::parse(&event).unwrap_or(LogEvent::Error),
        message: row.get(4)?,
        created_at: parse_ts(row, 5)?,
    })
}

/// Progress as an integer percentage of `total` that never moves backwards.
fn monotonic_progress(current: u8, sent: u32, total: u32) -> u8 {
    if total == 0 {
        return current;
    }
    let pct = ((sent as u64 * 100) / total as u64).min(100) as u8;
    current.max(pct)
}

impl DispatchDb {
    /// Open or create the dispatch database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| storage("DB open", e))?;
        // WAL for readers (stats) alongside the writer loops.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    /// In-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage("DB open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| storage("Pragma", e))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| storage("Lock", e))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            -- Sending identities (UAZAPI instances)
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                token TEXT NOT NULL,
                phone TEXT NOT NULL,
                connected INTEGER NOT NULL DEFAULT 1,
                daily_limit INTEGER NOT NULL DEFAULT 200,
                window_start TEXT,
                window_end TEXT,
                created_at TEXT NOT NULL
            );

            -- One row per instance, reset lazily on the first access of a new day
            CREATE TABLE IF NOT EXISTS send_quotas (
                instance_id TEXT PRIMARY KEY REFERENCES instances(id) ON DELETE CASCADE,
                sent_today INTEGER NOT NULL DEFAULT 0,
                daily_limit INTEGER NOT NULL,
                last_reset_date TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,              -- 'campaign', 'warming'
                status TEXT NOT NULL DEFAULT 'draft',
                instance_id TEXT,
                message_template TEXT NOT NULL DEFAULT '',
                message_pool TEXT NOT NULL DEFAULT '[]',   -- JSON array
                min_delay_secs INTEGER NOT NULL,
                max_delay_secs INTEGER NOT NULL,
                pause_after INTEGER NOT NULL,
                pause_duration_secs INTEGER NOT NULL,
                window_start TEXT,
                window_end TEXT,
                sent INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                progress INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES dispatch_jobs(id),
                target TEXT NOT NULL,            -- JSON DispatchTarget
                variables TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                attempted_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_work_items_job_status ON work_items(job_id, status, id);

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS dispatch_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                item_id INTEGER,
                event TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dispatch_logs_job ON dispatch_logs(job_id, id);
            ",
        )
        .map_err(|e| storage("Migration", e))?;
        Ok(())
    }

    // ─── Instances ──────────────────────────────────────────

    /// Insert an instance together with a fresh quota row dated `today`.
    pub fn save_instance(&self, inst: &SendingInstance, today: NaiveDate) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;
        let (ws, we) = window_columns(inst.window.as_ref());
        tx.execute(
            "INSERT INTO instances (id, name, token, phone, connected, daily_limit, window_start, window_end, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                inst.id,
                inst.name,
                inst.token,
                inst.phone,
                inst.connected as i32,
                inst.daily_limit,
                ws,
                we,
                ts(inst.created_at),
            ],
        )
        .map_err(|e| storage("Save instance", e))?;
        tx.execute(
            "INSERT INTO send_quotas (instance_id, sent_today, daily_limit, last_reset_date)
             VALUES (?1, 0, ?2, ?3)",
            params![inst.id, inst.daily_limit, date_str(today)],
        )
        .map_err(|e| storage("Save quota", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<SendingInstance>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
            [id],
            instance_from_row,
        )
        .optional()
        .map_err(|e| storage("Load instance", e))
    }

    pub fn list_instances(&self) -> Result<Vec<SendingInstance>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at, id"))
            .map_err(|e| storage("List instances", e))?;
        let rows = stmt
            .query_map([], instance_from_row)
            .map_err(|e| storage("List instances", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage("List instances", e))
    }

    pub fn connected_instances(&self) -> Result<Vec<SendingInstance>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.connected)
            .collect())
    }

    /// Returns false if the instance does not exist.
    pub fn set_instance_connected(&self, id: &str, connected: bool) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute(
                "UPDATE instances SET connected = ?1 WHERE id = ?2",
                params![connected as i32, id],
            )
            .map_err(|e| storage("Update instance", e))?;
        Ok(n > 0)
    }

    // ─── Quotas ─────────────────────────────────────────────

    /// Current quota for an instance, reset first if it is stamped with another day.
    pub fn quota(&self, instance_id: &str, today: NaiveDate) -> Result<Option<SendQuota>> {
        let conn = self.lock()?;
        Self::reset_quota_if_stale(&conn, instance_id, today)?;
        conn.query_row(
            "SELECT instance_id, sent_today, daily_limit, last_reset_date FROM send_quotas WHERE instance_id = ?1",
            [instance_id],
            quota_from_row,
        )
        .optional()
        .map_err(|e| storage("Load quota", e))
    }

    fn reset_quota_if_stale(conn: &Connection, instance_id: &str, today: NaiveDate) -> Result<()> {
        conn.execute(
            "UPDATE send_quotas SET sent_today = 0, last_reset_date = ?1
             WHERE instance_id = ?2 AND last_reset_date <> ?1",
            params![date_str(today), instance_id],
        )
        .map_err(|e| storage("Reset quota", e))?;
        Ok(())
    }

    /// Atomically claim one send slot. Returns false when the daily limit is
    /// reached or the instance has no quota row.
    pub fn try_reserve_quota(&self, instance_id: &str, today: NaiveDate) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;
        Self::reset_quota_if_stale(&tx, instance_id, today)?;
        let n = tx
            .execute(
                "UPDATE send_quotas SET sent_today = sent_today + 1
                 WHERE instance_id = ?1 AND sent_today < daily_limit",
                [instance_id],
            )
            .map_err(|e| storage("Reserve quota", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok(n == 1)
    }

    /// Give back a slot reserved on `day` for a send that did not go through.
    /// A counter already rolled over to a later day is left alone.
    pub fn release_quota(&self, instance_id: &str, day: NaiveDate) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE send_quotas SET sent_today = sent_today - 1
             WHERE instance_id = ?1 AND last_reset_date = ?2 AND sent_today > 0",
            params![instance_id, date_str(day)],
        )
        .map_err(|e| storage("Release quota", e))?;
        Ok(())
    }

    // ─── Jobs ───────────────────────────────────────────────

    pub fn insert_job(&self, job: &DispatchJob) -> Result<()> {
        let conn = self.lock()?;
        let (ws, we) = window_columns(job.window.as_ref());
        let pool = serde_json::to_string(&job.message_pool).map_err(|e| storage("Serialize", e))?;
        conn.execute(
            &format!(
                "INSERT INTO dispatch_jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                job.id,
                job.name,
                job.kind.as_str(),
                job.status.as_str(),
                job.instance_id,
                job.message_template,
                pool,
                job.pacing.min_delay_secs as i64,
                job.pacing.max_delay_secs as i64,
                job.pacing.pause_after,
                job.pacing.pause_duration_secs as i64,
                ws,
                we,
                job.sent,
                job.failed,
                job.total,
                job.progress,
                ts(job.created_at),
                job.started_at.map(ts),
                job.completed_at.map(ts),
                ts(job.updated_at),
            ],
        )
        .map_err(|e| storage("Save job", e))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<DispatchJob>> {
        let conn = self.lock()?;
        Self::get_job_with(&conn, id)
    }

    fn get_job_with(conn: &Connection, id: &str) -> Result<Option<DispatchJob>> {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE id = ?1"),
            [id],
            job_from_row,
        )
        .optional()
        .map_err(|e| storage("Load job", e))
    }

    pub fn list_jobs(&self) -> Result<Vec<DispatchJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM dispatch_jobs ORDER BY created_at DESC"))
            .map_err(|e| storage("List jobs", e))?;
        let rows = stmt
            .query_map([], job_from_row)
            .map_err(|e| storage("List jobs", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage("List jobs", e))
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<DispatchJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM dispatch_jobs WHERE status = ?1 ORDER BY created_at"
            ))
            .map_err(|e| storage("List jobs", e))?;
        let rows = stmt
            .query_map([status.as_str()], job_from_row)
            .map_err(|e| storage("List jobs", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage("List jobs", e))
    }

    /// Compare-and-set status change. Only applied when the current status is
    /// one of `from` and the transition is allowed; returns whether it was.
    /// Stamps `started_at` on first run and `completed_at` on terminal states.
    pub fn update_status(&self, id: &str, from: &[JobStatus], to: JobStatus) -> Result<bool> {
        let conn = self.lock()?;
        let Some(job) = Self::get_job_with(&conn, id)? else {
            return Err(ZapflowError::not_found("job", id));
        };
        if !from.contains(&job.status) || !job.status.can_transition_to(to) {
            return Ok(false);
        }
        let now = ts(Utc::now());
        let progress = if to == JobStatus::Completed { 100 } else { job.progress };
        conn.execute(
            "UPDATE dispatch_jobs SET status = ?1, progress = ?2, updated_at = ?3,
                started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL THEN ?3 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ('completed', 'failed') THEN ?3 ELSE completed_at END
             WHERE id = ?4",
            params![to.as_str(), progress, now, id],
        )
        .map_err(|e| storage("Update job status", e))?;
        Ok(true)
    }

    /// Snapshot a business-hour window onto the job.
    pub fn set_job_window(&self, id: &str, window: Option<&BusinessHours>) -> Result<()> {
        let conn = self.lock()?;
        let (ws, we) = window_columns(window);
        conn.execute(
            "UPDATE dispatch_jobs SET window_start = ?1, window_end = ?2, updated_at = ?3 WHERE id = ?4",
            params![ws, we, ts(Utc::now()), id],
        )
        .map_err(|e| storage("Update job window", e))?;
        Ok(())
    }

    // ─── Work items ─────────────────────────────────────────

    /// Insert pending items and set the job's total to its item count.
    /// Returns `(inserted, new_total)`. Terminal jobs are rejected.
    pub fn attach_items(&self, job_id: &str, items: &[NewItem]) -> Result<(u32, u32)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;
        let Some(job) = Self::get_job_with(&tx, job_id)? else {
            return Err(ZapflowError::not_found("job", job_id));
        };
        if job.status.is_terminal() {
            return Err(ZapflowError::InvalidState(format!(
                "cannot add items to a {} job",
                job.status
            )));
        }
        let now = ts(Utc::now());
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO work_items (job_id, target, variables, status, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                )
                .map_err(|e| storage("Insert items", e))?;
            for item in items {
                let target = serde_json::to_string(&item.target).map_err(|e| storage("Serialize", e))?;
                let vars = serde_json::to_string(&item.variables).map_err(|e| storage("Serialize", e))?;
                stmt.execute(params![job_id, target, vars, now])
                    .map_err(|e| storage("Insert items", e))?;
            }
        }
        let total: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM work_items WHERE job_id = ?1",
                [job_id],
                |r| r.get(0),
            )
            .map_err(|e| storage("Count items", e))?;
        tx.execute(
            "UPDATE dispatch_jobs SET total = ?1, updated_at = ?2 WHERE id = ?3",
            params![total, now, job_id],
        )
        .map_err(|e| storage("Update total", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok((items.len() as u32, total))
    }

    /// Oldest pending item of the job, in insertion order.
    pub fn next_pending(&self, job_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE job_id = ?1 AND status = 'pending' ORDER BY id LIMIT 1"
            ),
            [job_id],
            item_from_row,
        )
        .optional()
        .map_err(|e| storage("Next pending", e))
    }

    pub fn get_item(&self, id: i64) -> Result<Option<WorkItem>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            [id],
            item_from_row,
        )
        .optional()
        .map_err(|e| storage("Load item", e))
    }

    /// Move a pending item to `outcome` and bump the owning job's counters in
    /// one transaction. Returns the updated job, or `None` if the item was no
    /// longer pending (nothing changes in that case).
    pub fn resolve_item(
        &self,
        item_id: i64,
        outcome: ItemStatus,
        detail: Option<&str>,
    ) -> Result<Option<DispatchJob>> {
        if outcome == ItemStatus::Pending {
            return Err(ZapflowError::Validation("an item cannot be resolved to pending".into()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;
        let job_id: Option<String> = tx
            .query_row("SELECT job_id FROM work_items WHERE id = ?1", [item_id], |r| r.get(0))
            .optional()
            .map_err(|e| storage("Load item", e))?;
        let Some(job_id) = job_id else {
            return Err(ZapflowError::not_found("item", item_id.to_string()));
        };
        let now = ts(Utc::now());
        let changed = tx
            .execute(
                "UPDATE work_items SET status = ?1, attempted_at = ?2, error = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![outcome.as_str(), now, detail, item_id],
            )
            .map_err(|e| storage("Resolve item", e))?;
        if changed == 0 {
            tx.commit().map_err(|e| storage("Commit", e))?;
            return Ok(None);
        }
        let Some(mut job) = Self::get_job_with(&tx, &job_id)? else {
            return Err(ZapflowError::not_found("job", job_id));
        };
        match outcome {
            ItemStatus::Sent => {
                job.sent += 1;
                job.progress = monotonic_progress(job.progress, job.sent, job.total);
            }
            _ => job.failed += 1,
        }
        job.updated_at = Utc::now();
        tx.execute(
            "UPDATE dispatch_jobs SET sent = ?1, failed = ?2, progress = ?3, updated_at = ?4 WHERE id = ?5",
            params![job.sent, job.failed, job.progress, ts(job.updated_at), job.id],
        )
        .map_err(|e| storage("Update counters", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok(Some(job))
    }

    pub fn item_counts(&self, job_id: &str) -> Result<ItemCounts> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM work_items WHERE job_id = ?1 GROUP BY status")
            .map_err(|e| storage("Count items", e))?;
        let rows = stmt
            .query_map([job_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))
            .map_err(|e| storage("Count items", e))?;
        let mut counts = ItemCounts::default();
        for row in rows {
            let (status, n) = row.map_err(|e| storage("Count items", e))?;
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Pending) => counts.pending = n,
                Some(ItemStatus::Sent) => counts.sent = n,
                Some(ItemStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Raw SQL against the live connection, for simulating store failures.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?
            .execute_batch(sql)
            .map_err(|e| storage("Raw SQL", e))
    }

    // ─── Dispatch log ───────────────────────────────────────

    pub fn append_log(
        &self,
        job_id: &str,
        item_id: Option<i64>,
        event: LogEvent,
        message: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dispatch_logs (job_id, item_id, event, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job_id, item_id, event.as_str(), message, ts(Utc::now())],
        )
        .map_err(|e| storage("Append log", e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first.
    pub fn recent_logs(&self, job_id: &str, limit: usize) -> Result<Vec<DispatchLogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, item_id, event, message, created_at FROM dispatch_logs
                 WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| storage("Recent logs", e))?;
        let rows = stmt
            .query_map(params![job_id, limit as i64], log_from_row)
            .map_err(|e| storage("Recent logs", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage("Recent logs", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewInstance, NewJob};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
    }

    fn instance(db: &DispatchDb, limit: u32) -> SendingInstance {
        let inst = SendingInstance::register(NewInstance {
            name: "chip".into(),
            token: "tok".into(),
            phone: "5511900000001".into(),
            connected: true,
            daily_limit: limit,
            window: BusinessHours::parse("08:00", "20:00"),
        });
        db.save_instance(&inst, today()).unwrap();
        inst
    }

    fn job(db: &DispatchDb) -> DispatchJob {
        let job = DispatchJob::draft(
            NewJob {
                name: "promo".into(),
                kind: JobKind::Campaign,
                instance_id: Some("i".into()),
                message_template: "Oi {{name}}".into(),
                message_pool: vec![],
                pacing: None,
                window: None,
            },
            &PacingConfig::default(),
        );
        db.insert_job(&job).unwrap();
        job
    }

    #[test]
    fn test_job_roundtrip() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        let loaded = db.get_job(&j.id).unwrap().unwrap();
        assert_eq!(loaded.name, "promo");
        assert_eq!(loaded.status, JobStatus::Draft);
        assert_eq!(loaded.pacing, PacingConfig::default());
        assert!(db.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_instance_window_persisted() {
        let db = DispatchDb::open_in_memory().unwrap();
        let inst = instance(&db, 10);
        let loaded = db.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(loaded.window, BusinessHours::parse("08:00", "20:00"));
        assert_eq!(loaded.token, "tok");
    }

    #[test]
    fn test_attach_sets_total() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        let (n, total) = db
            .attach_items(&j.id, &[NewItem::contact("1199990000", None), NewItem::contact("1199990001", None)])
            .unwrap();
        assert_eq!((n, total), (2, 2));
        let (_, total) = db.attach_items(&j.id, &[NewItem::contact("1199990002", None)]).unwrap();
        assert_eq!(total, 3);
        assert_eq!(db.get_job(&j.id).unwrap().unwrap().total, 3);
        assert_eq!(db.item_counts(&j.id).unwrap().pending, 3);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        db.attach_items(&j.id, &[NewItem::contact("1199990000", None)]).unwrap();
        let item = db.next_pending(&j.id).unwrap().unwrap();

        let updated = db.resolve_item(item.id, ItemStatus::Sent, None).unwrap().unwrap();
        assert_eq!(updated.sent, 1);
        assert_eq!(updated.progress, 100);

        assert!(db.resolve_item(item.id, ItemStatus::Failed, Some("late")).unwrap().is_none());
        let item = db.get_item(item.id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Sent);
        assert!(item.error.is_none());
        let j = db.get_job(&j.id).unwrap().unwrap();
        assert_eq!((j.sent, j.failed), (1, 0));
    }

    #[test]
    fn test_quota_reserve_until_limit() {
        let db = DispatchDb::open_in_memory().unwrap();
        let inst = instance(&db, 2);
        assert!(db.try_reserve_quota(&inst.id, today()).unwrap());
        assert!(db.try_reserve_quota(&inst.id, today()).unwrap());
        assert!(!db.try_reserve_quota(&inst.id, today()).unwrap());

        db.release_quota(&inst.id, today()).unwrap();
        assert_eq!(db.quota(&inst.id, today()).unwrap().unwrap().sent_today, 1);
    }

    #[test]
    fn test_release_skips_rolled_over_day() {
        let db = DispatchDb::open_in_memory().unwrap();
        let inst = instance(&db, 2);
        assert!(db.try_reserve_quota(&inst.id, today()).unwrap());

        // Another job already opened the next day before the refund lands.
        let tomorrow = today().succ_opt().unwrap();
        assert!(db.try_reserve_quota(&inst.id, tomorrow).unwrap());
        db.release_quota(&inst.id, today()).unwrap();

        let q = db.quota(&inst.id, tomorrow).unwrap().unwrap();
        assert_eq!(q.sent_today, 1);
        assert!(db.try_reserve_quota(&inst.id, tomorrow).unwrap());
        assert!(!db.try_reserve_quota(&inst.id, tomorrow).unwrap());
    }

    #[test]
    fn test_quota_resets_next_day() {
        let db = DispatchDb::open_in_memory().unwrap();
        let inst = instance(&db, 1);
        assert!(db.try_reserve_quota(&inst.id, today()).unwrap());
        assert!(!db.try_reserve_quota(&inst.id, today()).unwrap());

        let tomorrow = today().succ_opt().unwrap();
        assert!(db.try_reserve_quota(&inst.id, tomorrow).unwrap());
        let q = db.quota(&inst.id, tomorrow).unwrap().unwrap();
        assert_eq!(q.last_reset_date, tomorrow);
        assert_eq!(q.sent_today, 1);
    }

    #[test]
    fn test_update_status_compare_and_set() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        assert!(!db.update_status(&j.id, &[JobStatus::Running], JobStatus::Paused).unwrap());
        assert!(db.update_status(&j.id, &[JobStatus::Draft], JobStatus::Running).unwrap());
        let running = db.get_job(&j.id).unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(db.update_status(&j.id, &[JobStatus::Running], JobStatus::Completed).unwrap());
        let done = db.get_job(&j.id).unwrap().unwrap();
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());
        assert!(!db.update_status(&j.id, &[JobStatus::Completed], JobStatus::Running).unwrap());
    }

    #[test]
    fn test_attach_rejected_on_terminal_job() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        db.update_status(&j.id, &[JobStatus::Draft], JobStatus::Running).unwrap();
        db.update_status(&j.id, &[JobStatus::Running], JobStatus::Failed).unwrap();
        let err = db.attach_items(&j.id, &[NewItem::contact("1", None)]).unwrap_err();
        assert!(matches!(err, ZapflowError::InvalidState(_)));
    }

    #[test]
    fn test_logs_newest_first() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        db.append_log(&j.id, None, LogEvent::Created, "created").unwrap();
        db.append_log(&j.id, Some(7), LogEvent::Sent, "sent").unwrap();
        let logs = db.recent_logs(&j.id, 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event, LogEvent::Sent);
        assert_eq!(logs[0].item_id, Some(7));
        assert_eq!(db.recent_logs(&j.id, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let db = DispatchDb::open_in_memory().unwrap();
        let j = job(&db);
        db.lock()
            .unwrap()
            .execute("UPDATE dispatch_jobs SET created_at = 'yesterday-ish' WHERE id = ?1", [&j.id])
            .unwrap();
        let err = db.get_job(&j.id).unwrap_err();
        assert!(matches!(err, ZapflowError::Storage(_)));
    }

    #[test]
    fn test_progress_never_decreases() {
        assert_eq!(monotonic_progress(0, 1, 4), 25);
        // Total grew after items were attached mid-run.
        assert_eq!(monotonic_progress(50, 2, 8), 50);
        assert_eq!(monotonic_progress(10, 0, 0), 10);
    }
}
